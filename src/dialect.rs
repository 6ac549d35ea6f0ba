// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL dialect translation.
//!
//! Every statement the engine replays is first written in the **reference
//! dialect** (SQLite): `?` placeholders, `datetime('now')` style time calls,
//! `INTEGER PRIMARY KEY AUTOINCREMENT` identity columns. Before execution it is
//! rewritten for the remote store's dialect.
//!
//! # Passes
//!
//! | Pass | SQLite | PostgreSQL | MySQL |
//! |------|--------|------------|-------|
//! | placeholders | `?` | `$1, $2, …` | `?` |
//! | `datetime('now')` | as-is | `NOW()` | `UTC_TIMESTAMP()` |
//! | `datetime('now','localtime')` | as-is | `LOCALTIMESTAMP` | `NOW()` |
//! | `date('now')` | as-is | `CURRENT_DATE` | `UTC_DATE()` |
//! | `date('now','localtime')` | as-is | `CURRENT_DATE` | `CURDATE()` |
//! | `time('now')` | as-is | `CURRENT_TIME` | `UTC_TIME()` |
//! | `time('now','localtime')` | as-is | `LOCALTIME` | `CURTIME()` |
//! | identity | as-is | `SERIAL PRIMARY KEY` | `INTEGER PRIMARY KEY AUTO_INCREMENT` |
//!
//! All passes are pure string functions. None of them rewrite text inside
//! string literals, quoted identifiers or comments, so a `?` in
//! `'what?'` never becomes a placeholder.
//!
//! ```rust
//! use oplog_replicator::Dialect;
//!
//! let sql = "UPDATE kategori SET nama = ?, diubah = datetime('now') WHERE id = ?";
//! assert_eq!(
//!     Dialect::Postgres.translate(sql),
//!     "UPDATE kategori SET nama = $1, diubah = NOW() WHERE id = $2"
//! );
//! ```

use crate::error::{ReplicationError, Result};
use std::fmt;

/// SQL dialect of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Reference dialect. Templates are written in it.
    Sqlite,
    Postgres,
    MySql,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::MySql => write!(f, "mysql"),
        }
    }
}

impl Dialect {
    /// Infer the dialect from a connection string scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        let lower = url.trim_start().to_ascii_lowercase();
        if lower.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Ok(Dialect::MySql)
        } else {
            let scheme = lower.split(':').next().unwrap_or_default();
            Err(ReplicationError::Config(format!(
                "unsupported remote store scheme: {:?}",
                scheme
            )))
        }
    }

    /// Whether `INSERT … RETURNING` is available.
    pub fn supports_returning(&self) -> bool {
        !matches!(self, Dialect::MySql)
    }

    /// Render an insert that does nothing when the row already exists.
    ///
    /// `values` holds one SQL fragment per column, usually `?`. Placeholders
    /// are left as `?`; run the result through [`translate`](Self::translate)
    /// before executing.
    pub fn insert_ignore(&self, table: &str, columns: &[&str], values: &[&str], returning: Option<&str>) -> String {
        let cols = columns.join(", ");
        let marks = values.join(", ");
        match self {
            Dialect::MySql => format!("INSERT IGNORE INTO {} ({}) VALUES ({})", table, cols, marks),
            Dialect::Sqlite | Dialect::Postgres => {
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
                    table, cols, marks
                );
                if let Some(col) = returning {
                    sql.push_str(" RETURNING ");
                    sql.push_str(col);
                }
                sql
            }
        }
    }

    /// Apply every pass: placeholders, time functions, identity columns.
    pub fn translate(&self, sql: &str) -> String {
        if *self == Dialect::Sqlite {
            return sql.to_string();
        }
        let sql = self.rewrite_identity(sql);
        let sql = self.rewrite_timestamps(&sql);
        self.rewrite_placeholders(&sql)
    }

    /// Number `?` placeholders as `$1..$N` for PostgreSQL.
    pub fn rewrite_placeholders(&self, sql: &str) -> String {
        if *self != Dialect::Postgres {
            return sql.to_string();
        }
        let mask = code_mask(sql);
        let mut out = String::with_capacity(sql.len() + 8);
        let mut last = 0;
        let mut n = 0;
        for (i, b) in sql.bytes().enumerate() {
            if b == b'?' && mask[i] {
                out.push_str(&sql[last..i]);
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
                last = i + 1;
            }
        }
        out.push_str(&sql[last..]);
        out
    }

    /// Replace SQLite `datetime/date/time('now'[, modifier])` calls.
    pub fn rewrite_timestamps(&self, sql: &str) -> String {
        if *self == Dialect::Sqlite {
            return sql.to_string();
        }
        let bytes = sql.as_bytes();
        let mask = code_mask(sql);
        let mut out = String::with_capacity(sql.len());
        let mut last = 0;
        let mut i = 0;
        while i < bytes.len() {
            if mask[i] && starts_word(bytes, i) {
                if let Some((end, call)) = match_time_call(bytes, i) {
                    out.push_str(&sql[last..i]);
                    out.push_str(self.time_function(call));
                    last = end;
                    i = end;
                    continue;
                }
            }
            i += 1;
        }
        out.push_str(&sql[last..]);
        out
    }

    /// Rewrite `INTEGER PRIMARY KEY AUTOINCREMENT` column definitions.
    pub fn rewrite_identity(&self, sql: &str) -> String {
        let replacement = match self {
            Dialect::Sqlite => return sql.to_string(),
            Dialect::Postgres => "SERIAL PRIMARY KEY",
            Dialect::MySql => "INTEGER PRIMARY KEY AUTO_INCREMENT",
        };
        let bytes = sql.as_bytes();
        let mask = code_mask(sql);
        let mut out = String::with_capacity(sql.len());
        let mut last = 0;
        let mut i = 0;
        while i < bytes.len() {
            if mask[i] && starts_word(bytes, i) {
                if let Some(end) = match_words(bytes, &mask, i, IDENTITY_WORDS) {
                    out.push_str(&sql[last..i]);
                    out.push_str(replacement);
                    last = end;
                    i = end;
                    continue;
                }
            }
            i += 1;
        }
        out.push_str(&sql[last..]);
        out
    }

    fn time_function(&self, call: TimeCall) -> &'static str {
        use TimeCall::*;
        match (self, call) {
            (Dialect::Postgres, DateTime { local: false }) => "NOW()",
            (Dialect::Postgres, DateTime { local: true }) => "LOCALTIMESTAMP",
            (Dialect::Postgres, Date { .. }) => "CURRENT_DATE",
            (Dialect::Postgres, Time { local: false }) => "CURRENT_TIME",
            (Dialect::Postgres, Time { local: true }) => "LOCALTIME",
            (Dialect::MySql, DateTime { local: false }) => "UTC_TIMESTAMP()",
            (Dialect::MySql, DateTime { local: true }) => "NOW()",
            (Dialect::MySql, Date { local: false }) => "UTC_DATE()",
            (Dialect::MySql, Date { local: true }) => "CURDATE()",
            (Dialect::MySql, Time { local: false }) => "UTC_TIME()",
            (Dialect::MySql, Time { local: true }) => "CURTIME()",
            // Never reached: sqlite returns before matching.
            (Dialect::Sqlite, DateTime { .. }) => "datetime('now')",
            (Dialect::Sqlite, Date { .. }) => "date('now')",
            (Dialect::Sqlite, Time { .. }) => "time('now')",
        }
    }
}

const IDENTITY_WORDS: &[&str] = &["INTEGER", "PRIMARY", "KEY", "AUTOINCREMENT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeCall {
    DateTime { local: bool },
    Date { local: bool },
    Time { local: bool },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scanner
// ═══════════════════════════════════════════════════════════════════════════════

/// Mark each byte as plain SQL (`true`) or as part of a literal, quoted
/// identifier or comment (`false`).
///
/// Every delimiter is ASCII, so scanning bytes is safe for UTF-8 input.
fn code_mask(sql: &str) -> Vec<bool> {
    let b = sql.as_bytes();
    let len = b.len();
    let mut mask = vec![true; len];
    let mut i = 0;
    while i < len {
        let start = i;
        match b[i] {
            b'\'' => {
                i += 1;
                while i < len {
                    match b[i] {
                        b'\'' if i + 1 < len && b[i + 1] == b'\'' => i += 2,
                        b'\'' => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
            }
            q @ (b'"' | b'`') => {
                i += 1;
                while i < len {
                    if b[i] == q {
                        if i + 1 < len && b[i + 1] == q {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if i + 1 < len && b[i + 1] == b'-' => {
                while i < len && b[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < len && b[i + 1] == b'*' => {
                i += 2;
                while i < len && !(b[i] == b'*' && i + 1 < len && b[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(len);
            }
            _ => {
                i += 1;
                continue;
            }
        }
        let end = i.min(len);
        mask[start..end].iter_mut().for_each(|m| *m = false);
    }
    mask
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn starts_word(b: &[u8], i: usize) -> bool {
    is_ident_byte(b[i]) && (i == 0 || !(is_ident_byte(b[i - 1]) || b[i - 1] == b'.'))
}

fn skip_ws(b: &[u8], mut i: usize) -> usize {
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn read_word(b: &[u8], i: usize) -> (usize, &[u8]) {
    let mut end = i;
    while end < b.len() && is_ident_byte(b[end]) {
        end += 1;
    }
    (end, &b[i..end])
}

/// Read a simple `'…'` literal, returning the end offset and its contents.
fn read_literal(b: &[u8], i: usize) -> Option<(usize, &[u8])> {
    if b.get(i) != Some(&b'\'') {
        return None;
    }
    let body = i + 1;
    let close = b[body..].iter().position(|&c| c == b'\'')? + body;
    Some((close + 1, &b[body..close]))
}

/// Match `datetime|date|time ( 'now' [, 'localtime'|'utc'] )` at `i`.
fn match_time_call(b: &[u8], i: usize) -> Option<(usize, TimeCall)> {
    let (end, name) = read_word(b, i);
    let kind = if name.eq_ignore_ascii_case(b"datetime") {
        0
    } else if name.eq_ignore_ascii_case(b"date") {
        1
    } else if name.eq_ignore_ascii_case(b"time") {
        2
    } else {
        return None;
    };

    let mut j = skip_ws(b, end);
    if b.get(j) != Some(&b'(') {
        return None;
    }
    j = skip_ws(b, j + 1);
    let (after, arg) = read_literal(b, j)?;
    if !arg.eq_ignore_ascii_case(b"now") {
        return None;
    }
    j = skip_ws(b, after);

    let mut local = false;
    if b.get(j) == Some(&b',') {
        j = skip_ws(b, j + 1);
        let (after, modifier) = read_literal(b, j)?;
        if modifier.eq_ignore_ascii_case(b"localtime") {
            local = true;
        } else if !modifier.eq_ignore_ascii_case(b"utc") {
            return None;
        }
        j = skip_ws(b, after);
    }
    if b.get(j) != Some(&b')') {
        return None;
    }

    let call = match kind {
        0 => TimeCall::DateTime { local },
        1 => TimeCall::Date { local },
        _ => TimeCall::Time { local },
    };
    Some((j + 1, call))
}

/// Match a whitespace-separated keyword sequence (case-insensitive) at `i`.
fn match_words(b: &[u8], mask: &[bool], i: usize, words: &[&str]) -> Option<usize> {
    let mut j = i;
    for (n, word) in words.iter().enumerate() {
        if n > 0 {
            let next = skip_ws(b, j);
            if next == j {
                return None;
            }
            j = next;
        }
        if j >= b.len() || !mask[j] {
            return None;
        }
        let (end, found) = read_word(b, j);
        if !found.eq_ignore_ascii_case(word.as_bytes()) {
            return None;
        }
        j = end;
    }
    Some(j)
}
