// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed change payloads.
//!
//! A [`Payload`] is the ordered list of `(column, value)` pairs a mutation
//! wrote locally. Column names are checked when they are added, so a payload
//! that exists can always be turned into a statement.
//!
//! # Storage Format
//!
//! Payloads are stored in the operation log as a flat JSON object, keys in
//! insertion order:
//!
//! ```json
//! {"nama": "Bumbu", "aktif": true, "harga": 12500, "foto": {"$blob": "89504e47"}}
//! ```
//!
//! Binary values are the only nested form, wrapped as `{"$blob": "<hex>"}`.
//! Any other nested object or array is rejected.

use crate::error::{ReplicationError, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

const BLOB_KEY: &str = "$blob";

/// Check that `name` is a plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn check_identifier(what: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(ReplicationError::InvalidInput(format!(
            "{} is not a plain identifier: {:?}",
            what, name
        )))
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl ColumnValue {
    /// Convert a JSON scalar. Nested values are a serialization error.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(ColumnValue::Null),
            Value::Bool(b) => Ok(ColumnValue::Bool(*b)),
            Value::String(s) => Ok(ColumnValue::Text(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ColumnValue::Integer(i))
                } else if n.is_u64() {
                    Err(ReplicationError::Serialization(format!(
                        "integer out of range: {}",
                        n
                    )))
                } else {
                    n.as_f64()
                        .map(ColumnValue::Real)
                        .ok_or_else(|| ReplicationError::Serialization(format!("bad number: {}", n)))
                }
            }
            Value::Object(map) if map.len() == 1 => match map.get(BLOB_KEY) {
                Some(Value::String(h)) => hex::decode(h)
                    .map(ColumnValue::Blob)
                    .map_err(|e| ReplicationError::Serialization(format!("bad blob: {}", e))),
                _ => Err(nested_error()),
            },
            Value::Object(_) | Value::Array(_) => Err(nested_error()),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Integer(i) => Value::from(*i),
            ColumnValue::Real(f) => Value::from(*f),
            ColumnValue::Text(s) => Value::String(s.clone()),
            ColumnValue::Bool(b) => Value::Bool(*b),
            ColumnValue::Blob(bytes) => {
                let mut map = serde_json::Map::new();
                map.insert(BLOB_KEY.to_string(), Value::String(hex::encode(bytes)));
                Value::Object(map)
            }
        }
    }
}

fn nested_error() -> ReplicationError {
    ReplicationError::Serialization("nested arrays and objects are not supported".to_string())
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Integer(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        ColumnValue::Integer(v as i64)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Real(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for ColumnValue {
    fn from(v: Vec<u8>) -> Self {
        ColumnValue::Blob(v)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}

/// Ordered column/value pairs describing one change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    columns: Vec<(String, ColumnValue)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column, replacing any earlier value for the same name.
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<ColumnValue>) -> Result<()> {
        let column = column.into();
        check_identifier("column", &column)?;
        let value = value.into();
        if let ColumnValue::Real(f) = value {
            if !f.is_finite() {
                return Err(ReplicationError::Serialization(format!(
                    "column {} holds a non-finite number ({})",
                    column, f
                )));
            }
        }
        match self.columns.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
        Ok(())
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, column: impl Into<String>, value: impl Into<ColumnValue>) -> Result<Self> {
        self.push(column, value)?;
        Ok(self)
    }

    /// Build from a flat JSON object.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            ReplicationError::Serialization("payload must be a JSON object".to_string())
        })?;
        let mut payload = Payload::new();
        for (column, v) in map {
            payload.push(column.as_str(), ColumnValue::from_json(v)?)?;
        }
        Ok(payload)
    }

    /// Encode for storage in the operation log.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored payload.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.columns.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Copy without `column` (matched case-insensitively).
    pub fn without(&self, column: &str) -> Payload {
        Payload {
            columns: self
                .columns
                .iter()
                .filter(|(c, _)| !c.eq_ignore_ascii_case(column))
                .cloned()
                .collect(),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, value) in &self.columns {
            map.serialize_entry(column, &value.to_json())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(PayloadVisitor)
    }
}

struct PayloadVisitor;

impl<'de> Visitor<'de> for PayloadVisitor {
    type Value = Payload;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a flat JSON object of column values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Payload, A::Error> {
        use serde::de::Error;

        let mut payload = Payload::new();
        while let Some((column, value)) = access.next_entry::<String, Value>()? {
            let value = ColumnValue::from_json(&value).map_err(A::Error::custom)?;
            payload.push(column, value).map_err(A::Error::custom)?;
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("nama"));
        assert!(is_identifier("_id2"));
        assert!(is_identifier("KategoriProduk"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2nd"));
        assert!(!is_identifier("nama barang"));
        assert!(!is_identifier("id;--"));
        assert!(!is_identifier("\"id\""));
    }

    #[test]
    fn test_push_rejects_bad_column() {
        let mut payload = Payload::new();
        let err = payload.push("nama = 1; --", "x").unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidInput(_)));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_push_replaces_duplicate() {
        let payload = Payload::new()
            .with("nama", "Bumbu")
            .unwrap()
            .with("aktif", true)
            .unwrap()
            .with("nama", "Rempah")
            .unwrap();
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.get("nama"), Some(&ColumnValue::Text("Rempah".into())));
        let cols: Vec<&str> = payload.iter().map(|(c, _)| c).collect();
        assert_eq!(cols, vec!["nama", "aktif"]);
    }

    #[test]
    fn test_encode_keeps_order() {
        let payload = Payload::new()
            .with("zeta", 1i64)
            .unwrap()
            .with("alpha", Option::<String>::None)
            .unwrap()
            .with("mid", 2.5)
            .unwrap();
        assert_eq!(payload.encode().unwrap(), r#"{"zeta":1,"alpha":null,"mid":2.5}"#);
    }

    #[test]
    fn test_decode_keeps_order() {
        let payload = Payload::decode(r#"{"b":"x","a":false,"c":7}"#).unwrap();
        let cols: Vec<&str> = payload.iter().map(|(c, _)| c).collect();
        assert_eq!(cols, vec!["b", "a", "c"]);
        assert_eq!(payload.get("a"), Some(&ColumnValue::Bool(false)));
        assert_eq!(payload.get("c"), Some(&ColumnValue::Integer(7)));
    }

    #[test]
    fn test_blob_storage_form() {
        let payload = Payload::new().with("foto", vec![0x89u8, 0x50, 0x4e]).unwrap();
        let text = payload.encode().unwrap();
        assert_eq!(text, r#"{"foto":{"$blob":"89504e"}}"#);
        assert_eq!(Payload::decode(&text).unwrap(), payload);
    }

    #[test]
    fn test_from_json_rejects_nested() {
        let err = Payload::from_json(&json!({"nama": "Bumbu", "tags": ["a"]})).unwrap_err();
        assert!(matches!(err, ReplicationError::Serialization(_)));

        let err = Payload::from_json(&json!({"meta": {"k": 1}})).unwrap_err();
        assert!(matches!(err, ReplicationError::Serialization(_)));

        let err = Payload::from_json(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, ReplicationError::Serialization(_)));
    }

    #[test]
    fn test_from_json_scalars() {
        let payload = Payload::from_json(&json!({"nama": "Bumbu"})).unwrap();
        assert_eq!(payload.get("nama"), Some(&ColumnValue::Text("Bumbu".into())));

        let err = Payload::from_json(&json!({"n": u64::MAX})).unwrap_err();
        assert!(matches!(err, ReplicationError::Serialization(_)));
    }

    #[test]
    fn test_decode_garbage_is_serialization_fault() {
        assert!(matches!(
            Payload::decode("not json at all"),
            Err(ReplicationError::Serialization(_))
        ));
        assert!(matches!(
            Payload::decode(r#"{"bad column": 1}"#),
            Err(ReplicationError::Serialization(_))
        ));
    }

    #[test]
    fn test_without_identity() {
        let payload = Payload::new()
            .with("ID", 7i64)
            .unwrap()
            .with("nama", "Bumbu")
            .unwrap();
        let stripped = payload.without("id");
        assert_eq!(stripped.len(), 1);
        assert!(stripped.get("nama").is_some());
        assert_eq!(payload.len(), 2);
    }

    #[test]
    fn test_push_rejects_non_finite_real() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut payload = Payload::new();
            let err = payload.push("harga", bad).unwrap_err();
            assert!(matches!(err, ReplicationError::Serialization(_)));
            assert!(payload.is_empty());
        }
        let payload = Payload::new().with("harga", 12.5).unwrap();
        assert_eq!(payload.get("harga"), Some(&ColumnValue::Real(12.5)));
    }
}
