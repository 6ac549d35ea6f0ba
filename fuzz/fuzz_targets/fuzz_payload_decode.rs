//! Fuzz target for stored payload decoding.
//!
//! Log rows can be edited by hand, so decoding must reject garbage with an
//! error instead of panicking, and anything it accepts must re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_replicator::Payload;

fuzz_target!(|data: &str| {
    if let Ok(payload) = Payload::decode(data) {
        let encoded = payload.encode().expect("decoded payload re-encodes");
        let again = Payload::decode(&encoded).expect("encoded payload decodes");
        assert_eq!(again.len(), payload.len());
    }
});
