#![no_main]

//! Fuzz target for payload decoding.
//!
//! Message bodies come from arbitrary publishers, so decoding must never
//! panic, and any payload that decodes must also produce a request body.

use courier_core::Payload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = Payload::decode(data) {
        assert!(payload.validate().is_ok());
        assert!(payload.body().is_ok());
    }
});
