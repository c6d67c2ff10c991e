#![no_main]

//! Fuzz target for ladder routing keys.
//!
//! Any key that decodes must re-encode to itself.

use courier_broker::{decode_routing_key, encode_routing_key};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(key) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok((delay, queue)) = decode_routing_key(key) {
        let encoded = encode_routing_key(queue, delay).expect("decoded delay is encodable");
        assert_eq!(encoded, key);
    }
});
