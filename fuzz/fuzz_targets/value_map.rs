//! Fuzz target for masked value decoding
//!
//! Unmasks arbitrary bytes with an arbitrary key and decodes the result the
//! way a relay client opens GET replies.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use umbra_crypto::mask::VALUE_MASK;
use umbra_relay::protocol::{check_reserved, decode_value, encode_value};

#[derive(Debug, Arbitrary)]
struct MaskedValue {
    key: Vec<u8>,
    value: Vec<u8>,
}

fuzz_target!(|input: MaskedValue| {
    let mut buf = input.value.clone();
    VALUE_MASK.apply(&input.key, &mut buf);

    if let Ok(map) = decode_value(&buf) {
        let _ = check_reserved(&map);
        assert!(encode_value(&map).is_ok());
    }

    // Masking is its own inverse
    VALUE_MASK.apply(&input.key, &mut buf);
    assert_eq!(buf, input.value);
});
