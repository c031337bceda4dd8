//! Fuzz target for relay frame decoding
//!
//! Tests that the frame decoder handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use umbra_relay::Envelope;

fuzz_target!(|data: &[u8]| {
    // Decoding must only ever return Ok or Err
    if let Ok(envelope) = Envelope::from_bytes(data) {
        // Anything that decodes must encode again
        let _ = envelope.message.message_type();
        assert!(envelope.to_bytes().is_ok());
    }
});
