//! XOR keystream masking.
//!
//! A [`Keystream`] expands a key into blocks of `BLAKE3(tag || counter || key)`
//! and XORs them over a buffer. Applying the same keystream twice restores the
//! original bytes, so the same call masks and unmasks.
//!
//! ## Usage
//!
//! ```
//! use umbra_crypto::mask::VALUE_MASK;
//!
//! let key = b"info-hash";
//! let mut value = b"serialized value".to_vec();
//! VALUE_MASK.apply(key, &mut value);
//! assert_ne!(&value[..], b"serialized value");
//! VALUE_MASK.apply(key, &mut value);
//! assert_eq!(&value[..], b"serialized value");
//! ```

use crate::hash::{HashOutput, derive_key, keystream_block};

/// Tag for masking values sent from a client to its relay.
pub const VALUE_MASK_TAG: &str = "umbra::mask";

/// Tag for deriving the operation key a client sends to its relay.
pub const OP_KEY_TAG: &str = "umbra::key";

/// Tag for deriving the DHT key a relay stores an operation key under.
pub const REMOTE_KEY_TAG: &str = "umbra::remote_mask";

/// Tag for deriving tracker keys from an info-hash.
pub const ANNOUNCE_KEY_TAG: &str = "umbra::announce";

/// Keystream for client to relay values.
pub const VALUE_MASK: Keystream = Keystream::new(VALUE_MASK_TAG);

/// Domain-tagged XOR keystream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keystream {
    tag: &'static str,
}

impl Keystream {
    /// Create a keystream for the given domain tag.
    #[must_use]
    pub const fn new(tag: &'static str) -> Self {
        Self { tag }
    }

    /// Domain tag of this keystream.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        self.tag
    }

    /// XOR the keystream for `key` over `buf` in place.
    pub fn apply(&self, key: &[u8], buf: &mut [u8]) {
        let mut counter: u32 = 0;
        for chunk in buf.chunks_mut(crate::BLAKE3_OUTPUT_SIZE) {
            let block = keystream_block(self.tag, counter, key);
            for (byte, pad) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= pad;
            }
            counter = counter.wrapping_add(1);
        }
    }

    /// Return a masked copy of `data`.
    #[must_use]
    pub fn masked(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(key, &mut out);
        out
    }
}

/// Operation key a client sends to its relay for `key`.
#[must_use]
pub fn op_key(key: &[u8]) -> HashOutput {
    derive_key(OP_KEY_TAG, key)
}

/// DHT key a relay stores `op_key` under.
#[must_use]
pub fn remote_key(op_key: &[u8]) -> HashOutput {
    derive_key(REMOTE_KEY_TAG, op_key)
}

/// Tracker key for an info-hash.
#[must_use]
pub fn announce_key(info_hash: &[u8]) -> HashOutput {
    derive_key(ANNOUNCE_KEY_TAG, info_hash)
}
