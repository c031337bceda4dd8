//! BLAKE3 hashing and domain-separated key derivation.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Derive a 32-byte key as `BLAKE3(tag || key)`.
///
/// Different tags yield unrelated outputs for the same key, which keeps the
/// operation, storage and announce namespaces apart.
#[must_use]
pub fn derive_key(tag: &str, key: &[u8]) -> HashOutput {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag.as_bytes());
    hasher.update(key);
    *hasher.finalize().as_bytes()
}

/// Compute one keystream block as `BLAKE3(tag || counter_le || key)`.
#[must_use]
pub fn keystream_block(tag: &str, counter: u32, key: &[u8]) -> HashOutput {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag.as_bytes());
    hasher.update(&counter.to_le_bytes());
    hasher.update(key);
    *hasher.finalize().as_bytes()
}
