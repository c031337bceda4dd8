//! # umbra Crypto
//!
//! Cryptographic primitives for the umbra relay protocol.
//!
//! This crate provides:
//! - Domain-separated key derivation over BLAKE3
//! - A self-inverse XOR keystream codec for masking keys and values
//! - Ed25519 signatures for allocation payloads and published values
//! - Random identifiers from the OS CSPRNG
//!
//! ## Domains
//!
//! | Tag | Use |
//! |-----|-----|
//! | [`mask::VALUE_MASK_TAG`] | Client to relay value masking |
//! | [`mask::OP_KEY_TAG`] | Operation key sent to the relay |
//! | [`mask::REMOTE_KEY_TAG`] | Relay to DHT key masking |
//! | [`mask::ANNOUNCE_KEY_TAG`] | Tracker keys derived from an info-hash |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod mask;
pub mod random;
pub mod signatures;

pub use error::CryptoError;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;
