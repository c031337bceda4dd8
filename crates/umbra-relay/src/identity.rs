//! Overlay identity and addressing.
//!
//! The relay layer never touches overlay key material directly. It asks an
//! [`OverlayIdentity`] for this node's endpoints, for signatures, and for the
//! public key behind a host name.

use rand_core::OsRng;
use umbra_crypto::signatures::{SigningKey, verify_raw};

use crate::address::PeerAddress;
use crate::error::Result;

/// Host name suffix of [`Ed25519Identity`] hosts
pub const OVERLAY_SUFFIX: &str = ".umbra";

/// Identity and address services of the overlay network
pub trait OverlayIdentity: Send + Sync + 'static {
    /// Endpoint other clients reach this node's relay service on
    ///
    /// `None` while the overlay has not published it yet.
    fn relay_endpoint(&self) -> Option<PeerAddress>;

    /// Endpoint this node publishes values from and answers probes on
    fn direct_endpoint(&self) -> Option<PeerAddress>;

    /// Sign with the key behind the direct endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unavailable.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature made by the host whose key bytes are `host_bytes`
    fn verify(&self, host_bytes: &[u8], message: &[u8], signature: &[u8]) -> bool;

    /// Public key bytes behind a host name
    fn host_to_bytes(&self, host: &str) -> Option<Vec<u8>>;

    /// Host name for public key bytes
    fn bytes_to_host(&self, bytes: &[u8]) -> Option<String>;

    /// True when `host` is an address on this overlay
    fn is_overlay_host(&self, host: &str) -> bool;
}

/// Ed25519 overlay identity
///
/// Hosts are the hex encoding of a public key followed by [`OVERLAY_SUFFIX`].
#[derive(Debug)]
pub struct Ed25519Identity {
    signing_key: SigningKey,
    direct: Option<PeerAddress>,
    relay: Option<PeerAddress>,
}

impl Ed25519Identity {
    /// Build an identity from a signing key and endpoint ports
    ///
    /// The direct host is derived from `signing_key`; the relay host is the
    /// given host name.
    #[must_use]
    pub fn new(signing_key: SigningKey, direct_port: u16, relay: Option<PeerAddress>) -> Self {
        let host = Self::host_for(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            direct: Some(PeerAddress::new(host, direct_port)),
            relay,
        }
    }

    /// Generate fresh keys for both endpoints
    #[must_use]
    pub fn generate(relay_port: u16, direct_port: u16) -> Self {
        let relay_key = SigningKey::generate(&mut OsRng);
        let relay_host = Self::host_for(&relay_key.verifying_key().to_bytes());
        Self::new(
            SigningKey::generate(&mut OsRng),
            direct_port,
            Some(PeerAddress::new(relay_host, relay_port)),
        )
    }

    /// Host name for a public key
    #[must_use]
    pub fn host_for(public_key: &[u8; 32]) -> String {
        format!("{}{}", hex::encode(public_key), OVERLAY_SUFFIX)
    }

    /// Drop the published endpoints, as if the overlay were still starting
    #[must_use]
    pub fn without_endpoints(mut self) -> Self {
        self.direct = None;
        self.relay = None;
        self
    }
}

impl OverlayIdentity for Ed25519Identity {
    fn relay_endpoint(&self) -> Option<PeerAddress> {
        self.relay.clone()
    }

    fn direct_endpoint(&self) -> Option<PeerAddress> {
        self.direct.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(message).as_bytes().to_vec())
    }

    fn verify(&self, host_bytes: &[u8], message: &[u8], signature: &[u8]) -> bool {
        verify_raw(host_bytes, message, signature).is_ok()
    }

    fn host_to_bytes(&self, host: &str) -> Option<Vec<u8>> {
        let encoded = host.strip_suffix(OVERLAY_SUFFIX)?;
        let bytes = hex::decode(encoded).ok()?;
        (bytes.len() == umbra_crypto::ED25519_PUBLIC_KEY_SIZE).then_some(bytes)
    }

    fn bytes_to_host(&self, bytes: &[u8]) -> Option<String> {
        let key: [u8; 32] = bytes.try_into().ok()?;
        Some(Self::host_for(&key))
    }

    fn is_overlay_host(&self, host: &str) -> bool {
        self.host_to_bytes(host).is_some()
    }
}
