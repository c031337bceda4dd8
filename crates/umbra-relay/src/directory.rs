//! Alternative contact directory.
//!
//! The overlay keeps a pool of peers that advertised relay service. The relay
//! manager samples it when selecting a relay, and the server role samples it
//! to suggest alternatives when it denies a client.

use crate::address::PeerAddress;

/// A peer that may offer relay service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternativeContact {
    /// Advertised protocol version, 0 when unknown
    pub version: u32,
    /// Notional relay address, if the contact has one on this overlay
    pub address: Option<PeerAddress>,
}

impl AlternativeContact {
    /// Contact with a known address
    #[must_use]
    pub fn new(version: u32, address: PeerAddress) -> Self {
        Self {
            version,
            address: Some(address),
        }
    }

    /// True when the contact may speak at least `min_version`
    ///
    /// Contacts of unknown version are given the benefit of the doubt.
    #[must_use]
    pub fn accepts_version(&self, min_version: u32) -> bool {
        self.version == 0 || self.version >= min_version
    }
}

/// Source of candidate relays
pub trait ContactDirectory: Send + Sync + 'static {
    /// Up to `max` contacts, or `None` while the overlay is unavailable
    fn contacts(&self, max: usize) -> Option<Vec<AlternativeContact>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_version() {
        let addr = PeerAddress::new("a.umbra", 1);
        assert!(AlternativeContact::new(0, addr.clone()).accepts_version(2));
        assert!(AlternativeContact::new(2, addr.clone()).accepts_version(2));
        assert!(AlternativeContact::new(3, addr.clone()).accepts_version(2));
        assert!(!AlternativeContact::new(1, addr).accepts_version(2));
    }
}
