//! DHT engine interface.
//!
//! A relay executes client operations against its own view of the public DHT
//! through [`DhtEngine`]. The engine reports completion or timeout only; a
//! DHT-level error is indistinguishable from a timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr};
use std::time::Duration;

/// Storage flags passed to the DHT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DhtFlags(u8);

impl DhtFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Publisher is downloading
    pub const DOWNLOADING: Self = Self(0x01);
    /// Publisher is seeding
    pub const SEEDING: Self = Self(0x02);
    /// One value per publisher
    pub const SINGLE_VALUE: Self = Self(0x04);
    /// Store without revealing the originator
    pub const ANON: Self = Self(0x10);

    /// Flags a relay passes through from its clients
    pub const RELAYABLE: Self = Self(Self::DOWNLOADING.0 | Self::SEEDING.0);

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// True when every flag of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Keep only the flags a relay passes through
    #[must_use]
    pub const fn relayable(self) -> Self {
        Self(self.0 & Self::RELAYABLE.0)
    }
}

impl BitOr for DhtFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for DhtFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Outcome of a DHT mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtOutcome {
    /// Operation finished
    Complete,
    /// Operation gave up
    TimedOut,
}

impl DhtOutcome {
    /// True for [`DhtOutcome::TimedOut`]
    #[must_use]
    pub fn timed_out(self) -> bool {
        matches!(self, DhtOutcome::TimedOut)
    }
}

/// Values read by a DHT lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhtGetResult {
    /// Values found, in discovery order
    pub values: Vec<Vec<u8>>,
    /// The lookup hit its deadline
    pub timed_out: bool,
}

/// Public DHT storage and lookup
///
/// Must be safe for concurrent use.
#[async_trait]
pub trait DhtEngine: Send + Sync + 'static {
    /// Store `value` under `key`
    async fn put(&self, key: &[u8], value: Vec<u8>, flags: DhtFlags) -> DhtOutcome;

    /// Look up at most `num_want` values under `key` within `timeout`
    async fn get(&self, key: &[u8], flags: DhtFlags, num_want: usize, timeout: Duration)
    -> DhtGetResult;

    /// Remove this node's value under `key`
    async fn remove(&self, key: &[u8]) -> DhtOutcome;

    /// True once the engine can serve requests
    fn is_ready(&self) -> bool {
        true
    }
}
