//! # Umbra Relay
//!
//! Relayed DHT access for nodes that are only reachable through an
//! anonymizing overlay. A node picks one overlay peer as its relay and sends
//! PUT, GET and REMOVE operations through it; the same node can relay for up
//! to a few peers of its own.
//!
//! This crate provides:
//! - Outbound relay selection with failover and backoff
//! - Inbound admission with denial contacts and reachability probes
//! - A per-key serializing request queue with newest-first dispatch
//! - Signed, masked values so relays never see plaintext keys or values
//! - Collaborator traits for the overlay, the DHT and the transport, plus
//!   loopback implementations
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          ProxyDht                             │
//! │   (tracker API, raw put/get/remove, status, maintenance)      │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │     Request queue            │     Relay selection           │
//! │  (per-key state, dispatcher) │  (failure/backup caches)      │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │                        Connections                            │
//! │  relay client │ relay server │ probe client │ probe server    │
//! ├──────────────────────────────────────────────────────────────┤
//! │          Envelope codec  ·  MessageTransport (links)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod cache;
pub mod config;
mod connection;
pub mod dht;
pub mod directory;
mod dispatcher;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod loopback;
mod maintenance;
mod manager;
pub mod protocol;
pub mod request;
mod selection;
pub mod transport;

pub use address::PeerAddress;
pub use cache::BoundedCache;
pub use config::ProxyConfig;
pub use connection::{ClientPhase, RemoteQueueStats, ServerPhase};
pub use dht::{DhtEngine, DhtFlags, DhtGetResult, DhtOutcome};
pub use directory::{AlternativeContact, ContactDirectory};
pub use dispatcher::KeyStatus;
pub use error::{ProxyError, Result};
pub use identity::{Ed25519Identity, OVERLAY_SUFFIX, OverlayIdentity};
pub use manager::{
    MAX_VALUE_SIZE, ProxyDht, ProxyStatus, RelayClientStatus, RelayServerStatus,
};
pub use protocol::{Envelope, Field, MessageType, OpOptions, OpType, ProxyMessage, ValueMap};
pub use request::{GetEvent, GetQuery, MutationReceipt, PeerAnnouncement, PeerQuery, QueryEvent};
pub use transport::{FramedLink, MessageTransport};

/// Protocol version spoken by this crate
pub const PROTOCOL_VERSION: u32 = 2;
