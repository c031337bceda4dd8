//! Test fixtures
//!
//! - [`Overlay`]: a loopback network, shared DHT and directory with helpers
//!   to build client and relay nodes
//! - [`FakeRelay`]: a scripted relay speaking the wire protocol directly
//! - [`RawClient`]: a scripted relay client for exercising a real relay

mod overlay;
mod raw;

pub use overlay::{Overlay, TestNode, WAIT_LIMIT, client_config, relay_config, wait_for};
pub use raw::{FakeRelay, RawClient, RawPeer};
