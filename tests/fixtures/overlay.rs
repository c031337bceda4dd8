//! Loopback overlay of client and relay nodes

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use umbra_relay::loopback::{LoopbackNetwork, MemoryDht, StaticDirectory};
use umbra_relay::{
    AlternativeContact, ClientPhase, Ed25519Identity, OverlayIdentity, PROTOCOL_VERSION, PeerAddress,
    ProxyConfig, ProxyDht,
};

/// Upper bound on any single wait in a test
pub const WAIT_LIMIT: Duration = Duration::from_secs(600);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Ports every generated node listens on; hosts keep nodes apart
const RELAY_PORT: u16 = 6881;
const DIRECT_PORT: u16 = 6882;

/// Configuration for a node that only uses relays
pub fn client_config() -> ProxyConfig {
    ProxyConfig {
        server_enabled: false,
        ..ProxyConfig::default()
    }
}

/// Configuration for a node that only serves as a relay
pub fn relay_config() -> ProxyConfig {
    ProxyConfig {
        client_enabled: false,
        ..ProxyConfig::default()
    }
}

/// Poll `condition` until it holds
///
/// # Panics
///
/// Panics if the condition does not hold within [`WAIT_LIMIT`].
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Shared network, DHT and contact directory
pub struct Overlay {
    pub network: LoopbackNetwork,
    pub dht: MemoryDht,
    pub directory: Arc<StaticDirectory>,
    contacts: Mutex<Vec<AlternativeContact>>,
}

impl Overlay {
    /// Empty overlay
    pub fn new() -> Self {
        Self {
            network: LoopbackNetwork::new(),
            dht: MemoryDht::new(),
            directory: Arc::new(StaticDirectory::new(Vec::new())),
            contacts: Mutex::new(Vec::new()),
        }
    }

    /// Build and attach a node; it is not started
    pub fn node(&self, name: &str, config: ProxyConfig) -> TestNode {
        let identity = Arc::new(Ed25519Identity::generate(RELAY_PORT, DIRECT_PORT));
        let proxy = ProxyDht::new(
            config,
            identity.clone(),
            Arc::new(self.dht.handle(name)),
            self.directory.clone(),
            Arc::new(self.network.clone()),
        )
        .unwrap();
        self.network.attach(&proxy, identity.as_ref());
        TestNode { proxy, identity }
    }

    /// Build a relay node and list it in the directory
    pub fn relay(&self, name: &str, config: ProxyConfig) -> TestNode {
        let node = self.node(name, config);
        self.publish(AlternativeContact::new(PROTOCOL_VERSION, node.relay_endpoint()));
        node
    }

    /// Add a contact to the directory
    pub fn publish(&self, contact: AlternativeContact) {
        let mut contacts = self.contacts.lock();
        contacts.push(contact);
        self.directory.set(contacts.clone());
    }

    /// List a relay address at the current protocol version
    pub fn publish_address(&self, address: PeerAddress) {
        self.publish(AlternativeContact::new(PROTOCOL_VERSION, address));
    }
}

impl Default for Overlay {
    fn default() -> Self {
        Self::new()
    }
}

/// A node on the overlay
pub struct TestNode {
    pub proxy: ProxyDht,
    pub identity: Arc<Ed25519Identity>,
}

impl TestNode {
    /// Endpoint of this node's relay service
    pub fn relay_endpoint(&self) -> PeerAddress {
        self.identity.relay_endpoint().unwrap()
    }

    /// Endpoint this node publishes from
    pub fn direct_endpoint(&self) -> PeerAddress {
        self.identity.direct_endpoint().unwrap()
    }

    /// Address of the active relay, if any
    pub fn active_relay(&self) -> Option<PeerAddress> {
        self.proxy
            .status()
            .relay
            .filter(|relay| relay.phase == ClientPhase::Active)
            .map(|relay| relay.target)
    }

    /// Wait until a relay is active and return its address
    pub async fn wait_active(&self) -> PeerAddress {
        wait_for("an active relay", || self.active_relay().is_some()).await;
        self.active_relay().unwrap()
    }
}
