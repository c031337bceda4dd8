//! In-process collaborators.
//!
//! A loopback overlay for tests and demos: [`LoopbackNetwork`] routes links
//! between [`ProxyDht`] instances by address, [`MemoryDht`] is a shared
//! key/value store that records every operation, and [`StaticDirectory`]
//! serves a fixed contact list.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::address::PeerAddress;
use crate::dht::{DhtEngine, DhtFlags, DhtGetResult, DhtOutcome};
use crate::directory::{AlternativeContact, ContactDirectory};
use crate::error::{ProxyError, Result};
use crate::identity::OverlayIdentity;
use crate::manager::ProxyDht;
use crate::protocol::OpType;
use crate::transport::{FramedLink, MessageTransport};

type Listeners = HashMap<PeerAddress, mpsc::UnboundedSender<FramedLink>>;

/// In-memory overlay routing links by address
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    listeners: Arc<Mutex<Listeners>>,
}

impl LoopbackNetwork {
    /// Empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `address`; links dialled to it arrive on the receiver
    pub fn bind(&self, address: PeerAddress) -> mpsc::UnboundedReceiver<FramedLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(address, tx);
        rx
    }

    /// Stop listening on `address`
    pub fn unbind(&self, address: &PeerAddress) {
        self.listeners.lock().remove(address);
    }

    /// Stop listening on every port of `host`
    pub fn unbind_host(&self, host: &str) {
        self.listeners.lock().retain(|address, _| address.host != host);
    }

    /// True when something listens on `address`
    #[must_use]
    pub fn is_bound(&self, address: &PeerAddress) -> bool {
        self.listeners.lock().contains_key(address)
    }

    /// Route the endpoints of `identity` to `proxy`
    ///
    /// Must be called from within a tokio runtime. The acceptor stops once the
    /// proxy is dropped.
    pub fn attach(&self, proxy: &ProxyDht, identity: &dyn OverlayIdentity) {
        let endpoints = [identity.relay_endpoint(), identity.direct_endpoint()];
        for endpoint in endpoints.into_iter().flatten() {
            let mut links = self.bind(endpoint);
            let weak = proxy.downgrade();
            tokio::spawn(async move {
                while let Some(link) = links.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    ProxyDht::from_inner(inner).accept(link);
                }
            });
        }
    }
}

#[async_trait]
impl MessageTransport for LoopbackNetwork {
    async fn connect(&self, target: &PeerAddress) -> Result<FramedLink> {
        let listener = self
            .listeners
            .lock()
            .get(target)
            .cloned()
            .ok_or(ProxyError::transport("unreachable"))?;
        let (ours, theirs) = FramedLink::pair(target.clone(), target.clone());
        listener
            .send(theirs)
            .map_err(|_| ProxyError::transport("listener gone"))?;
        Ok(ours)
    }
}

/// One operation seen by a [`MemoryDht`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtOp {
    /// Name of the handle that issued it
    pub origin: String,
    /// Operation kind
    pub kind: OpType,
    /// Storage key
    pub key: Vec<u8>,
    /// Flags passed by the caller
    pub flags: DhtFlags,
    /// Stored value for PUT
    pub value: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Store {
    values: HashMap<Vec<u8>, BTreeMap<String, Vec<u8>>>,
    log: Vec<DhtOp>,
    latency: Duration,
    stalled: bool,
    ready: bool,
}

/// Shared in-memory DHT
///
/// Each origin holds a single value per key.
#[derive(Debug, Clone)]
pub struct MemoryDht {
    store: Arc<Mutex<Store>>,
}

impl Default for MemoryDht {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDht {
    /// Empty, ready store without latency
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store {
                values: HashMap::new(),
                log: Vec::new(),
                latency: Duration::ZERO,
                stalled: false,
                ready: true,
            })),
        }
    }

    /// Engine handle publishing as `origin`
    #[must_use]
    pub fn handle(&self, origin: impl Into<String>) -> MemoryDhtHandle {
        MemoryDhtHandle {
            origin: origin.into(),
            store: Arc::clone(&self.store),
        }
    }

    /// Delay every operation
    pub fn set_latency(&self, latency: Duration) {
        self.store.lock().latency = latency;
    }

    /// Stop completing mutations; lookups run into their timeout
    pub fn set_stalled(&self, stalled: bool) {
        self.store.lock().stalled = stalled;
    }

    /// Report the engine as not ready
    pub fn set_ready(&self, ready: bool) {
        self.store.lock().ready = ready;
    }

    /// Every operation issued so far, in order
    #[must_use]
    pub fn log(&self) -> Vec<DhtOp> {
        self.store.lock().log.clone()
    }

    /// Values stored under `key`, ordered by origin
    #[must_use]
    pub fn values(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.store
            .lock()
            .values
            .get(key)
            .map(|by_origin| by_origin.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// [`DhtEngine`] view of a [`MemoryDht`] for one origin
#[derive(Debug, Clone)]
pub struct MemoryDhtHandle {
    origin: String,
    store: Arc<Mutex<Store>>,
}

impl MemoryDhtHandle {
    /// Record an operation and read the current settings
    fn record(&self, kind: OpType, key: &[u8], flags: DhtFlags, value: Option<Vec<u8>>) -> (Duration, bool) {
        let mut store = self.store.lock();
        store.log.push(DhtOp {
            origin: self.origin.clone(),
            kind,
            key: key.to_vec(),
            flags,
            value,
        });
        (store.latency, store.stalled)
    }
}

#[async_trait]
impl DhtEngine for MemoryDhtHandle {
    async fn put(&self, key: &[u8], value: Vec<u8>, flags: DhtFlags) -> DhtOutcome {
        let (latency, stalled) = self.record(OpType::Put, key, flags, Some(value.clone()));
        if stalled {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(latency).await;
        self.store
            .lock()
            .values
            .entry(key.to_vec())
            .or_default()
            .insert(self.origin.clone(), value);
        DhtOutcome::Complete
    }

    async fn get(
        &self,
        key: &[u8],
        flags: DhtFlags,
        num_want: usize,
        timeout: Duration,
    ) -> DhtGetResult {
        let (latency, stalled) = self.record(OpType::Get, key, flags, None);
        if stalled || latency > timeout {
            tokio::time::sleep(timeout).await;
            return DhtGetResult {
                values: Vec::new(),
                timed_out: true,
            };
        }
        tokio::time::sleep(latency).await;
        let values = self
            .store
            .lock()
            .values
            .get(key)
            .map(|by_origin| by_origin.values().take(num_want).cloned().collect())
            .unwrap_or_default();
        DhtGetResult {
            values,
            timed_out: false,
        }
    }

    async fn remove(&self, key: &[u8]) -> DhtOutcome {
        let (latency, stalled) = self.record(OpType::Remove, key, DhtFlags::NONE, None);
        if stalled {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(latency).await;
        let mut store = self.store.lock();
        if let Some(by_origin) = store.values.get_mut(key) {
            by_origin.remove(&self.origin);
            if by_origin.is_empty() {
                store.values.remove(key);
            }
        }
        DhtOutcome::Complete
    }

    fn is_ready(&self) -> bool {
        self.store.lock().ready
    }
}

/// Fixed contact directory
#[derive(Debug, Default)]
pub struct StaticDirectory {
    contacts: Mutex<Option<Vec<AlternativeContact>>>,
}

impl StaticDirectory {
    /// Directory serving `contacts`
    #[must_use]
    pub fn new(contacts: Vec<AlternativeContact>) -> Self {
        Self {
            contacts: Mutex::new(Some(contacts)),
        }
    }

    /// Directory whose overlay is unavailable
    #[must_use]
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Replace the served contacts
    pub fn set(&self, contacts: Vec<AlternativeContact>) {
        *self.contacts.lock() = Some(contacts);
    }
}

impl ContactDirectory for StaticDirectory {
    fn contacts(&self, max: usize) -> Option<Vec<AlternativeContact>> {
        self.contacts
            .lock()
            .as_ref()
            .map(|contacts| contacts.iter().take(max).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_reaches_listener() {
        let network = LoopbackNetwork::new();
        let address = PeerAddress::new("a.umbra", 1);
        let mut incoming = network.bind(address.clone());

        let link = network.connect(&address).await.unwrap();
        link.outgoing.send(b"ping".to_vec()).unwrap();
        let mut accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.remote, address);
        assert_eq!(accepted.incoming.recv().await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_unbound_address_is_unreachable() {
        let network = LoopbackNetwork::new();
        let address = PeerAddress::new("a.umbra", 1);
        let _incoming = network.bind(address.clone());
        network.unbind_host("a.umbra");
        assert!(!network.is_bound(&address));
        assert!(matches!(
            network.connect(&address).await,
            Err(ProxyError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_single_value_per_origin() {
        let dht = MemoryDht::new();
        let a = dht.handle("a");
        let b = dht.handle("b");
        a.put(b"k", vec![1], DhtFlags::NONE).await;
        a.put(b"k", vec![2], DhtFlags::NONE).await;
        b.put(b"k", vec![3], DhtFlags::NONE).await;
        assert_eq!(dht.values(b"k"), vec![vec![2], vec![3]]);

        let result = a.get(b"k", DhtFlags::NONE, 1, Duration::from_secs(1)).await;
        assert_eq!(result.values, vec![vec![2]]);

        a.remove(b"k").await;
        assert_eq!(dht.values(b"k"), vec![vec![3]]);
        assert_eq!(dht.log().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_get_times_out() {
        let dht = MemoryDht::new();
        dht.set_stalled(true);
        let result = dht
            .handle("a")
            .get(b"k", DhtFlags::NONE, 8, Duration::from_secs(3))
            .await;
        assert!(result.timed_out);
    }

    #[test]
    fn test_directory_respects_max() {
        let contacts = (0..4)
            .map(|i| AlternativeContact::new(2, PeerAddress::new(format!("{i}.umbra"), 1)))
            .collect();
        let directory = StaticDirectory::new(contacts);
        assert_eq!(directory.contacts(2).map(|c| c.len()), Some(2));
        assert!(StaticDirectory::unavailable().contacts(2).is_none());
    }
}
