//! Relay manager
//!
//! [`ProxyDht`] is the handle callers hold. It owns the connection registry,
//! the failure and backup caches, the dispatch state and the maintenance
//! task. Selection lives in `selection.rs`, dispatch in `dispatcher.rs` and
//! the periodic work in `maintenance.rs`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use umbra_crypto::mask::announce_key;
use umbra_crypto::random::random_id;

use crate::address::PeerAddress;
use crate::cache::BoundedCache;
use crate::config::ProxyConfig;
use crate::connection::{
    ClientPhase, Connection, InboundProbe, InboundRelay, RemoteQueueStats, Role, ServerPhase,
};
use crate::dht::{DhtEngine, DhtFlags};
use crate::directory::ContactDirectory;
use crate::dispatcher::{DispatchState, KeyStatus};
use crate::error::{ProxyError, Result};
use crate::identity::OverlayIdentity;
use crate::limiter::InboundLimiter;
use crate::protocol::{
    Field, OpOptions, ProxyMessage, VALUE_RAW, ValueMap, check_reserved, encode_value,
};
use crate::request::{LocalRequest, MutationReceipt, GetQuery, PeerQuery};
use crate::transport::{FramedLink, MessageTransport};

/// Largest encoded caller value accepted for relaying
pub const MAX_VALUE_SIZE: usize = 4096;

/// Instance id length in bytes
const INSTANCE_ID_LEN: usize = 8;

/// Connections known to the manager
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) connections: HashMap<u64, Arc<Connection>>,
    pub(crate) current_relay: Option<Arc<Connection>>,
    pub(crate) inbound_relays: Vec<Arc<Connection>>,
    pub(crate) selecting: bool,
    pub(crate) recheck: bool,
}

/// Selection memory, guarded separately from the registry
#[derive(Debug)]
pub(crate) struct FailureState {
    pub(crate) failed_hosts: BoundedCache<String, ()>,
    pub(crate) backups: BoundedCache<PeerAddress, ()>,
    pub(crate) failed_target: Option<PeerAddress>,
    pub(crate) failed_target_retries: u32,
}

/// Outcome of registering an inbound relay client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundAdmission {
    Admitted,
    Full,
    Duplicate,
    Closed,
}

/// Shared state behind a [`ProxyDht`]
pub(crate) struct ProxyInner {
    pub(crate) config: ProxyConfig,
    pub(crate) identity: Arc<dyn OverlayIdentity>,
    pub(crate) dht: Arc<dyn DhtEngine>,
    pub(crate) directory: Arc<dyn ContactDirectory>,
    pub(crate) transport: Arc<dyn MessageTransport>,
    pub(crate) instance_id: String,
    pub(crate) limiter: InboundLimiter,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) failures: Mutex<FailureState>,
    pub(crate) consecutive_failures: AtomicU32,
    pub(crate) dispatch: Mutex<DispatchState>,
    next_connection_id: AtomicU64,
    next_seq: AtomicU64,
    destroyed: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProxyInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInner")
            .field("instance_id", &self.instance_id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl ProxyInner {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a new connection
    ///
    /// A new outbound relay connection becomes current and closes the one it
    /// replaces.
    pub(crate) fn add_connection(&self, conn: &Arc<Connection>) {
        let superseded = {
            let mut registry = self.registry.lock();
            registry.connections.insert(conn.id(), Arc::clone(conn));
            if conn.as_relay_client().is_some() {
                registry.current_relay.replace(Arc::clone(conn))
            } else {
                None
            }
        };
        if let Some(old) = superseded {
            tracing::debug!("Relay {} superseded by {}", old.remote(), conn.remote());
            old.close();
        }
    }

    /// Unregister a closed connection and reselect if it was the current relay
    pub(crate) fn remove_connection(self: &Arc<Self>, conn: &Arc<Connection>) {
        let was_current = {
            let mut registry = self.registry.lock();
            registry.connections.remove(&conn.id());
            registry.inbound_relays.retain(|c| !Arc::ptr_eq(c, conn));
            let was_current = registry
                .current_relay
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, conn));
            if was_current {
                registry.current_relay = None;
            }
            was_current
        };

        let Some(client) = conn.as_relay_client() else {
            return;
        };
        self.relay_failed(conn);
        if !was_current {
            return;
        }
        if client.has_been_active() {
            tracing::info!("Lost relay {}, reselecting", conn.remote());
            {
                let mut failures = self.failures.lock();
                failures.failed_target = Some(conn.remote().clone());
                failures.failed_target_retries = 0;
            }
            self.check_relay(true);
        } else {
            self.check_relay(false);
        }
    }

    /// Record `conn` as a relay client claiming `source_host`
    pub(crate) fn admit_inbound(&self, conn: &Arc<Connection>, source_host: &str) -> InboundAdmission {
        let mut registry = self.registry.lock();
        if conn.is_closed() {
            return InboundAdmission::Closed;
        }
        let duplicate = registry.inbound_relays.iter().any(|other| {
            !Arc::ptr_eq(other, conn)
                && other
                    .as_relay_server()
                    .and_then(InboundRelay::source_host)
                    .is_some_and(|host| host == source_host)
        });
        if duplicate {
            return InboundAdmission::Duplicate;
        }
        if registry.inbound_relays.len() >= self.config.max_server_proxies {
            return InboundAdmission::Full;
        }
        registry.inbound_relays.push(Arc::clone(conn));
        InboundAdmission::Admitted
    }

    /// Uid of the current outbound relay connection
    pub(crate) fn current_relay_uid(&self) -> Option<String> {
        let registry = self.registry.lock();
        registry
            .current_relay
            .as_ref()
            .and_then(|conn| conn.as_relay_client())
            .map(|client| client.uid().to_owned())
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.lock().connections.values().cloned().collect()
    }

    pub(crate) fn status(&self) -> ProxyStatus {
        let (connections, current, inbound) = {
            let registry = self.registry.lock();
            (
                registry.connections.len(),
                registry.current_relay.clone(),
                registry.inbound_relays.clone(),
            )
        };
        let (tracked_keys, queued_requests, dispatching) = {
            let dispatch = self.dispatch.lock();
            (
                dispatch.requests.key_count(),
                dispatch.requests.len(),
                dispatch.has_worker(),
            )
        };

        let relay = current.as_ref().and_then(|conn| {
            conn.as_relay_client().map(|client| RelayClientStatus {
                target: conn.remote().clone(),
                phase: client.phase(),
                remote_instance: client.remote_iid(),
                in_flight: client.in_flight(),
                dispatching,
            })
        });
        let clients = inbound
            .iter()
            .filter_map(|conn| conn.as_relay_server())
            .map(|server| RelayServerStatus {
                source_host: server.source_host(),
                phase: server.phase(),
                queues: server.stats(),
            })
            .collect();

        ProxyStatus {
            instance_id: self.instance_id.clone(),
            connections,
            relay,
            clients,
            tracked_keys,
            queued_requests,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
        }
    }
}

/// Snapshot of the relay layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatus {
    /// This node's relay instance id
    pub instance_id: String,
    /// Registered connections of every role
    pub connections: usize,
    /// Current outbound relay, if any
    pub relay: Option<RelayClientStatus>,
    /// Admitted inbound relay clients
    pub clients: Vec<RelayServerStatus>,
    /// Keys with local mutation state
    pub tracked_keys: usize,
    /// Local requests waiting for dispatch
    pub queued_requests: usize,
    /// Relay attempts since the last successful setup
    pub consecutive_failures: u32,
}

/// The relay this node uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayClientStatus {
    /// Relay address
    pub target: PeerAddress,
    /// Connection phase
    pub phase: ClientPhase,
    /// Relay instance id once active
    pub remote_instance: Option<String>,
    /// Requests awaiting a reply
    pub in_flight: usize,
    /// A dispatcher task is running
    pub dispatching: bool,
}

/// A client this node relays for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServerStatus {
    /// Claimed source host
    pub source_host: Option<String>,
    /// Connection phase
    pub phase: ServerPhase,
    /// Queue occupancy
    pub queues: RemoteQueueStats,
}

/// Relay-backed DHT access for an overlay node
///
/// Cloning is cheap; all clones share one relay layer.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use umbra_relay::loopback::{LoopbackNetwork, MemoryDht, StaticDirectory};
/// use umbra_relay::{Ed25519Identity, ProxyConfig, ProxyDht};
///
/// # async fn run() -> umbra_relay::Result<()> {
/// let network = LoopbackNetwork::new();
/// let identity = Arc::new(Ed25519Identity::generate(6000, 6001));
/// let proxy = ProxyDht::new(
///     ProxyConfig::default(),
///     identity.clone(),
///     Arc::new(MemoryDht::new().handle("node")),
///     Arc::new(StaticDirectory::new(Vec::new())),
///     Arc::new(network.clone()),
/// )?;
/// network.attach(&proxy, identity.as_ref());
/// proxy.start();
///
/// let receipt = proxy.announce(&[7u8; 20], true)?;
/// let confirmed = receipt.confirmed().await;
/// # let _ = confirmed;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProxyDht {
    inner: Arc<ProxyInner>,
}

impl ProxyDht {
    /// Create a relay layer over the given collaborators
    ///
    /// Nothing runs until [`ProxyDht::start`].
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidConfig`] for an invalid configuration and
    /// [`ProxyError::Crypto`] if no instance id can be generated.
    pub fn new(
        config: ProxyConfig,
        identity: Arc<dyn OverlayIdentity>,
        dht: Arc<dyn DhtEngine>,
        directory: Arc<dyn ContactDirectory>,
        transport: Arc<dyn MessageTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let instance_id = random_id(INSTANCE_ID_LEN)?;
        let inner = ProxyInner {
            limiter: InboundLimiter::new(config.inbound_rate_limit),
            registry: Mutex::new(Registry::default()),
            failures: Mutex::new(FailureState {
                failed_hosts: BoundedCache::new(config.failed_host_capacity),
                backups: BoundedCache::new(config.backup_capacity),
                failed_target: None,
                failed_target_retries: 0,
            }),
            consecutive_failures: AtomicU32::new(0),
            dispatch: Mutex::new(DispatchState::new(
                config.max_key_state,
                config.failed_uid_capacity,
            )),
            next_connection_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
            maintenance: Mutex::new(None),
            config,
            identity,
            dht,
            directory,
            transport,
            instance_id,
        };
        tracing::debug!("Created relay layer {}", inner.instance_id);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// This node's relay instance id
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Start maintenance and the first relay selection
    ///
    /// Must be called from within a tokio runtime. Calling it again has no
    /// effect.
    pub fn start(&self) {
        {
            let mut slot = self.inner.maintenance.lock();
            if slot.is_some() || self.inner.is_destroyed() {
                return;
            }
            let weak = Arc::downgrade(&self.inner);
            let period = self.inner.config.tick_interval;
            *slot = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.tick().await;
                let mut tick: u64 = 0;
                loop {
                    interval.tick().await;
                    tick += 1;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.maintenance_tick(tick);
                }
            }));
        }
        tracing::info!("Relay layer {} started", self.inner.instance_id);
        self.inner.check_relay(true);
    }

    /// Hand over an inbound link
    ///
    /// Links to the relay port become relay clients; links to any other port
    /// are probes. Links from outside the overlay are dropped.
    pub fn accept(&self, link: FramedLink) {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return;
        }
        if !inner.identity.is_overlay_host(&link.remote.host) {
            tracing::debug!("Dropping inbound link on non-overlay address {}", link.remote);
            return;
        }
        let relay_port = inner.identity.relay_endpoint().map(|endpoint| endpoint.port);
        let role = if relay_port == Some(link.remote.port) {
            Role::RelayServer(InboundRelay::new(&inner.config))
        } else {
            Role::ProbeServer(InboundProbe)
        };
        Connection::accept(inner, link, role);
    }

    /// Close every connection and stop maintenance
    ///
    /// Queued GETs complete as timed out; later submissions fail with
    /// [`ProxyError::ShuttingDown`].
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Relay layer {} shutting down", inner.instance_id);
        if let Some(handle) = inner.maintenance.lock().take() {
            handle.abort();
        }
        for conn in inner.connections() {
            if conn.is_connected() {
                conn.send(ProxyMessage::Close);
            }
            conn.close();
        }
        inner.fail_queued_gets();
    }

    /// Announce this node under an info-hash
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ShuttingDown`] after shutdown.
    pub fn announce(&self, info_hash: &[u8], is_seed: bool) -> Result<MutationReceipt> {
        let mut value = ValueMap::new();
        value.insert("s".into(), Field::Int(i64::from(is_seed)));
        value.insert("c".into(), Field::Int(i64::from(self.inner.config.require_crypto)));
        let options = OpOptions {
            flags: Some(tracker_flags(is_seed).bits()),
            ..OpOptions::default()
        };
        self.put(&announce_key(info_hash), value, Some(options))
    }

    /// Look up peers announced under an info-hash
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ShuttingDown`] after shutdown.
    pub fn query(&self, info_hash: &[u8], is_seed: bool, num_want: u32) -> Result<PeerQuery> {
        let options = OpOptions {
            flags: Some(tracker_flags(is_seed).bits()),
            timeout_secs: None,
            num_want: Some(num_want),
        };
        let query = self.get(&announce_key(info_hash), Some(options), None)?;
        Ok(PeerQuery::new(query))
    }

    /// Withdraw an announcement
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ShuttingDown`] after shutdown.
    pub fn unannounce(&self, info_hash: &[u8]) -> Result<MutationReceipt> {
        self.remove(&announce_key(info_hash))
    }

    /// Store raw bytes under `key`
    ///
    /// # Errors
    ///
    /// See [`ProxyDht::put`].
    pub fn put_value(
        &self,
        key: &[u8],
        value: Vec<u8>,
        options: Option<OpOptions>,
    ) -> Result<MutationReceipt> {
        let mut map = ValueMap::new();
        map.insert(VALUE_RAW.into(), Field::Bytes(value));
        self.put(key, map, options)
    }

    /// Store a value map under `key`
    ///
    /// A PUT replaces any PUT or REMOVE for the same key that has not been
    /// sent yet.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidValue`] if the map uses a reserved key or
    /// exceeds [`MAX_VALUE_SIZE`], and [`ProxyError::ShuttingDown`] after
    /// shutdown.
    pub fn put(
        &self,
        key: &[u8],
        value: ValueMap,
        options: Option<OpOptions>,
    ) -> Result<MutationReceipt> {
        self.ensure_running()?;
        check_reserved(&value)?;
        if encode_value(&value)?.len() > MAX_VALUE_SIZE {
            return Err(ProxyError::invalid_value("value too large"));
        }
        let (request, receipt) = LocalRequest::put(self.inner.next_seq(), key.to_vec(), value, options);
        self.inner.submit(Arc::new(request));
        Ok(receipt)
    }

    /// Read the values stored under `key`
    ///
    /// The timeout defaults to the option's `timeout_secs`, then to the
    /// configured default. While no relay is active a GET waits at most
    /// `queued_get_ceiling`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ShuttingDown`] after shutdown.
    pub fn get(
        &self,
        key: &[u8],
        options: Option<OpOptions>,
        timeout: Option<Duration>,
    ) -> Result<GetQuery> {
        self.ensure_running()?;
        let mut options = options.unwrap_or_default();
        let timeout = timeout
            .or(options.timeout_secs.map(Duration::from_secs))
            .unwrap_or(self.inner.config.default_get_timeout);
        options.timeout_secs = Some(timeout.as_secs().max(1));

        let (request, query) = LocalRequest::get(self.inner.next_seq(), key.to_vec(), Some(options), timeout);
        self.inner.submit(Arc::new(request));
        Ok(query)
    }

    /// Remove this node's value under `key`
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ShuttingDown`] after shutdown.
    pub fn remove(&self, key: &[u8]) -> Result<MutationReceipt> {
        self.ensure_running()?;
        let (request, receipt) = LocalRequest::remove(self.inner.next_seq(), key.to_vec());
        self.inner.submit(Arc::new(request));
        Ok(receipt)
    }

    /// Snapshot of connections and queues
    #[must_use]
    pub fn status(&self) -> ProxyStatus {
        self.inner.status()
    }

    /// Local mutation state of `key`
    #[must_use]
    pub fn key_status(&self, key: &[u8]) -> Option<KeyStatus> {
        self.inner.dispatch.lock().requests.key_state(key)
    }

    /// Mutation state of the key an info-hash is announced under
    #[must_use]
    pub fn announce_status(&self, info_hash: &[u8]) -> Option<KeyStatus> {
        self.key_status(&announce_key(info_hash))
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ProxyInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.is_destroyed() {
            return Err(ProxyError::ShuttingDown);
        }
        Ok(())
    }
}

fn tracker_flags(is_seed: bool) -> DhtFlags {
    if is_seed {
        DhtFlags::SEEDING
    } else {
        DhtFlags::DOWNLOADING
    }
}
