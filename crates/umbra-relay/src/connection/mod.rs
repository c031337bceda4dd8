//! Relay connections
//!
//! One [`Connection`] type carries every link the relay layer opens or
//! accepts. Framing, keepalive, idle and forced-disconnect timers, and the
//! exactly-once close live here; the handshake and request handling of each
//! side live in a [`Role`].
//!
//! | Role | Opened by | Purpose |
//! |------|-----------|---------|
//! | [`Role::RelayClient`] | this node | use a remote relay |
//! | [`Role::RelayServer`] | a client | serve as that client's relay |
//! | [`Role::ProbeClient`] | this node as relay | check a claimed client is reachable |
//! | [`Role::ProbeServer`] | a relay | answer that check |

mod inbound;
mod outbound;
mod probe;

pub(crate) use inbound::InboundRelay;
pub(crate) use outbound::OutboundRelay;
pub(crate) use probe::{InboundProbe, OutboundProbe};

pub use inbound::{RemoteQueueStats, ServerPhase};
pub use outbound::ClientPhase;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use crate::address::PeerAddress;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::manager::ProxyInner;
use crate::protocol::{Envelope, ProxyMessage};
use crate::transport::FramedLink;

/// Role-specific behaviour of a connection
#[derive(Debug)]
pub(crate) enum Role {
    /// This node using a remote relay
    RelayClient(OutboundRelay),
    /// This node relaying for a remote client
    RelayServer(InboundRelay),
    /// Reachability check opened by this node as a relay
    ProbeClient(OutboundProbe),
    /// Reachability check opened by a remote relay
    ProbeServer(InboundProbe),
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::RelayClient(_) => "relay-client",
            Role::RelayServer(_) => "relay-server",
            Role::ProbeClient(_) => "probe-client",
            Role::ProbeServer(_) => "probe-server",
        }
    }
}

/// Link state guarded together
#[derive(Debug)]
struct LinkState {
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    connected: bool,
    last_sent: Instant,
    last_received: Instant,
    disconnect_at: Option<Instant>,
}

/// Timer decision taken under the link lock
enum TimerAction {
    None,
    KeepAlive,
    Fail(ProxyError),
}

/// A relay-layer link
#[derive(Debug)]
pub(crate) struct Connection {
    id: u64,
    remote: PeerAddress,
    version: u32,
    created: Instant,
    role: Role,
    link: Mutex<LinkState>,
    closed: AtomicBool,
    reader_stop: Notify,
    inner: Weak<ProxyInner>,
}

impl Connection {
    fn new(inner: &Arc<ProxyInner>, remote: PeerAddress, role: Role) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id: inner.next_connection_id(),
            remote,
            version: inner.config.local_version,
            created: now,
            role,
            link: Mutex::new(LinkState {
                outgoing: None,
                connected: false,
                last_sent: now,
                last_received: now,
                disconnect_at: None,
            }),
            closed: AtomicBool::new(false),
            reader_stop: Notify::new(),
            inner: Arc::downgrade(inner),
        })
    }

    /// Register a connection to `target` and dial it in the background
    pub(crate) fn open(inner: &Arc<ProxyInner>, target: PeerAddress, role: Role) -> Arc<Self> {
        let conn = Self::new(inner, target.clone(), role);
        tracing::debug!("Opening {} connection to {}", conn.role.name(), target);
        inner.add_connection(&conn);

        let transport = Arc::clone(&inner.transport);
        let connect_timeout = inner.config.connect_timeout;
        let task_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            match tokio::time::timeout(connect_timeout, transport.connect(&target)).await {
                Ok(Ok(link)) => task_conn.attach(link),
                Ok(Err(e)) => task_conn.fail(e),
                Err(_) => task_conn.fail(ProxyError::timeout("connect")),
            }
        });
        conn
    }

    /// Register an inbound link
    pub(crate) fn accept(inner: &Arc<ProxyInner>, link: FramedLink, role: Role) -> Arc<Self> {
        let conn = Self::new(inner, link.remote.clone(), role);
        tracing::debug!("Accepted {} connection on {}", conn.role.name(), conn.remote);
        inner.add_connection(&conn);
        conn.attach(link);
        conn
    }

    fn attach(self: &Arc<Self>, link: FramedLink) {
        let FramedLink {
            outgoing, incoming, ..
        } = link;
        {
            let mut state = self.link.lock();
            if self.is_closed() {
                return;
            }
            let now = Instant::now();
            state.outgoing = Some(outgoing);
            state.connected = true;
            state.last_sent = now;
            state.last_received = now;
        }
        self.spawn_reader(incoming);

        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let result = match &self.role {
            Role::RelayClient(client) => client.on_connected(self, &inner),
            Role::ProbeClient(probe) => probe.on_connected(self, &inner),
            Role::RelayServer(_) | Role::ProbeServer(_) => Ok(()),
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Vec<u8>>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = incoming.recv() => frame,
                    () = conn.reader_stop.notified() => return,
                };
                let Some(frame) = frame else {
                    conn.fail(ProxyError::transport("link closed by peer"));
                    return;
                };
                if conn.is_closed() {
                    return;
                }
                if matches!(conn.role, Role::RelayServer(_)) {
                    let Some(inner) = conn.inner.upgrade() else {
                        return;
                    };
                    inner.limiter.acquire(frame.len()).await;
                }
                conn.receive(&frame);
            }
        });
    }

    fn receive(self: &Arc<Self>, frame: &[u8]) {
        self.link.lock().last_received = Instant::now();

        let envelope = match Envelope::from_bytes(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        tracing::trace!(
            "{} <- {}: {:?} (v{})",
            self.role.name(),
            self.remote,
            envelope.message.message_type(),
            envelope.version
        );

        match envelope.message {
            ProxyMessage::KeepAlive => {}
            ProxyMessage::Close => {
                self.link.lock().disconnect_at = Some(Instant::now());
            }
            message => {
                let Some(inner) = self.inner.upgrade() else {
                    return;
                };
                let result = match &self.role {
                    Role::RelayClient(client) => client.on_message(self, &inner, message),
                    Role::RelayServer(server) => server.on_message(self, &inner, message),
                    Role::ProbeClient(probe) => probe.on_message(self, &inner, message),
                    Role::ProbeServer(probe) => probe.on_message(self, &inner, message),
                };
                if let Err(e) = result {
                    self.fail(e);
                }
            }
        }
    }

    /// Queue a message on the link
    ///
    /// A send on a link that is gone fails the connection.
    pub(crate) fn send(self: &Arc<Self>, message: ProxyMessage) {
        let message_type = message.message_type();
        let frame = match Envelope::new(self.version, message).to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let result = {
            let mut state = self.link.lock();
            match &state.outgoing {
                Some(tx) => {
                    let sent = tx.send(frame).map_err(|_| ProxyError::transport("link closed"));
                    state.last_sent = Instant::now();
                    sent
                }
                None => Err(ProxyError::transport("not connected")),
            }
        };
        match result {
            Ok(()) => tracing::trace!("{} -> {}: {:?}", self.role.name(), self.remote, message_type),
            Err(e) => self.fail(e),
        }
    }

    /// Close after `delay` even if the peer stays
    pub(crate) fn disconnect_after(&self, delay: Duration) {
        self.link.lock().disconnect_at = Some(Instant::now() + delay);
    }

    /// Close normally
    pub(crate) fn close(self: &Arc<Self>) {
        self.terminate(None);
    }

    /// Close because of `error`
    pub(crate) fn fail(self: &Arc<Self>, error: ProxyError) {
        self.terminate(Some(error));
    }

    fn terminate(self: &Arc<Self>, error: Option<ProxyError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let expected = {
            let mut state = self.link.lock();
            state.outgoing = None;
            state.connected = false;
            state.disconnect_at.is_some()
        };
        self.reader_stop.notify_one();

        match error {
            Some(e) if e.is_protocol_violation() => {
                tracing::warn!("{} connection {} failed: {}", self.role.name(), self.remote, e);
            }
            Some(e) if !expected => {
                tracing::debug!("{} connection {} failed: {}", self.role.name(), self.remote, e);
            }
            _ => tracing::debug!("{} connection {} closed", self.role.name(), self.remote),
        }

        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.remove_connection(self);
        match &self.role {
            Role::RelayClient(client) => client.on_closed(&inner),
            Role::RelayServer(server) => server.on_closed(),
            Role::ProbeClient(probe) => probe.on_closed(&inner),
            Role::ProbeServer(_) => {}
        }
    }

    /// Periodic timer check
    pub(crate) fn timer_tick(self: &Arc<Self>, now: Instant, config: &ProxyConfig) {
        let action = {
            let state = self.link.lock();
            if state.disconnect_at.is_some_and(|at| now >= at) {
                TimerAction::Fail(ProxyError::timeout("forced disconnect"))
            } else if !state.connected {
                TimerAction::None
            } else if now.saturating_duration_since(state.last_received) > config.idle_timeout {
                TimerAction::Fail(ProxyError::timeout("inactivity"))
            } else if now.saturating_duration_since(state.last_sent) >= config.keepalive_interval {
                TimerAction::KeepAlive
            } else {
                TimerAction::None
            }
        };
        match action {
            TimerAction::None => {}
            TimerAction::KeepAlive => self.send(ProxyMessage::KeepAlive),
            TimerAction::Fail(e) => self.fail(e),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    pub(crate) fn as_relay_client(&self) -> Option<&OutboundRelay> {
        match &self.role {
            Role::RelayClient(client) => Some(client),
            _ => None,
        }
    }

    pub(crate) fn as_relay_server(&self) -> Option<&InboundRelay> {
        match &self.role {
            Role::RelayServer(server) => Some(server),
            _ => None,
        }
    }
}
