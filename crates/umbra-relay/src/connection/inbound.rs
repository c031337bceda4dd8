//! Server side of a relay relationship.
//!
//! Admission runs in three steps: version and capacity checks (denial sends
//! alternative contacts), signature verification, then a probe back to the
//! claimed source. Only an active relationship executes requests, through
//! two FIFO lanes with independent concurrency caps.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use umbra_crypto::mask;

use super::{Connection, OutboundProbe, Role};
use crate::address::PeerAddress;
use crate::config::ProxyConfig;
use crate::dht::DhtFlags;
use crate::error::{ProxyError, Result};
use crate::manager::{InboundAdmission, ProxyInner};
use crate::protocol::{AllocPayload, MAX_MESSAGE_SIZE, OpOptions, OpRequest, OpType, ProxyMessage};

/// Room left in an OP_REPLY frame for everything but the values
const REPLY_OVERHEAD: usize = 1024;

/// Lifecycle of an inbound relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    /// Awaiting an allocation request
    Initialising,
    /// Signature verified, probing the claimed source
    ProbeSent,
    /// Probe failed, denial sent
    ProbeFailed,
    /// Serving requests
    Active,
    /// Closed or failed
    Failed,
}

/// Execution lane of a remote request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Get,
    Mutation,
}

impl Lane {
    const fn index(self) -> usize {
        match self {
            Lane::Get => 0,
            Lane::Mutation => 1,
        }
    }
}

#[derive(Debug)]
pub(crate) enum RemoteOp {
    Put(Vec<u8>),
    Get,
    Remove,
}

/// A client's operation awaiting execution
#[derive(Debug)]
pub(crate) struct RemoteRequest {
    pub(crate) seq: u64,
    pub(crate) key: Vec<u8>,
    pub(crate) op: RemoteOp,
    pub(crate) options: Option<OpOptions>,
    pub(crate) queued_at: Instant,
}

impl RemoteRequest {
    pub(crate) fn lane(&self) -> Lane {
        match self.op {
            RemoteOp::Get => Lane::Get,
            RemoteOp::Put(_) | RemoteOp::Remove => Lane::Mutation,
        }
    }
}

/// Result of admitting a remote request
#[derive(Debug)]
pub(crate) enum Admission {
    /// Queue ceiling or key bound reached
    Dropped,
    /// Waiting for a free slot
    Queued,
    /// Start this request now
    Execute(RemoteRequest),
}

/// Per-lane snapshot of an inbound relay's work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteQueueStats {
    /// GETs executing
    pub active_gets: usize,
    /// PUTs and REMOVEs executing
    pub active_mutations: usize,
    /// GETs waiting
    pub queued_gets: usize,
    /// PUTs and REMOVEs waiting
    pub queued_mutations: usize,
    /// Keys this relay holds a PUT for
    pub held_keys: usize,
}

/// FIFO admission queues of one inbound relay
///
/// New requests enter at the front and leave from the back.
#[derive(Debug)]
pub(crate) struct RemoteQueues {
    queued: [VecDeque<RemoteRequest>; 2],
    active: [usize; 2],
    caps: [usize; 2],
    max_queued: usize,
    max_keys: usize,
    keys: HashSet<Vec<u8>>,
}

impl RemoteQueues {
    pub(crate) fn new(config: &ProxyConfig) -> Self {
        Self {
            queued: [VecDeque::new(), VecDeque::new()],
            active: [0, 0],
            caps: [config.max_active_gets, config.max_active_mutations],
            max_queued: config.max_queued_remote,
            max_keys: config.max_key_state,
            keys: HashSet::new(),
        }
    }

    fn queued_total(&self) -> usize {
        self.queued.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn admit(&mut self, request: RemoteRequest) -> Admission {
        if self.queued_total() >= self.max_queued {
            return Admission::Dropped;
        }
        if matches!(request.op, RemoteOp::Put(_))
            && !self.keys.contains(&request.key)
            && self.keys.len() >= self.max_keys
        {
            return Admission::Dropped;
        }
        let lane = request.lane();
        self.queued[lane.index()].push_front(request);
        match self.next(lane) {
            Some(request) => Admission::Execute(request),
            None => Admission::Queued,
        }
    }

    fn next(&mut self, lane: Lane) -> Option<RemoteRequest> {
        let i = lane.index();
        if self.active[i] >= self.caps[i] {
            return None;
        }
        let request = self.queued[i].pop_back()?;
        self.active[i] += 1;
        match request.op {
            RemoteOp::Put(_) => {
                self.keys.insert(request.key.clone());
            }
            RemoteOp::Remove => {
                self.keys.remove(&request.key);
            }
            RemoteOp::Get => {}
        }
        Some(request)
    }

    /// Release a slot and take the next request of the same lane
    pub(crate) fn complete(&mut self, lane: Lane) -> Option<RemoteRequest> {
        let i = lane.index();
        self.active[i] = self.active[i].saturating_sub(1);
        self.next(lane)
    }

    /// Remove queued GETs for which `expired` holds
    pub(crate) fn expire_gets(
        &mut self,
        expired: impl Fn(&RemoteRequest) -> bool,
    ) -> Vec<RemoteRequest> {
        let lane = &mut self.queued[Lane::Get.index()];
        let (gone, kept): (VecDeque<_>, VecDeque<_>) = lane.drain(..).partition(|r| expired(r));
        *lane = kept;
        gone.into_iter().collect()
    }

    pub(crate) fn clear(&mut self) {
        for lane in &mut self.queued {
            lane.clear();
        }
        self.keys.clear();
    }

    pub(crate) fn stats(&self) -> RemoteQueueStats {
        RemoteQueueStats {
            active_gets: self.active[Lane::Get.index()],
            active_mutations: self.active[Lane::Mutation.index()],
            queued_gets: self.queued[Lane::Get.index()].len(),
            queued_mutations: self.queued[Lane::Mutation.index()].len(),
            held_keys: self.keys.len(),
        }
    }
}

#[derive(Debug)]
struct ServerState {
    phase: ServerPhase,
    source_host: Option<String>,
    queues: RemoteQueues,
}

/// This node relaying for a remote client
#[derive(Debug)]
pub(crate) struct InboundRelay {
    state: Mutex<ServerState>,
}

impl InboundRelay {
    pub(crate) fn new(config: &ProxyConfig) -> Self {
        Self {
            state: Mutex::new(ServerState {
                phase: ServerPhase::Initialising,
                source_host: None,
                queues: RemoteQueues::new(config),
            }),
        }
    }

    pub(crate) fn on_message(
        &self,
        conn: &Arc<Connection>,
        inner: &Arc<ProxyInner>,
        message: ProxyMessage,
    ) -> Result<()> {
        match message {
            ProxyMessage::AllocRequest {
                payload,
                sig,
                min_ver,
            } => self.handle_alloc(conn, inner, payload, &sig, min_ver),
            ProxyMessage::OpRequest(op) => self.handle_op(conn, inner, op),
            _ => Err(ProxyError::protocol("unexpected message for relay server")),
        }
    }

    fn handle_alloc(
        &self,
        conn: &Arc<Connection>,
        inner: &Arc<ProxyInner>,
        payload: AllocPayload,
        sig: &[u8],
        min_ver: u32,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.phase != ServerPhase::Initialising || state.source_host.is_some() {
                return Err(ProxyError::protocol("repeated allocation request"));
            }
            state.source_host = Some(payload.source_host.clone());
        }

        if !inner.config.server_enabled {
            return Err(ProxyError::protocol("relay service disabled"));
        }
        let relay = inner
            .identity
            .relay_endpoint()
            .ok_or(ProxyError::not_ready("relay endpoint unknown"))?;
        if payload.target != relay.host {
            return Err(ProxyError::protocol("allocation addressed to another relay"));
        }

        let denied = if min_ver > inner.config.local_version {
            tracing::info!(
                "Denying {}: requires version {} (local {})",
                payload.source_host,
                min_ver,
                inner.config.local_version
            );
            true
        } else {
            match inner.admit_inbound(conn, &payload.source_host) {
                InboundAdmission::Admitted => false,
                InboundAdmission::Full => {
                    tracing::info!("Denying {}: relay capacity reached", payload.source_host);
                    true
                }
                InboundAdmission::Duplicate => {
                    return Err(ProxyError::protocol("duplicate relay client"));
                }
                InboundAdmission::Closed => return Ok(()),
            }
        };
        if denied {
            conn.send(ProxyMessage::AllocFailReply {
                contacts: inner.denial_contacts(min_ver),
            });
            conn.disconnect_after(inner.config.deny_disconnect_delay);
            return Ok(());
        }

        let source_bytes = inner
            .identity
            .host_to_bytes(&payload.source_host)
            .ok_or(ProxyError::protocol("source is not an overlay host"))?;
        if !inner.identity.verify(&source_bytes, &payload.to_bytes()?, sig) {
            return Err(ProxyError::protocol("allocation signature mismatch"));
        }

        self.state.lock().phase = ServerPhase::ProbeSent;
        tracing::debug!("Probing relay client {}:{}", payload.source_host, payload.source_port);
        let target = PeerAddress::new(payload.source_host, payload.source_port);
        let probe = OutboundProbe::new(Arc::downgrade(conn), payload.uid, relay.host);
        let probe_conn = Connection::open(inner, target, Role::ProbeClient(probe));
        probe_conn.disconnect_after(inner.config.probe_timeout);
        Ok(())
    }

    pub(crate) fn probe_succeeded(&self, conn: &Arc<Connection>, inner: &Arc<ProxyInner>) {
        let source = {
            let mut state = self.state.lock();
            if state.phase != ServerPhase::ProbeSent {
                return;
            }
            state.phase = ServerPhase::Active;
            state.source_host.clone().unwrap_or_default()
        };
        tracing::info!("Relaying for {}", source);
        conn.send(ProxyMessage::AllocOkReply {
            iid: inner.instance_id.clone(),
        });
    }

    pub(crate) fn probe_failed(&self, conn: &Arc<Connection>, inner: &Arc<ProxyInner>) {
        let source = {
            let mut state = self.state.lock();
            if state.phase != ServerPhase::ProbeSent {
                return;
            }
            state.phase = ServerPhase::ProbeFailed;
            state.source_host.clone().unwrap_or_default()
        };
        tracing::info!("Probe of {} failed", source);
        conn.send(ProxyMessage::AllocFailReply {
            contacts: Vec::new(),
        });
        conn.disconnect_after(inner.config.deny_disconnect_delay);
    }

    fn handle_op(&self, conn: &Arc<Connection>, inner: &Arc<ProxyInner>, op: OpRequest) -> Result<()> {
        let OpRequest {
            op_key,
            op_seq,
            op_options,
            op_type,
            op_value,
        } = op;
        let remote_op = match (op_type, op_value) {
            (OpType::Put, Some(value)) => RemoteOp::Put(value),
            (OpType::Put, None) => return Err(ProxyError::protocol("PUT without value")),
            (OpType::Get, _) => RemoteOp::Get,
            (OpType::Remove, _) => RemoteOp::Remove,
        };
        let request = RemoteRequest {
            seq: op_seq,
            key: op_key,
            op: remote_op,
            options: op_options,
            queued_at: Instant::now(),
        };

        let admission = {
            let mut state = self.state.lock();
            if state.phase != ServerPhase::Active {
                tracing::debug!("Ignoring request {} before activation", op_seq);
                return Ok(());
            }
            state.queues.admit(request)
        };
        match admission {
            Admission::Dropped => tracing::debug!("Dropping remote request {}: queue full", op_seq),
            Admission::Queued => tracing::trace!("Queued remote request {}", op_seq),
            Admission::Execute(request) => execute(conn, inner, request),
        }
        Ok(())
    }

    fn finished(&self, conn: &Arc<Connection>, inner: &Arc<ProxyInner>, lane: Lane) {
        let next = {
            let mut state = self.state.lock();
            let next = state.queues.complete(lane);
            if state.phase == ServerPhase::Active {
                next
            } else {
                None
            }
        };
        if let Some(request) = next {
            execute(conn, inner, request);
        }
    }

    /// Answer queued GETs that outlived their timeout
    pub(crate) fn check_requests(&self, conn: &Arc<Connection>, config: &ProxyConfig, now: Instant) {
        let expired = self.state.lock().queues.expire_gets(|r| {
            now.saturating_duration_since(r.queued_at) > remote_get_timeout(config, r.options)
        });
        for request in expired {
            tracing::debug!("Queued remote GET {} timed out", request.seq);
            conn.send(ProxyMessage::OpReply {
                op_seq: request.seq,
                op_values: None,
            });
        }
    }

    pub(crate) fn on_closed(&self) {
        let mut state = self.state.lock();
        state.phase = ServerPhase::Failed;
        state.queues.clear();
    }

    pub(crate) fn phase(&self) -> ServerPhase {
        self.state.lock().phase
    }

    pub(crate) fn source_host(&self) -> Option<String> {
        self.state.lock().source_host.clone()
    }

    pub(crate) fn stats(&self) -> RemoteQueueStats {
        self.state.lock().queues.stats()
    }
}

/// Timeout of a relayed GET: the option if shorter than the default
fn remote_get_timeout(config: &ProxyConfig, options: Option<OpOptions>) -> Duration {
    options
        .and_then(|o| o.timeout_secs)
        .map_or(config.default_get_timeout, |secs| {
            config.default_get_timeout.min(Duration::from_secs(secs))
        })
}

fn remote_num_want(config: &ProxyConfig, options: Option<OpOptions>) -> usize {
    match options.and_then(|o| o.num_want) {
        Some(n) if n < config.max_num_want => n as usize,
        _ => config.default_num_want as usize,
    }
}

/// Drop duplicates and keep the reply within one frame
fn bound_values(values: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let budget = MAX_MESSAGE_SIZE as usize - REPLY_OVERHEAD;
    let mut seen = HashSet::new();
    let mut used = 0;
    let mut kept = Vec::new();
    for value in values {
        let cost = value.len() + 9;
        if used + cost > budget {
            break;
        }
        if seen.insert(value.clone()) {
            used += cost;
            kept.push(value);
        }
    }
    kept
}

fn execute(conn: &Arc<Connection>, inner: &Arc<ProxyInner>, request: RemoteRequest) {
    let conn = Arc::clone(conn);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let lane = request.lane();
        let reply = run(&inner, request).await;
        if !conn.is_closed() {
            conn.send(reply);
        }
        if let Some(server) = conn.as_relay_server() {
            server.finished(&conn, &inner, lane);
        }
    });
}

async fn run(inner: &ProxyInner, request: RemoteRequest) -> ProxyMessage {
    let config = &inner.config;
    let key = mask::remote_key(&request.key);
    let flags = DhtFlags::from_bits(request.options.and_then(|o| o.flags).unwrap_or(0)).relayable();

    let op_values = match request.op {
        RemoteOp::Put(value) => {
            let outcome = inner
                .dht
                .put(&key, value, flags | DhtFlags::SINGLE_VALUE | DhtFlags::ANON)
                .await;
            tracing::trace!("Remote PUT {} finished: {:?}", request.seq, outcome);
            None
        }
        RemoteOp::Remove => {
            let outcome = inner.dht.remove(&key).await;
            tracing::trace!("Remote REMOVE {} finished: {:?}", request.seq, outcome);
            None
        }
        RemoteOp::Get => {
            let timeout = remote_get_timeout(config, request.options);
            let remaining = timeout.saturating_sub(request.queued_at.elapsed());
            if remaining < config.min_get_budget {
                tracing::debug!("Remote GET {} has no time left", request.seq);
                None
            } else {
                let num_want = remote_num_want(config, request.options);
                let result = inner.dht.get(&key, flags, num_want, remaining).await;
                tracing::trace!(
                    "Remote GET {} found {} values (timed out: {})",
                    request.seq,
                    result.values.len(),
                    result.timed_out
                );
                Some(bound_values(result.values))
            }
        }
    };
    ProxyMessage::OpReply {
        op_seq: request.seq,
        op_values,
    }
}
