//! Client side of a relay relationship.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use umbra_crypto::mask::{self, VALUE_MASK};

use super::Connection;
use crate::address::PeerAddress;
use crate::error::{ProxyError, Result};
use crate::identity::OverlayIdentity;
use crate::manager::ProxyInner;
use crate::protocol::{
    AllocPayload, Field, OpRequest, ProxyMessage, VALUE_HOST, VALUE_PORT, VALUE_SIGNATURE,
    ValueMap, decode_value, encode_value,
};
use crate::request::{LocalRequest, RequestBody};

/// Lifecycle of an outbound relay connection
///
/// `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Allocation request sent, awaiting the relay's answer
    Initialising,
    /// Relay accepted; requests may be sent
    Active,
    /// Closed or failed
    Failed,
}

#[derive(Debug)]
struct ClientState {
    phase: ClientPhase,
    remote_iid: Option<String>,
    has_been_active: bool,
    active: HashMap<u64, Arc<LocalRequest>>,
}

/// This node's use of a remote relay
#[derive(Debug)]
pub(crate) struct OutboundRelay {
    direct: PeerAddress,
    direct_host_bytes: Vec<u8>,
    uid: String,
    state: Mutex<ClientState>,
}

impl OutboundRelay {
    pub(crate) fn new(direct: PeerAddress, direct_host_bytes: Vec<u8>, uid: String) -> Self {
        Self {
            direct,
            direct_host_bytes,
            uid,
            state: Mutex::new(ClientState {
                phase: ClientPhase::Initialising,
                remote_iid: None,
                has_been_active: false,
                active: HashMap::new(),
            }),
        }
    }

    pub(crate) fn on_connected(&self, conn: &Arc<Connection>, inner: &Arc<ProxyInner>) -> Result<()> {
        let payload = AllocPayload {
            source_host: self.direct.host.clone(),
            source_port: self.direct.port,
            target: conn.remote().host.clone(),
            uid: self.uid.clone(),
        };
        let sig = inner.identity.sign(&payload.to_bytes()?)?;
        conn.send(ProxyMessage::AllocRequest {
            payload,
            sig,
            min_ver: inner.config.min_server_version,
        });
        Ok(())
    }

    pub(crate) fn on_message(
        &self,
        conn: &Arc<Connection>,
        inner: &Arc<ProxyInner>,
        message: ProxyMessage,
    ) -> Result<()> {
        match message {
            ProxyMessage::AllocOkReply { iid } => {
                {
                    let mut state = self.state.lock();
                    if state.phase != ClientPhase::Initialising {
                        return Err(ProxyError::protocol("unexpected allocation reply"));
                    }
                    state.phase = ClientPhase::Active;
                    state.has_been_active = true;
                    state.remote_iid = Some(iid.clone());
                }
                tracing::info!("Relay {} active (instance {})", conn.remote(), iid);
                inner.relay_setup_complete(conn);
                Ok(())
            }
            ProxyMessage::AllocFailReply { contacts } => {
                tracing::info!(
                    "Relay {} denied allocation, {} alternatives offered",
                    conn.remote(),
                    contacts.len()
                );
                inner.add_backup_contacts(contacts);
                conn.close();
                Ok(())
            }
            ProxyMessage::OpReply { op_seq, op_values } => {
                self.handle_reply(inner, op_seq, op_values);
                Ok(())
            }
            _ => Err(ProxyError::protocol("unexpected message for relay client")),
        }
    }

    fn handle_reply(&self, inner: &Arc<ProxyInner>, seq: u64, values: Option<Vec<Vec<u8>>>) {
        let (request, iid) = {
            let mut state = self.state.lock();
            (state.active.remove(&seq), state.remote_iid.clone().unwrap_or_default())
        };
        let Some(request) = request else {
            tracing::debug!("Ignoring reply for unknown request {}", seq);
            return;
        };

        match (&request.body, values) {
            (RequestBody::Get { sink, .. }, Some(values)) => {
                sink.values(open_values(inner.identity.as_ref(), &request.key, values));
                inner.request_complete(&request, &iid);
            }
            (RequestBody::Get { .. }, None) => inner.request_failed(&request),
            _ => inner.request_complete(&request, &iid),
        }
    }

    /// Send a local request to the relay
    ///
    /// Fails the request immediately unless the relay is active.
    pub(crate) fn add_request(
        &self,
        conn: &Arc<Connection>,
        inner: &Arc<ProxyInner>,
        request: Arc<LocalRequest>,
    ) {
        {
            let mut state = self.state.lock();
            if state.phase != ClientPhase::Active {
                drop(state);
                inner.request_failed(&request);
                return;
            }
            state.active.insert(request.seq, Arc::clone(&request));
        }

        match self.build_op(inner.identity.as_ref(), &request) {
            Ok(op) => conn.send(ProxyMessage::OpRequest(op)),
            Err(e) => {
                tracing::error!("Cannot build relayed {:?} request: {}", request.op_type(), e);
                if self.state.lock().active.remove(&request.seq).is_some() {
                    inner.request_abandoned(&request);
                }
            }
        }
    }

    fn build_op(&self, identity: &dyn OverlayIdentity, request: &LocalRequest) -> Result<OpRequest> {
        let op_value = match &request.body {
            RequestBody::Put(value) => Some(seal_value(
                identity,
                &request.key,
                &self.direct,
                &self.direct_host_bytes,
                value,
            )?),
            RequestBody::Get { .. } | RequestBody::Remove => None,
        };
        Ok(OpRequest {
            op_key: mask::op_key(&request.key).to_vec(),
            op_seq: request.seq,
            op_options: request.options,
            op_type: request.op_type(),
            op_value,
        })
    }

    /// Fail GETs that outlived their timeout while in flight
    pub(crate) fn sweep_request_timeouts(&self, inner: &Arc<ProxyInner>, now: Instant) {
        let expired: Vec<Arc<LocalRequest>> = {
            let mut state = self.state.lock();
            let seqs: Vec<u64> = state
                .active
                .values()
                .filter(|r| {
                    r.get_timeout()
                        .is_some_and(|timeout| now.saturating_duration_since(r.started) > timeout)
                })
                .map(|r| r.seq)
                .collect();
            seqs.iter().filter_map(|seq| state.active.remove(seq)).collect()
        };
        for request in expired {
            tracing::debug!("Relayed GET {} timed out", request.seq);
            inner.request_failed(&request);
        }
    }

    pub(crate) fn on_closed(&self, inner: &Arc<ProxyInner>) {
        let orphaned: Vec<Arc<LocalRequest>> = {
            let mut state = self.state.lock();
            state.phase = ClientPhase::Failed;
            state.active.drain().map(|(_, r)| r).collect()
        };
        if !orphaned.is_empty() {
            tracing::debug!("Failing {} in-flight requests", orphaned.len());
        }
        for request in orphaned {
            inner.request_failed(&request);
        }
    }

    pub(crate) fn uid(&self) -> &str {
        &self.uid
    }

    pub(crate) fn phase(&self) -> ClientPhase {
        self.state.lock().phase
    }

    pub(crate) fn is_active(&self) -> bool {
        self.phase() == ClientPhase::Active
    }

    pub(crate) fn has_been_active(&self) -> bool {
        self.state.lock().has_been_active
    }

    pub(crate) fn remote_iid(&self) -> Option<String> {
        self.state.lock().remote_iid.clone()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().active.len()
    }
}

/// Sign and mask a value for publication through a relay
///
/// The publisher's host bytes and port are added under the reserved keys, the
/// signature covers that map, and the encoded result is masked with `key`.
pub(crate) fn seal_value(
    identity: &dyn OverlayIdentity,
    key: &[u8],
    direct: &PeerAddress,
    host_bytes: &[u8],
    value: &ValueMap,
) -> Result<Vec<u8>> {
    let mut sealed = value.clone();
    sealed.insert(VALUE_HOST.into(), Field::Bytes(host_bytes.to_vec()));
    sealed.insert(VALUE_PORT.into(), Field::Int(i64::from(direct.port)));
    let signature = identity.sign(&encode_value(&sealed)?)?;
    sealed.insert(VALUE_SIGNATURE.into(), Field::Bytes(signature));

    let mut bytes = encode_value(&sealed)?;
    VALUE_MASK.apply(key, &mut bytes);
    Ok(bytes)
}

/// Unmask and verify relayed values, dropping any that fail
pub(crate) fn open_values(
    identity: &dyn OverlayIdentity,
    key: &[u8],
    values: Vec<Vec<u8>>,
) -> Vec<ValueMap> {
    values
        .into_iter()
        .filter_map(|mut bytes| {
            VALUE_MASK.apply(key, &mut bytes);
            let opened = open_value(identity, &bytes);
            if opened.is_none() {
                tracing::debug!("Dropping unverifiable relayed value");
            }
            opened
        })
        .collect()
}

fn open_value(identity: &dyn OverlayIdentity, bytes: &[u8]) -> Option<ValueMap> {
    let mut value = decode_value(bytes).ok()?;
    let Field::Bytes(signature) = value.remove(VALUE_SIGNATURE)? else {
        return None;
    };
    let host_bytes = value.get(VALUE_HOST)?.as_bytes()?.to_vec();
    let signed = encode_value(&value).ok()?;
    if !identity.verify(&host_bytes, &signed, &signature) {
        return None;
    }
    let host = identity.bytes_to_host(&host_bytes)?;
    value.insert(VALUE_HOST.into(), Field::Text(host));
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Ed25519Identity;

    fn publisher() -> (Ed25519Identity, PeerAddress, Vec<u8>) {
        let identity = Ed25519Identity::generate(6000, 6001);
        let direct = identity.direct_endpoint().unwrap();
        let host_bytes = identity.host_to_bytes(&direct.host).unwrap();
        (identity, direct, host_bytes)
    }

    fn sample_value() -> ValueMap {
        let mut value = ValueMap::new();
        value.insert("s".into(), Field::Int(1));
        value
    }

    #[test]
    fn test_sealed_value_opens_with_host_text() {
        let (identity, direct, host_bytes) = publisher();
        let sealed = seal_value(&identity, b"key", &direct, &host_bytes, &sample_value()).unwrap();

        let opened = open_values(&identity, b"key", vec![sealed]);
        assert_eq!(opened.len(), 1);
        let value = &opened[0];
        assert_eq!(value.get(VALUE_HOST).and_then(Field::as_text), Some(direct.host.as_str()));
        assert_eq!(value.get(VALUE_PORT).and_then(Field::as_int), Some(6001));
        assert_eq!(value.get("s").and_then(Field::as_int), Some(1));
        assert!(!value.contains_key(VALUE_SIGNATURE));
    }

    #[test]
    fn test_sealed_value_is_masked() {
        let (identity, direct, host_bytes) = publisher();
        let sealed = seal_value(&identity, b"key", &direct, &host_bytes, &sample_value()).unwrap();
        assert_ne!(decode_value(&sealed).ok(), Some(sample_value()));
    }

    #[test]
    fn test_wrong_key_is_dropped() {
        let (identity, direct, host_bytes) = publisher();
        let sealed = seal_value(&identity, b"key", &direct, &host_bytes, &sample_value()).unwrap();
        assert!(open_values(&identity, b"other", vec![sealed]).is_empty());
    }

    #[test]
    fn test_forged_host_is_dropped() {
        let (identity, direct, _) = publisher();
        let (other, _, other_bytes) = publisher();
        // Signed by `identity` but claiming `other`'s host
        let sealed = seal_value(&identity, b"key", &direct, &other_bytes, &sample_value()).unwrap();
        assert!(open_values(&other, b"key", vec![sealed]).is_empty());
    }

    #[test]
    fn test_tampered_value_is_dropped() {
        let (identity, direct, host_bytes) = publisher();
        let mut sealed =
            seal_value(&identity, b"key", &direct, &host_bytes, &sample_value()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let good = seal_value(&identity, b"key", &direct, &host_bytes, &sample_value()).unwrap();
        let opened = open_values(&identity, b"key", vec![sealed, good]);
        assert_eq!(opened.len(), 1);
    }

    #[test]
    fn test_new_relay_starts_initialising() {
        let relay = OutboundRelay::new(PeerAddress::new("a.umbra", 1), vec![0; 32], "uid".into());
        assert_eq!(relay.phase(), ClientPhase::Initialising);
        assert!(!relay.is_active());
        assert!(!relay.has_been_active());
        assert_eq!(relay.uid(), "uid");
        assert_eq!(relay.in_flight(), 0);
        assert_eq!(relay.remote_iid(), None);
    }
}
