//! Scripted peers speaking the wire protocol directly

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use umbra_crypto::random::random_id;
use umbra_relay::loopback::LoopbackNetwork;
use umbra_relay::protocol::{AllocPayload, OpRequest};
use umbra_relay::{
    AlternativeContact, Ed25519Identity, Envelope, FramedLink, MessageTransport, OpType,
    OverlayIdentity, PROTOCOL_VERSION, PeerAddress, ProxyMessage,
};

use super::overlay::WAIT_LIMIT;

const FAKE_RELAY_PORT: u16 = 7000;

fn encode(message: ProxyMessage) -> Vec<u8> {
    Envelope::new(PROTOCOL_VERSION, message).to_bytes().unwrap()
}

/// One end of a link driven by the test
pub struct RawPeer {
    link: FramedLink,
}

impl RawPeer {
    pub fn new(link: FramedLink) -> Self {
        Self { link }
    }

    /// Send a message; a closed link is ignored
    pub fn send(&self, message: ProxyMessage) {
        let _ = self.link.outgoing.send(encode(message));
    }

    /// Next message other than a keepalive, `None` once the link closed
    pub async fn recv(&mut self) -> Option<ProxyMessage> {
        loop {
            let frame = self.link.incoming.recv().await?;
            let envelope = Envelope::from_bytes(&frame).unwrap();
            if envelope.message != ProxyMessage::KeepAlive {
                return Some(envelope.message);
            }
        }
    }

    /// Like [`RawPeer::recv`], bounded by [`WAIT_LIMIT`]
    pub async fn expect(&mut self) -> Option<ProxyMessage> {
        tokio::time::timeout(WAIT_LIMIT, self.recv())
            .await
            .expect("peer stayed silent")
    }
}

/// A relay client without a relay layer behind it
pub struct RawClient {
    pub identity: Ed25519Identity,
    pub uid: String,
    probes: mpsc::UnboundedReceiver<FramedLink>,
}

impl RawClient {
    /// Generate an identity and listen on its direct endpoint
    pub fn bind(network: &LoopbackNetwork) -> Self {
        let identity = Ed25519Identity::generate(FAKE_RELAY_PORT, FAKE_RELAY_PORT + 1);
        let probes = network.bind(identity.direct_endpoint().unwrap());
        Self {
            identity,
            uid: random_id(32).unwrap(),
            probes,
        }
    }

    /// Signed allocation request addressed to `relay`
    pub fn alloc_request(&self, relay: &PeerAddress, min_ver: u32) -> ProxyMessage {
        let direct = self.identity.direct_endpoint().unwrap();
        let payload = AllocPayload {
            source_host: direct.host,
            source_port: direct.port,
            target: relay.host.clone(),
            uid: self.uid.clone(),
        };
        let sig = self.identity.sign(&payload.to_bytes().unwrap()).unwrap();
        ProxyMessage::AllocRequest {
            payload,
            sig,
            min_ver,
        }
    }

    /// Open a link to `relay`
    pub async fn connect(&self, network: &LoopbackNetwork, relay: &PeerAddress) -> RawPeer {
        RawPeer::new(network.connect(relay).await.unwrap())
    }

    /// Accept the relay's probe and answer it
    pub async fn answer_probe(&mut self) {
        let link = tokio::time::timeout(WAIT_LIMIT, self.probes.recv())
            .await
            .expect("relay never probed")
            .expect("probe listener closed");
        let mut probe = RawPeer::new(link);
        match probe.expect().await {
            Some(ProxyMessage::ProbeRequest { uid, .. }) => assert_eq!(uid, self.uid),
            other => panic!("expected a probe request, got {other:?}"),
        }
        probe.send(ProxyMessage::ProbeReply);
    }

    /// Complete the allocation handshake with `relay`
    pub async fn admit(&mut self, network: &LoopbackNetwork, relay: &PeerAddress) -> RawPeer {
        let mut peer = self.connect(network, relay).await;
        peer.send(self.alloc_request(relay, PROTOCOL_VERSION));
        self.answer_probe().await;
        match peer.expect().await {
            Some(ProxyMessage::AllocOkReply { .. }) => peer,
            other => panic!("expected an allocation reply, got {other:?}"),
        }
    }
}

struct FakeShared {
    iid: Mutex<String>,
    auto_reply: AtomicBool,
    links: Mutex<BTreeMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    next_link: AtomicU64,
    kill: watch::Sender<u64>,
}

/// A relay that accepts every client and records the operations it receives
///
/// Keepalives are echoed. With auto reply on, GETs are answered with no
/// values and mutations are confirmed.
pub struct FakeRelay {
    address: PeerAddress,
    shared: Arc<FakeShared>,
    ops: mpsc::UnboundedReceiver<OpRequest>,
}

impl FakeRelay {
    /// Listen on an overlay address derived from `seed`
    pub fn spawn(network: &LoopbackNetwork, seed: u8, iid: &str) -> Self {
        let address = PeerAddress::new(Ed25519Identity::host_for(&[seed; 32]), FAKE_RELAY_PORT);
        let (kill, _) = watch::channel(0);
        let shared = Arc::new(FakeShared {
            iid: Mutex::new(iid.to_string()),
            auto_reply: AtomicBool::new(true),
            links: Mutex::new(BTreeMap::new()),
            next_link: AtomicU64::new(0),
            kill,
        });
        let (ops_tx, ops) = mpsc::unbounded_channel();

        let mut incoming = network.bind(address.clone());
        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(link) = incoming.recv().await {
                tokio::spawn(serve(link, Arc::clone(&accept_shared), ops_tx.clone()));
            }
        });

        Self {
            address,
            shared,
            ops,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn contact(&self) -> AlternativeContact {
        AlternativeContact::new(PROTOCOL_VERSION, self.address.clone())
    }

    /// Instance id announced to clients allocating from now on
    pub fn set_iid(&self, iid: &str) {
        *self.shared.iid.lock() = iid.to_string();
    }

    pub fn set_auto_reply(&self, on: bool) {
        self.shared.auto_reply.store(on, Ordering::SeqCst);
    }

    /// Open client links
    pub fn live_links(&self) -> usize {
        self.shared.links.lock().len()
    }

    /// Drop every open client link
    pub fn disconnect_all(&self) {
        self.shared.kill.send_modify(|generation| *generation += 1);
    }

    /// Send to the most recently opened link
    pub fn send_latest(&self, message: ProxyMessage) {
        if let Some(link) = self.shared.links.lock().values().next_back() {
            let _ = link.send(encode(message));
        }
    }

    /// Next operation received on any link
    pub async fn next_op(&mut self) -> OpRequest {
        tokio::time::timeout(WAIT_LIMIT, self.ops.recv())
            .await
            .expect("no operation arrived")
            .expect("relay stopped")
    }

    /// An operation already received, if any
    pub fn try_next_op(&mut self) -> Option<OpRequest> {
        self.ops.try_recv().ok()
    }
}

async fn serve(link: FramedLink, shared: Arc<FakeShared>, ops: mpsc::UnboundedSender<OpRequest>) {
    let FramedLink {
        outgoing,
        mut incoming,
        ..
    } = link;
    let id = shared.next_link.fetch_add(1, Ordering::SeqCst);
    let mut kill = shared.kill.subscribe();
    shared.links.lock().insert(id, outgoing.clone());
    let send = |message| {
        let _ = outgoing.send(encode(message));
    };

    loop {
        tokio::select! {
            frame = incoming.recv() => {
                let Some(envelope) = frame.and_then(|frame| Envelope::from_bytes(&frame).ok()) else {
                    break;
                };
                match envelope.message {
                    ProxyMessage::AllocRequest { .. } => {
                        let iid = shared.iid.lock().clone();
                        send(ProxyMessage::AllocOkReply { iid });
                    }
                    ProxyMessage::KeepAlive => send(ProxyMessage::KeepAlive),
                    ProxyMessage::OpRequest(op) => {
                        if shared.auto_reply.load(Ordering::SeqCst) {
                            send(ProxyMessage::OpReply {
                                op_seq: op.op_seq,
                                op_values: (op.op_type == OpType::Get).then(Vec::new),
                            });
                        }
                        let _ = ops.send(op);
                    }
                    ProxyMessage::Close => break,
                    _ => {}
                }
            }
            _ = kill.changed() => break,
        }
    }
    shared.links.lock().remove(&id);
}
