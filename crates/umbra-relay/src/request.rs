//! Local requests and their completion handles.
//!
//! A [`LocalRequest`] is shared between the dispatch queue, the per-key state
//! and the outbound connection tracking it. Completion is delivered through
//! single-use senders taken out of a lock, so whichever of reply, timeout or
//! connection failure gets there first is the only one that signals.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::address::PeerAddress;
use crate::protocol::{OpOptions, OpType, ValueMap};

/// Event of a running GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetEvent {
    /// Verified values from one relay reply
    Values(Vec<ValueMap>),
    /// The GET finished; no further events follow
    Complete {
        /// The GET failed or hit its deadline
        timed_out: bool,
    },
}

/// Caller side of a GET
#[derive(Debug)]
pub struct GetQuery {
    events: mpsc::UnboundedReceiver<GetEvent>,
}

impl GetQuery {
    /// Next event, or `None` after [`GetEvent::Complete`]
    pub async fn next_event(&mut self) -> Option<GetEvent> {
        self.events.recv().await
    }

    /// Wait for completion, collecting every value
    ///
    /// Returns the values and whether the GET timed out.
    pub async fn collect(mut self) -> (Vec<ValueMap>, bool) {
        let mut values = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                GetEvent::Values(batch) => values.extend(batch),
                GetEvent::Complete { timed_out } => return (values, timed_out),
            }
        }
        (values, true)
    }
}

/// Peer found by a tracker query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnouncement {
    /// Publisher's direct endpoint
    pub originator: PeerAddress,
    /// Publisher is seeding
    pub is_seed: bool,
    /// Publisher requires an encrypted handshake
    pub requires_crypto: bool,
}

/// Event of a tracker query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    /// A peer announcement
    Peer(PeerAnnouncement),
    /// The query finished
    Complete {
        /// The query failed or hit its deadline
        timed_out: bool,
    },
}

/// Caller side of a tracker query
#[derive(Debug)]
pub struct PeerQuery {
    inner: GetQuery,
    ready: std::collections::VecDeque<PeerAnnouncement>,
}

impl PeerQuery {
    pub(crate) fn new(inner: GetQuery) -> Self {
        Self {
            inner,
            ready: std::collections::VecDeque::new(),
        }
    }

    /// Next event, or `None` after [`QueryEvent::Complete`]
    pub async fn next_event(&mut self) -> Option<QueryEvent> {
        loop {
            if let Some(peer) = self.ready.pop_front() {
                return Some(QueryEvent::Peer(peer));
            }
            match self.inner.next_event().await? {
                GetEvent::Values(values) => {
                    self.ready.extend(values.iter().filter_map(parse_announcement));
                }
                GetEvent::Complete { timed_out } => return Some(QueryEvent::Complete { timed_out }),
            }
        }
    }

    /// Wait for completion, collecting every peer
    pub async fn collect(mut self) -> (Vec<PeerAnnouncement>, bool) {
        let mut peers = Vec::new();
        while let Some(event) = self.next_event().await {
            match event {
                QueryEvent::Peer(peer) => peers.push(peer),
                QueryEvent::Complete { timed_out } => return (peers, timed_out),
            }
        }
        (peers, true)
    }
}

fn parse_announcement(value: &ValueMap) -> Option<PeerAnnouncement> {
    use crate::protocol::{VALUE_HOST, VALUE_PORT};

    let host = value.get(VALUE_HOST)?.as_text()?;
    let port = u16::try_from(value.get(VALUE_PORT)?.as_int()?).ok()?;
    let flag = |key: &str| value.get(key).and_then(|f| f.as_int()).is_some_and(|v| v != 0);
    Some(PeerAnnouncement {
        originator: PeerAddress::new(host, port),
        is_seed: flag("s"),
        requires_crypto: flag("c"),
    })
}

/// Resolves when a relay confirmed a PUT or REMOVE
///
/// If the mutation was superseded before it was sent, the receipt follows the
/// request that replaced it.
#[derive(Debug)]
pub struct MutationReceipt {
    rx: oneshot::Receiver<()>,
}

impl MutationReceipt {
    /// True once confirmed, false if the request was dropped
    pub async fn confirmed(self) -> bool {
        self.rx.await.is_ok()
    }
}

/// Single-use delivery point of a GET
#[derive(Debug)]
pub(crate) struct GetSink {
    events: Mutex<Option<mpsc::UnboundedSender<GetEvent>>>,
}

impl GetSink {
    fn new() -> (Self, GetQuery) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: Mutex::new(Some(tx)),
            },
            GetQuery { events: rx },
        )
    }

    /// Deliver values unless the GET already finished
    pub(crate) fn values(&self, values: Vec<ValueMap>) {
        if values.is_empty() {
            return;
        }
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(GetEvent::Values(values));
        }
    }

    /// Finish the GET; only the first call has any effect
    pub(crate) fn finish(&self, timed_out: bool) -> bool {
        let Some(tx) = self.events.lock().take() else {
            return false;
        };
        let _ = tx.send(GetEvent::Complete { timed_out });
        true
    }
}

/// Operation-specific part of a request
#[derive(Debug)]
pub(crate) enum RequestBody {
    Put(ValueMap),
    Get { timeout: Duration, sink: GetSink },
    Remove,
}

/// A caller's DHT operation
#[derive(Debug)]
pub(crate) struct LocalRequest {
    pub(crate) seq: u64,
    pub(crate) started: Instant,
    pub(crate) key: Vec<u8>,
    pub(crate) options: Option<OpOptions>,
    pub(crate) body: RequestBody,
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl LocalRequest {
    fn new(seq: u64, key: Vec<u8>, options: Option<OpOptions>, body: RequestBody) -> Self {
        Self {
            seq,
            started: Instant::now(),
            key,
            options,
            body,
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// A PUT and the receipt confirming it
    pub(crate) fn put(
        seq: u64,
        key: Vec<u8>,
        value: ValueMap,
        options: Option<OpOptions>,
    ) -> (Self, MutationReceipt) {
        let request = Self::new(seq, key, options, RequestBody::Put(value));
        let receipt = request.receipt();
        (request, receipt)
    }

    /// A REMOVE and the receipt confirming it
    pub(crate) fn remove(seq: u64, key: Vec<u8>) -> (Self, MutationReceipt) {
        let request = Self::new(seq, key, None, RequestBody::Remove);
        let receipt = request.receipt();
        (request, receipt)
    }

    /// A GET and the query handle receiving its results
    pub(crate) fn get(
        seq: u64,
        key: Vec<u8>,
        options: Option<OpOptions>,
        timeout: Duration,
    ) -> (Self, GetQuery) {
        let (sink, query) = GetSink::new();
        (
            Self::new(seq, key, options, RequestBody::Get { timeout, sink }),
            query,
        )
    }

    pub(crate) fn op_type(&self) -> OpType {
        match self.body {
            RequestBody::Put(_) => OpType::Put,
            RequestBody::Get { .. } => OpType::Get,
            RequestBody::Remove => OpType::Remove,
        }
    }

    pub(crate) fn is_get(&self) -> bool {
        matches!(self.body, RequestBody::Get { .. })
    }

    /// GET deadline measured from submission
    pub(crate) fn get_timeout(&self) -> Option<Duration> {
        match &self.body {
            RequestBody::Get { timeout, .. } => Some(*timeout),
            _ => None,
        }
    }

    #[cfg(test)]
    fn get_sink(&self) -> Option<&GetSink> {
        match &self.body {
            RequestBody::Get { sink, .. } => Some(sink),
            _ => None,
        }
    }

    fn receipt(&self) -> MutationReceipt {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(tx);
        MutationReceipt { rx }
    }

    /// Move receipts of a superseded request onto this one
    pub(crate) fn adopt_waiters(&self, superseded: &LocalRequest) {
        let moved = std::mem::take(&mut *superseded.waiters.lock());
        self.waiters.lock().extend(moved);
    }

    /// Confirm every receipt attached to this request
    pub(crate) fn confirm(&self) {
        for tx in self.waiters.lock().drain(..) {
            let _ = tx.send(());
        }
    }

    /// Signal the caller that the request has finished
    ///
    /// GETs complete with `timed_out` set on failure. Mutations only signal
    /// success; a failed mutation stays queued for the next relay.
    pub(crate) fn complete(&self, success: bool) {
        match &self.body {
            RequestBody::Get { sink, .. } => {
                sink.finish(!success);
            }
            _ if success => self.confirm(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Field;

    #[tokio::test]
    async fn test_get_finishes_once() {
        let (request, query) = LocalRequest::get(1, b"k".to_vec(), None, Duration::from_secs(5));
        let sink = request.get_sink().unwrap();

        let mut value = ValueMap::new();
        value.insert("v".into(), Field::Int(1));
        sink.values(vec![value.clone()]);
        assert!(sink.finish(false));
        assert!(!sink.finish(true));
        sink.values(vec![value.clone()]);

        let (values, timed_out) = query.collect().await;
        assert_eq!(values, vec![value]);
        assert!(!timed_out);
    }

    #[tokio::test]
    async fn test_receipt_follows_superseding_request() {
        let (first, first_receipt) = LocalRequest::put(1, b"k".to_vec(), ValueMap::new(), None);
        let (second, second_receipt) = LocalRequest::put(2, b"k".to_vec(), ValueMap::new(), None);

        second.adopt_waiters(&first);
        drop(first);
        second.complete(true);

        assert!(first_receipt.confirmed().await);
        assert!(second_receipt.confirmed().await);
    }

    #[tokio::test]
    async fn test_dropped_request_is_unconfirmed() {
        let (request, receipt) = LocalRequest::remove(1, b"k".to_vec());
        request.complete(false);
        drop(request);

        assert!(!receipt.confirmed().await);
    }

    #[tokio::test]
    async fn test_peer_query_parses_announcements() {
        let (request, query) = LocalRequest::get(1, b"k".to_vec(), None, Duration::from_secs(5));
        let sink = request.get_sink().unwrap();

        let mut good = ValueMap::new();
        good.insert("h".into(), Field::Text("peer.umbra".into()));
        good.insert("p".into(), Field::Int(6881));
        good.insert("s".into(), Field::Int(1));
        let mut bad_port = good.clone();
        bad_port.insert("p".into(), Field::Int(70000));

        sink.values(vec![good, bad_port]);
        sink.finish(false);

        let (peers, timed_out) = PeerQuery::new(query).collect().await;
        assert!(!timed_out);
        assert_eq!(
            peers,
            vec![PeerAnnouncement {
                originator: PeerAddress::new("peer.umbra", 6881),
                is_seed: true,
                requires_crypto: false,
            }]
        );
    }

    #[test]
    fn test_op_types() {
        let (put, _r) = LocalRequest::put(1, vec![], ValueMap::new(), None);
        let (get, _q) = LocalRequest::get(2, vec![], None, Duration::from_secs(1));
        let (remove, _r2) = LocalRequest::remove(3, vec![]);

        assert_eq!(put.op_type(), OpType::Put);
        assert_eq!(get.op_type(), OpType::Get);
        assert!(get.is_get());
        assert_eq!(remove.op_type(), OpType::Remove);
        assert_eq!(get.get_timeout(), Some(Duration::from_secs(1)));
    }
}
