//! Local request queue and dispatcher.
//!
//! Every local operation passes through one [`RequestQueue`], guarded by the
//! dispatch lock together with the active relay and the worker handle. For
//! each key at most one PUT or REMOVE is in flight and at most one waits
//! behind it; a newer submission replaces the waiting one. GETs bypass the
//! per-key state and are bounded by their own timeouts.
//!
//! Dispatch is newest first. A single worker task drains the queue onto the
//! active relay, waits a bounded time when idle and exits once idle with an
//! empty queue. The decision to exit and the decision to spawn are both made
//! under the dispatch lock, so no submission is stranded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::cache::BoundedCache;
use crate::connection::{Connection, OutboundRelay};
use crate::manager::ProxyInner;
use crate::protocol::OpType;
use crate::request::LocalRequest;

/// Last mutation a relay confirmed for a key
#[derive(Debug)]
struct Confirmed {
    at: Instant,
    request: Arc<LocalRequest>,
    relay_iid: String,
}

#[derive(Debug, Default)]
struct LocalKeyState {
    pending: Option<Arc<LocalRequest>>,
    has_active: bool,
    last_ok: Option<Confirmed>,
}

/// What happened to a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submission {
    /// Waiting for dispatch
    Queued,
    /// Waiting behind an in-flight request for the same key
    Deferred,
    /// REMOVE with nothing in flight; key state dropped
    Cleared,
    /// Key-state bound reached
    Rejected,
}

/// Mutation state of one local key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStatus {
    /// Sequence number of the request waiting for dispatch
    pub pending_seq: Option<u64>,
    /// A request for the key is in flight
    pub has_active: bool,
    /// A relay has confirmed a mutation for the key
    pub confirmed: bool,
}

/// Queue of local requests plus per-key mutation state
#[derive(Debug)]
pub(crate) struct RequestQueue {
    /// Back is newest
    queue: VecDeque<Arc<LocalRequest>>,
    keys: HashMap<Vec<u8>, LocalKeyState>,
    max_key_state: usize,
}

impl RequestQueue {
    pub(crate) fn new(max_key_state: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            keys: HashMap::new(),
            max_key_state,
        }
    }

    pub(crate) fn submit(&mut self, request: Arc<LocalRequest>) -> Submission {
        if request.is_get() {
            self.queue.push_back(request);
            return Submission::Queued;
        }

        let op = request.op_type();
        if !self.keys.contains_key(&request.key) {
            if op == OpType::Remove {
                return Submission::Cleared;
            }
            if self.keys.len() >= self.max_key_state {
                return Submission::Rejected;
            }
        }
        let state = self.keys.entry(request.key.clone()).or_default();

        if let Some(superseded) = state.pending.take() {
            self.queue.retain(|queued| queued.seq != superseded.seq);
            request.adopt_waiters(&superseded);
        }
        if state.has_active {
            state.pending = Some(request);
            return Submission::Deferred;
        }
        if op == OpType::Remove {
            self.keys.remove(&request.key);
            return Submission::Cleared;
        }
        state.pending = Some(Arc::clone(&request));
        self.queue.push_back(request);
        Submission::Queued
    }

    /// Take the newest queued request
    pub(crate) fn pop_next(&mut self) -> Option<Arc<LocalRequest>> {
        let request = self.queue.pop_back()?;
        if !request.is_get() {
            if let Some(state) = self.keys.get_mut(&request.key) {
                state.pending = None;
                state.has_active = true;
            }
        }
        Some(request)
    }

    /// Record a confirmed mutation; true if a waiting request was requeued
    pub(crate) fn complete(&mut self, request: &Arc<LocalRequest>, relay_iid: &str, now: Instant) -> bool {
        let Some(state) = self.keys.get_mut(&request.key) else {
            tracing::debug!("Completed request {} has no key state", request.seq);
            return false;
        };
        state.has_active = false;
        state.last_ok = Some(Confirmed {
            at: now,
            request: Arc::clone(request),
            relay_iid: relay_iid.to_owned(),
        });
        match state.pending.clone() {
            Some(pending) => {
                self.queue.push_back(pending);
                true
            }
            None => {
                if request.op_type() == OpType::Remove {
                    self.keys.remove(&request.key);
                }
                false
            }
        }
    }

    /// Requeue after a failure
    ///
    /// The failed request becomes the waiting one unless a newer request for
    /// the key is already waiting, which then takes over its receipts.
    pub(crate) fn fail(&mut self, request: &Arc<LocalRequest>) -> bool {
        let Some(state) = self.keys.get_mut(&request.key) else {
            tracing::debug!("Failed request {} has no key state", request.seq);
            return false;
        };
        state.has_active = false;
        let pending = match state.pending.take() {
            Some(pending) => {
                pending.adopt_waiters(request);
                pending
            }
            None => Arc::clone(request),
        };
        state.pending = Some(Arc::clone(&pending));
        self.queue.push_back(pending);
        true
    }

    /// Give up on an in-flight request without retrying it
    pub(crate) fn abandon(&mut self, request: &Arc<LocalRequest>) -> bool {
        let Some(state) = self.keys.get_mut(&request.key) else {
            return false;
        };
        state.has_active = false;
        match state.pending.clone() {
            Some(pending) => {
                self.queue.push_back(pending);
                true
            }
            None => {
                if state.last_ok.is_none() {
                    self.keys.remove(&request.key);
                }
                false
            }
        }
    }

    /// Remove queued GETs older than their timeout, capped at `ceiling`
    pub(crate) fn expire_gets(&mut self, now: Instant, ceiling: Duration) -> Vec<Arc<LocalRequest>> {
        let (expired, kept): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|request| {
                request.get_timeout().is_some_and(|timeout| {
                    now.saturating_duration_since(request.started) > timeout.min(ceiling)
                })
            });
        self.queue = kept;
        expired.into_iter().collect()
    }

    /// Requeue confirmed mutations that a different relay instance holds
    ///
    /// Returns the number of requests requeued.
    pub(crate) fn republish(&mut self, relay_iid: &str, now: Instant, interval: Duration) -> usize {
        let mut requeued = 0;
        for state in self.keys.values_mut() {
            if state.pending.is_some() || state.has_active {
                continue;
            }
            let Some(last_ok) = &state.last_ok else {
                continue;
            };
            if now.saturating_duration_since(last_ok.at) > interval && last_ok.relay_iid != relay_iid {
                let request = Arc::clone(&last_ok.request);
                state.pending = Some(Arc::clone(&request));
                self.queue.push_back(request);
                requeued += 1;
            }
        }
        requeued
    }

    /// Remove every queued GET
    pub(crate) fn drain_gets(&mut self) -> Vec<Arc<LocalRequest>> {
        let (gets, rest): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|request| request.is_get());
        self.queue = rest;
        gets.into_iter().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn key_state(&self, key: &[u8]) -> Option<KeyStatus> {
        self.keys.get(key).map(|state| KeyStatus {
            pending_seq: state.pending.as_ref().map(|r| r.seq),
            has_active: state.has_active,
            confirmed: state.last_ok.is_some(),
        })
    }

    #[cfg(test)]
    fn queued_seqs(&self) -> Vec<u64> {
        self.queue.iter().map(|r| r.seq).collect()
    }
}

#[derive(Debug)]
struct WorkerHandle {
    id: u64,
    wake: Arc<Notify>,
}

/// State behind the dispatch lock
#[derive(Debug)]
pub(crate) struct DispatchState {
    pub(crate) requests: RequestQueue,
    active_relay: Option<Arc<Connection>>,
    failed_uids: BoundedCache<String, ()>,
    worker: Option<WorkerHandle>,
    next_worker: u64,
}

impl DispatchState {
    pub(crate) fn new(max_key_state: usize, failed_uid_capacity: usize) -> Self {
        Self {
            requests: RequestQueue::new(max_key_state),
            active_relay: None,
            failed_uids: BoundedCache::new(failed_uid_capacity),
            worker: None,
            next_worker: 0,
        }
    }

    fn is_worker(&self, id: u64) -> bool {
        self.worker.as_ref().is_some_and(|w| w.id == id)
    }

    pub(crate) fn has_worker(&self) -> bool {
        self.worker.is_some()
    }
}

impl ProxyInner {
    /// Enter a request into the local queue
    pub(crate) fn submit(self: &Arc<Self>, request: Arc<LocalRequest>) -> Submission {
        let seq = request.seq;
        let mut dispatch = self.dispatch.lock();
        let outcome = dispatch.requests.submit(request);
        match outcome {
            Submission::Queued => self.wake_worker(&mut dispatch),
            Submission::Deferred => tracing::trace!("Request {} waits behind an active request", seq),
            Submission::Cleared => tracing::debug!("Remove {} had nothing to cancel", seq),
            Submission::Rejected => tracing::debug!("Dropping request {}: key state full", seq),
        }
        outcome
    }

    fn wake_worker(self: &Arc<Self>, dispatch: &mut DispatchState) {
        match &dispatch.worker {
            Some(worker) => worker.wake.notify_one(),
            None => self.spawn_worker(dispatch),
        }
    }

    fn spawn_worker(self: &Arc<Self>, dispatch: &mut DispatchState) {
        if dispatch.active_relay.is_none() || self.is_destroyed() {
            return;
        }
        let id = dispatch.next_worker;
        dispatch.next_worker += 1;
        let wake = Arc::new(Notify::new());
        dispatch.worker = Some(WorkerHandle {
            id,
            wake: Arc::clone(&wake),
        });
        tracing::trace!("Starting dispatcher {}", id);
        tokio::spawn(run_worker(Arc::downgrade(self), id, wake, self.config.dispatcher_idle));
    }

    /// Make `conn` the dispatch target unless its uid already failed
    pub(crate) fn relay_activated(self: &Arc<Self>, conn: &Arc<Connection>) -> bool {
        let Some(client) = conn.as_relay_client() else {
            return false;
        };
        let mut dispatch = self.dispatch.lock();
        if dispatch.failed_uids.contains(&client.uid().to_owned()) {
            tracing::debug!("Not dispatching to {}: connection already failed", conn.remote());
            return false;
        }
        dispatch.active_relay = Some(Arc::clone(conn));
        self.wake_worker(&mut dispatch);
        true
    }

    /// Forget `conn` as a dispatch target
    pub(crate) fn relay_failed(&self, conn: &Arc<Connection>) {
        let Some(client) = conn.as_relay_client() else {
            return;
        };
        let mut dispatch = self.dispatch.lock();
        dispatch.failed_uids.insert(client.uid().to_owned(), ());
        if dispatch
            .active_relay
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, conn))
        {
            dispatch.active_relay = None;
            if let Some(worker) = &dispatch.worker {
                worker.wake.notify_one();
            }
        }
    }

    pub(crate) fn request_complete(self: &Arc<Self>, request: &Arc<LocalRequest>, relay_iid: &str) {
        if request.is_get() {
            request.complete(true);
            return;
        }
        request.confirm();
        let mut dispatch = self.dispatch.lock();
        if dispatch.requests.complete(request, relay_iid, Instant::now()) {
            self.wake_worker(&mut dispatch);
        }
    }

    pub(crate) fn request_failed(self: &Arc<Self>, request: &Arc<LocalRequest>) {
        if request.is_get() {
            request.complete(false);
            return;
        }
        tracing::debug!("Requeueing {:?} request {}", request.op_type(), request.seq);
        let mut dispatch = self.dispatch.lock();
        if dispatch.requests.fail(request) {
            self.wake_worker(&mut dispatch);
        }
    }

    pub(crate) fn request_abandoned(self: &Arc<Self>, request: &Arc<LocalRequest>) {
        if request.is_get() {
            request.complete(false);
            return;
        }
        let mut dispatch = self.dispatch.lock();
        if dispatch.requests.abandon(request) {
            self.wake_worker(&mut dispatch);
        }
    }

    /// Fail queued GETs past their local deadline, then sweep the relay
    pub(crate) fn check_request_timeouts(self: &Arc<Self>) {
        let now = Instant::now();
        let (expired, relay) = {
            let mut dispatch = self.dispatch.lock();
            let expired = dispatch
                .requests
                .expire_gets(now, self.config.queued_get_ceiling);
            (expired, dispatch.active_relay.clone())
        };
        for request in expired {
            tracing::debug!("Queued GET {} timed out", request.seq);
            request.complete(false);
        }
        if let Some(client) = relay.as_ref().and_then(|conn| conn.as_relay_client()) {
            client.sweep_request_timeouts(self, now);
        }
    }

    /// Requeue confirmed mutations held by a previous relay instance
    pub(crate) fn check_republish(self: &Arc<Self>) {
        let mut dispatch = self.dispatch.lock();
        let Some(iid) = dispatch
            .active_relay
            .as_ref()
            .and_then(|conn| conn.as_relay_client())
            .and_then(OutboundRelay::remote_iid)
        else {
            return;
        };
        let requeued =
            dispatch
                .requests
                .republish(&iid, Instant::now(), self.config.republish_interval);
        if requeued > 0 {
            tracing::info!("Republishing {} keys through relay instance {}", requeued, iid);
            self.wake_worker(&mut dispatch);
        }
    }

    pub(crate) fn fail_queued_gets(&self) {
        let gets = self.dispatch.lock().requests.drain_gets();
        for request in gets {
            request.complete(false);
        }
    }
}

async fn run_worker(inner: Weak<ProxyInner>, id: u64, wake: Arc<Notify>, idle: Duration) {
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let next = {
            let mut dispatch = strong.dispatch.lock();
            if !dispatch.is_worker(id) {
                return;
            }
            let relay = dispatch.active_relay.clone().filter(|conn| {
                !conn.is_closed() && conn.as_relay_client().is_some_and(OutboundRelay::is_active)
            });
            let Some(relay) = relay else {
                tracing::trace!("Dispatcher {} stopping: no active relay", id);
                dispatch.worker = None;
                return;
            };
            dispatch.requests.pop_next().map(|request| (relay, request))
        };

        if let Some((relay, request)) = next {
            if let Some(client) = relay.as_relay_client() {
                tracing::trace!("Dispatching {:?} request {}", request.op_type(), request.seq);
                client.add_request(&relay, &strong, request);
            }
            continue;
        }
        drop(strong);

        if tokio::time::timeout(idle, wake.notified()).await.is_err() {
            let Some(strong) = inner.upgrade() else {
                return;
            };
            let mut dispatch = strong.dispatch.lock();
            if dispatch.is_worker(id) && dispatch.requests.is_empty() {
                tracing::trace!("Dispatcher {} idle, stopping", id);
                dispatch.worker = None;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Field, ValueMap};
    use proptest::prelude::*;

    fn put(seq: u64, key: &[u8]) -> (Arc<LocalRequest>, crate::request::MutationReceipt) {
        let mut value = ValueMap::new();
        value.insert("v".into(), Field::Int(seq as i64));
        let (request, receipt) = LocalRequest::put(seq, key.to_vec(), value, None);
        (Arc::new(request), receipt)
    }

    fn remove(seq: u64, key: &[u8]) -> Arc<LocalRequest> {
        Arc::new(LocalRequest::remove(seq, key.to_vec()).0)
    }

    fn get(seq: u64, key: &[u8], timeout: Duration) -> Arc<LocalRequest> {
        Arc::new(LocalRequest::get(seq, key.to_vec(), None, timeout).0)
    }

    #[test]
    fn test_dispatch_is_newest_first() {
        let mut queue = RequestQueue::new(16);
        queue.submit(put(1, b"a").0);
        queue.submit(put(2, b"b").0);
        queue.submit(get(3, b"c", Duration::from_secs(60)));

        assert_eq!(queue.pop_next().map(|r| r.seq), Some(3));
        assert_eq!(queue.pop_next().map(|r| r.seq), Some(2));
        assert_eq!(queue.pop_next().map(|r| r.seq), Some(1));
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn test_gets_are_never_deduplicated() {
        let mut queue = RequestQueue::new(16);
        queue.submit(get(1, b"k", Duration::from_secs(60)));
        queue.submit(get(2, b"k", Duration::from_secs(60)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.key_count(), 0);
    }

    #[tokio::test]
    async fn test_superseded_put_follows_replacement() {
        let mut queue = RequestQueue::new(16);
        let (first, first_receipt) = put(1, b"k");
        let (second, second_receipt) = put(2, b"k");
        assert_eq!(queue.submit(first), Submission::Queued);
        assert_eq!(queue.submit(second), Submission::Queued);
        assert_eq!(queue.queued_seqs(), vec![2]);

        let sent = queue.pop_next().unwrap();
        assert_eq!(sent.seq, 2);
        sent.confirm();
        queue.complete(&sent, "r1", Instant::now());

        assert!(first_receipt.confirmed().await);
        assert!(second_receipt.confirmed().await);
    }

    #[test]
    fn test_submission_behind_active_is_deferred() {
        let mut queue = RequestQueue::new(16);
        queue.submit(put(1, b"k").0);
        let active = queue.pop_next().unwrap();
        assert_eq!(queue.submit(put(2, b"k").0), Submission::Deferred);
        assert_eq!(queue.submit(put(3, b"k").0), Submission::Deferred);
        assert!(queue.is_empty());

        assert!(queue.complete(&active, "r1", Instant::now()));
        assert_eq!(queue.queued_seqs(), vec![3]);
        let view = queue.key_state(b"k").unwrap();
        assert_eq!(view.pending_seq, Some(3));
        assert!(!view.has_active);
        assert!(view.confirmed);
    }

    #[test]
    fn test_failed_request_is_retried() {
        let mut queue = RequestQueue::new(16);
        queue.submit(put(1, b"k").0);
        let active = queue.pop_next().unwrap();
        assert!(queue.fail(&active));
        assert_eq!(queue.queued_seqs(), vec![1]);

        let active = queue.pop_next().unwrap();
        queue.submit(put(2, b"k").0);
        assert!(queue.fail(&active));
        assert_eq!(queue.queued_seqs(), vec![2]);
    }

    #[tokio::test]
    async fn test_remove_without_state_is_cleared() {
        let mut queue = RequestQueue::new(16);
        assert_eq!(queue.submit(remove(1, b"k")), Submission::Cleared);

        let (pending, receipt) = put(2, b"k");
        queue.submit(pending);
        assert_eq!(queue.submit(remove(3, b"k")), Submission::Cleared);
        assert!(queue.is_empty());
        assert_eq!(queue.key_count(), 0);
        assert!(!receipt.confirmed().await);
    }

    #[test]
    fn test_remove_after_confirmed_put_clears_state() {
        let mut queue = RequestQueue::new(16);
        queue.submit(put(1, b"k").0);
        let active = queue.pop_next().unwrap();
        queue.complete(&active, "r1", Instant::now());
        let view = queue.key_state(b"k").unwrap();
        assert!(view.pending_seq.is_none() && !view.has_active && view.confirmed);

        assert_eq!(queue.submit(remove(2, b"k")), Submission::Cleared);
        assert!(queue.is_empty());
        assert_eq!(queue.key_count(), 0);
    }

    #[test]
    fn test_remove_behind_active_put_is_sent() {
        let mut queue = RequestQueue::new(16);
        queue.submit(put(1, b"k").0);
        let active = queue.pop_next().unwrap();

        assert_eq!(queue.submit(remove(2, b"k")), Submission::Deferred);
        assert!(queue.complete(&active, "r1", Instant::now()));
        let sent = queue.pop_next().unwrap();
        assert_eq!(sent.op_type(), OpType::Remove);
        queue.complete(&sent, "r1", Instant::now());
        assert_eq!(queue.key_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_request_waiters_follow_newer_request() {
        let mut queue = RequestQueue::new(16);
        let (first, first_receipt) = put(1, b"k");
        queue.submit(first);
        let active = queue.pop_next().unwrap();
        let (second, second_receipt) = put(2, b"k");
        assert_eq!(queue.submit(second), Submission::Deferred);

        assert!(queue.fail(&active));
        drop(active);
        assert_eq!(queue.queued_seqs(), vec![2]);
        let sent = queue.pop_next().unwrap();
        sent.confirm();
        queue.complete(&sent, "r1", Instant::now());

        assert!(first_receipt.confirmed().await);
        assert!(second_receipt.confirmed().await);
    }

    #[test]
    fn test_key_state_bound_rejects_new_puts() {
        let mut queue = RequestQueue::new(1);
        assert_eq!(queue.submit(put(1, b"a").0), Submission::Queued);
        assert_eq!(queue.submit(put(2, b"b").0), Submission::Rejected);
        assert_eq!(queue.submit(put(3, b"a").0), Submission::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_gets_expire_at_ceiling() {
        let mut queue = RequestQueue::new(16);
        queue.submit(get(1, b"k", Duration::from_secs(120)));
        queue.submit(get(2, b"k", Duration::from_secs(5)));
        queue.submit(put(3, b"k").0);

        tokio::time::advance(Duration::from_secs(6)).await;
        let expired = queue.expire_gets(Instant::now(), Duration::from_secs(15));
        assert_eq!(expired.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2]);

        tokio::time::advance(Duration::from_secs(10)).await;
        let expired = queue.expire_gets(Instant::now(), Duration::from_secs(15));
        assert_eq!(expired.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1]);
        assert_eq!(queue.queued_seqs(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_republish_only_for_other_instance() {
        let interval = Duration::from_secs(300);
        let mut queue = RequestQueue::new(16);
        queue.submit(put(1, b"k").0);
        let active = queue.pop_next().unwrap();
        queue.complete(&active, "R1", Instant::now());
        tokio::time::advance(Duration::from_secs(600)).await;

        assert_eq!(queue.republish("R1", Instant::now(), interval), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.republish("R2", Instant::now(), interval), 1);
        assert_eq!(queue.queued_seqs(), vec![1]);
        // Already pending
        assert_eq!(queue.republish("R2", Instant::now(), interval), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_confirmation_is_not_republished() {
        let mut queue = RequestQueue::new(16);
        queue.submit(put(1, b"k").0);
        let active = queue.pop_next().unwrap();
        queue.complete(&active, "R1", Instant::now());
        assert_eq!(queue.republish("R2", Instant::now(), Duration::from_secs(300)), 0);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Put(u8),
        Remove(u8),
        Get(u8),
        Pop,
        Complete(usize),
        Fail(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..4).prop_map(Step::Put),
            (0u8..4).prop_map(Step::Remove),
            (0u8..4).prop_map(Step::Get),
            Just(Step::Pop),
            any::<usize>().prop_map(Step::Complete),
            any::<usize>().prop_map(Step::Fail),
        ]
    }

    proptest! {
        #[test]
        fn prop_one_active_one_pending_per_key(steps in prop::collection::vec(step(), 1..80)) {
            let mut queue = RequestQueue::new(16);
            let mut in_flight: Vec<Arc<LocalRequest>> = Vec::new();
            let mut seq = 0u64;

            for step in steps {
                seq += 1;
                match step {
                    Step::Put(k) => { queue.submit(put(seq, &[k]).0); }
                    Step::Remove(k) => { queue.submit(remove(seq, &[k])); }
                    Step::Get(k) => { queue.submit(get(seq, &[k], Duration::from_secs(60))); }
                    Step::Pop => {
                        if let Some(request) = queue.pop_next() {
                            if !request.is_get() {
                                in_flight.push(request);
                            }
                        }
                    }
                    Step::Complete(i) if !in_flight.is_empty() => {
                        let request = in_flight.remove(i % in_flight.len());
                        queue.complete(&request, "r", Instant::now());
                    }
                    Step::Fail(i) if !in_flight.is_empty() => {
                        let request = in_flight.remove(i % in_flight.len());
                        queue.fail(&request);
                    }
                    Step::Complete(_) | Step::Fail(_) => {}
                }

                for k in 0u8..4 {
                    let active = in_flight.iter().filter(|r| r.key == [k]).count();
                    let queued = queue
                        .queue
                        .iter()
                        .filter(|r| !r.is_get() && r.key == [k])
                        .count();
                    prop_assert!(active <= 1);
                    prop_assert!(queued <= 1);
                    if active == 1 {
                        prop_assert_eq!(queued, 0);
                        prop_assert!(queue.key_state(&[k]).is_some_and(|v| v.has_active));
                    }
                }
            }
        }
    }
}
