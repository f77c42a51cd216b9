//! Request coordinator: admission control in front of an LRU store
//!
//! **Why**: Hundreds of visible items each want an expensive decode. Without a
//! gate the decoder is flooded, duplicate requests decode the same frame
//! twice, and a folder switch leaves stale work running for minutes.
//!
//! **Used by**: Engine (one coordinator for thumbnails, one for metadata)
//!
//! # Admission
//!
//! 1. Store hit: delivered asynchronously, nothing queued
//! 2. Key already running or queued: the request joins it as another waiter
//! 3. Below `max_active`: a job starts on the generation pool
//! 4. Otherwise queued; a full queue answers `Unavailable::Busy` at once
//!
//! Queue order: higher priority first, then most recently created first.
//!
//! # Delivery
//!
//! Every request owns a one-shot slot holding its callback. Whoever empties
//! the slot first wins: the delivery thread (callback runs once) or
//! [`Coordinator::cancel`] (callback dropped, never runs). Callbacks always
//! run on the delivery thread, never under the coordinator lock.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};
use indexmap::IndexMap;
use log::{debug, error, trace};

use crate::core::store::LruStore;
use crate::core::workers::Workers;
use crate::entities::{Outcome, Priority, Unavailable};

/// Request ids are unique across all coordinators in the process, so one
/// handle type can be cancelled through any of them.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub type Callback<V> = Box<dyn FnOnce(Outcome<V>) + Send + 'static>;

/// Computes the value for a key. Runs on a generation pool thread and may
/// block; returning `None` means "no value" (delivered as `Failed`).
pub trait Producer<K, V>: Send + Sync + 'static {
    fn produce(&self, key: &K) -> Option<V>;
}

impl<K, V, F> Producer<K, V> for F
where
    F: Fn(&K) -> Option<V> + Send + Sync + 'static,
{
    fn produce(&self, key: &K) -> Option<V> {
        self(key)
    }
}

/// Sizing for one coordinator
#[derive(Debug, Clone)]
pub struct Limits {
    /// Max concurrently running jobs (also the pool size)
    pub max_active: usize,
    /// Max distinct queued keys before requests are refused
    pub max_pending: usize,
    /// Queued requests older than this are answered `Expired` instead of run
    pub max_queue_age: Option<Duration>,
    /// Store capacity in entries
    pub cache_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_active: 2,
            max_pending: 64,
            max_queue_age: None,
            cache_size: 256,
        }
    }
}

/// One-shot callback holder shared by the handle and the bookkeeping.
struct Slot<V> {
    callback: Mutex<Option<Callback<V>>>,
}

impl<V> Slot<V> {
    fn new(callback: Callback<V>) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    fn take(&self) -> Option<Callback<V>> {
        self.callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Type-erased view of a slot for handles.
trait Revoke: Send + Sync {
    /// Drop the callback. True if it had not been delivered yet.
    fn revoke(&self) -> bool;
    fn is_live(&self) -> bool;
}

impl<V: Send + 'static> Revoke for Slot<V> {
    fn revoke(&self) -> bool {
        self.take().is_some()
    }

    fn is_live(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Handle to an outstanding request; pass it to `cancel`.
#[derive(Clone)]
pub struct RequestHandle {
    id: u64,
    slot: Arc<dyn Revoke>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True until the callback has been handed to the delivery thread or
    /// the request was cancelled.
    pub fn is_pending(&self) -> bool {
        self.slot.is_live()
    }

    pub(crate) fn revoke(&self) -> bool {
        self.slot.revoke()
    }
}

impl Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

struct Waiter<V> {
    id: u64,
    slot: Arc<Slot<V>>,
}

/// Queued request for one key (possibly several coalesced callers)
struct Pending<V> {
    priority: Priority,
    seq: u64,
    created_at: Instant,
    waiters: Vec<Waiter<V>>,
}

struct State<K, V> {
    queue: IndexMap<K, Pending<V>>,
    /// Running jobs: key -> waiters to fan out to on completion
    in_flight: HashMap<K, Vec<Waiter<V>>>,
    next_seq: u64,
    closed: bool,
}

impl<K: Hash + Eq, V> State<K, V> {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Remove the best queued entry: priority, then newest.
    fn pop_best(&mut self) -> Option<(K, Pending<V>)> {
        let idx = self
            .queue
            .values()
            .enumerate()
            .max_by_key(|(_, p)| (p.priority, p.seq))
            .map(|(i, _)| i)?;
        self.queue.swap_remove_index(idx)
    }

    /// Detach waiter `id` wherever it is. Queued entries left without
    /// waiters are dropped; running jobs keep running.
    fn detach(&mut self, id: u64) -> bool {
        let queued = self.queue.values().enumerate().find_map(|(idx, pending)| {
            pending
                .waiters
                .iter()
                .position(|w| w.id == id)
                .map(|pos| (idx, pos))
        });
        if let Some((idx, pos)) = queued {
            let emptied = match self.queue.get_index_mut(idx) {
                Some((_, pending)) => {
                    pending.waiters.swap_remove(pos);
                    pending.waiters.is_empty()
                }
                None => false,
            };
            if emptied {
                self.queue.swap_remove_index(idx);
            }
            return true;
        }
        for waiters in self.in_flight.values_mut() {
            if let Some(pos) = waiters.iter().position(|w| w.id == id) {
                waiters.swap_remove(pos);
                return true;
            }
        }
        false
    }
}

/// Counters for one coordinator
#[derive(Debug, Default)]
struct Counters {
    requested: AtomicU64,
    coalesced: AtomicU64,
    dispatched: AtomicU64,
    produced: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time view of a coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub requested: u64,
    pub coalesced: u64,
    pub dispatched: u64,
    pub produced: u64,
    pub failed: u64,
    pub rejected: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub active: usize,
    pub queued: usize,
    pub cached: usize,
}

struct Inner<K: Hash + Eq, V> {
    name: String,
    state: Mutex<State<K, V>>,
    store: LruStore<K, V>,
    producer: Box<dyn Producer<K, V>>,
    limits: Limits,
    counters: Counters,
    pool: Workers,
    delivery: Workers,
}

/// Deduplicating, bounded, priority-ordered front end for a [`Producer`].
pub struct Coordinator<K: Hash + Eq, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K: Hash + Eq, V> Clone for Coordinator<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Coordinator<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create coordinator with its own generation pool (`max_active` threads)
    /// and a single delivery thread.
    pub fn new(name: &str, producer: impl Producer<K, V>, limits: Limits) -> Self {
        let limits = Limits {
            max_active: limits.max_active.max(1),
            ..limits
        };
        debug!(
            "Coordinator '{}': max_active={}, max_pending={}, cache={}, max_queue_age={:?}",
            name, limits.max_active, limits.max_pending, limits.cache_size, limits.max_queue_age
        );

        let inner = Inner {
            name: name.to_string(),
            state: Mutex::new(State {
                queue: IndexMap::new(),
                in_flight: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            store: LruStore::new(limits.cache_size),
            producer: Box::new(producer),
            pool: Workers::new(&format!("{}-gen", name), limits.max_active),
            delivery: Workers::new(&format!("{}-deliver", name), 1),
            limits,
            counters: Counters::default(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Request the value for `key`. `callback` runs exactly once on the
    /// delivery thread, unless the request is cancelled first.
    pub fn request<F>(&self, key: K, priority: Priority, callback: F) -> RequestHandle
    where
        F: FnOnce(Outcome<V>) + Send + 'static,
    {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(Box::new(callback) as Callback<V>));
        let handle = RequestHandle {
            id,
            slot: Arc::clone(&slot) as Arc<dyn Revoke>,
        };
        self.inner.counters.requested.fetch_add(1, Ordering::Relaxed);
        self.inner.submit(key, priority, Waiter { id, slot });
        handle
    }

    /// Like [`request`](Self::request), delivering through a channel.
    pub fn request_channel(&self, key: K, priority: Priority) -> (RequestHandle, Receiver<Outcome<V>>) {
        let (tx, rx) = bounded(1);
        let handle = self.request(key, priority, move |outcome| {
            // Receiver gone: caller lost interest
            let _ = tx.send(outcome);
        });
        (handle, rx)
    }

    /// Cancel a request. The callback is guaranteed not to run afterwards.
    ///
    /// Returns false if delivery had already started (no-op). A running job
    /// is never interrupted; its result still lands in the store.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        let revoked = handle.revoke();
        self.detach(handle, revoked);
        revoked
    }

    /// Drop bookkeeping for an already revoked `handle`.
    /// Returns true if this coordinator was tracking it.
    pub(crate) fn detach(&self, handle: &RequestHandle, revoked: bool) -> bool {
        let found = self.inner.lock_state().detach(handle.id);
        if found && revoked {
            self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            trace!("'{}': cancelled request {}", self.inner.name, handle.id);
        }
        found
    }

    /// Answer every queued and running request with `Closed`; later requests
    /// get `Closed` immediately. Running jobs finish in the background.
    pub fn shutdown(&self) {
        let waiters: Vec<Waiter<V>> = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            let mut out: Vec<Waiter<V>> = state
                .queue
                .drain(..)
                .flat_map(|(_, p)| p.waiters)
                .collect();
            for running in state.in_flight.values_mut() {
                out.append(running);
            }
            out
        };
        debug!(
            "Coordinator '{}' shut down, {} waiters answered",
            self.inner.name,
            waiters.len()
        );
        for waiter in waiters {
            self.inner
                .deliver(waiter, Outcome::Unavailable(Unavailable::Closed));
        }
    }

    /// Running jobs
    pub fn active(&self) -> usize {
        self.inner.lock_state().in_flight.len()
    }

    /// Queued keys
    pub fn queued(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn store(&self) -> &LruStore<K, V> {
        &self.inner.store
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        let (active, queued) = {
            let state = self.inner.lock_state();
            (state.in_flight.len(), state.queue.len())
        };
        CoordinatorStats {
            requested: c.requested.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            produced: c.produced.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            cache_hits: self.inner.store.stats().hits(),
            active,
            queued,
            cached: self.inner.store.len(),
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submit(self: &Arc<Self>, key: K, priority: Priority, waiter: Waiter<V>) {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        if state.closed {
            drop(guard);
            self.deliver(waiter, Outcome::Unavailable(Unavailable::Closed));
            return;
        }

        // 1. Store hit
        if let Some(value) = self.store.get(&key) {
            drop(guard);
            trace!("'{}': hit {:?}", self.name, key);
            self.deliver(waiter, Outcome::Available(value));
            return;
        }

        // 2. Already running: join it
        if let Some(waiters) = state.in_flight.get_mut(&key) {
            trace!("'{}': {:?} joins running job", self.name, key);
            waiters.push(waiter);
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // 2b. Already queued: join it, take the higher priority and the newer
        // position
        let seq = state.next_seq();
        if let Some(pending) = state.queue.get_mut(&key) {
            trace!("'{}': {:?} joins queued request", self.name, key);
            pending.priority = pending.priority.max(priority);
            pending.seq = seq;
            pending.waiters.push(waiter);
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // 3. Free slot: start now
        if state.in_flight.len() < self.limits.max_active {
            state.in_flight.insert(key.clone(), vec![waiter]);
            drop(guard);
            self.dispatch(key);
            return;
        }

        // 4. Queue, or refuse when full
        if state.queue.len() >= self.limits.max_pending {
            drop(guard);
            debug!(
                "'{}': queue full ({}), refusing {:?}",
                self.name, self.limits.max_pending, key
            );
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.deliver(waiter, Outcome::Unavailable(Unavailable::Busy));
            return;
        }

        trace!("'{}': queued {:?} ({:?})", self.name, key, priority);
        state.queue.insert(
            key,
            Pending {
                priority,
                seq,
                created_at: Instant::now(),
                waiters: vec![waiter],
            },
        );
    }

    /// Run the producer for `key` on the generation pool. The key must
    /// already be registered in `in_flight`.
    fn dispatch(self: &Arc<Self>, key: K) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        trace!("'{}': dispatch {:?}", self.name, key);

        let this = Arc::clone(self);
        self.pool.execute(move || {
            let started = Instant::now();
            // A panicking producer still has to release the key and its waiters
            let value = match catch_unwind(AssertUnwindSafe(|| this.producer.produce(&key))) {
                Ok(value) => value,
                Err(_) => {
                    error!("'{}': producer panicked on {:?}", this.name, key);
                    None
                }
            };
            trace!(
                "'{}': {:?} finished in {:?} ({})",
                this.name,
                key,
                started.elapsed(),
                if value.is_some() { "ok" } else { "none" }
            );
            this.complete(key, value);
        });
    }

    fn complete(self: &Arc<Self>, key: K, value: Option<V>) {
        let outcome = match &value {
            Some(v) => {
                self.counters.produced.fetch_add(1, Ordering::Relaxed);
                Outcome::Available(v.clone())
            }
            None => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Outcome::Unavailable(Unavailable::Failed)
            }
        };

        let mut deliveries: Vec<(Waiter<V>, Outcome<V>)> = Vec::new();
        let next = {
            let mut state = self.lock_state();
            if let Some(v) = value {
                self.store.put(key.clone(), v);
            }
            // Fan out to whoever is attached right now
            for waiter in state.in_flight.remove(&key).unwrap_or_default() {
                deliveries.push((waiter, outcome.clone()));
            }
            self.admit(&mut state, &mut deliveries)
        };

        for (waiter, outcome) in deliveries {
            self.deliver(waiter, outcome);
        }
        for key in next {
            self.dispatch(key);
        }
    }

    /// Move queued requests into free slots. Expired entries and keys that
    /// meanwhile landed in the store are answered instead of dispatched.
    fn admit(
        &self,
        state: &mut State<K, V>,
        deliveries: &mut Vec<(Waiter<V>, Outcome<V>)>,
    ) -> Vec<K> {
        let mut started = Vec::new();
        while state.in_flight.len() < self.limits.max_active {
            let Some((key, pending)) = state.pop_best() else {
                break;
            };

            if let Some(max_age) = self.limits.max_queue_age {
                if pending.created_at.elapsed() > max_age {
                    debug!("'{}': {:?} expired in queue", self.name, key);
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    deliveries.extend(
                        pending
                            .waiters
                            .into_iter()
                            .map(|w| (w, Outcome::Unavailable(Unavailable::Expired))),
                    );
                    continue;
                }
            }

            if let Some(value) = self.store.peek(&key) {
                deliveries.extend(
                    pending
                        .waiters
                        .into_iter()
                        .map(|w| (w, Outcome::Available(value.clone()))),
                );
                continue;
            }

            state.in_flight.insert(key.clone(), pending.waiters);
            started.push(key);
        }
        started
    }

    fn deliver(&self, waiter: Waiter<V>, outcome: Outcome<V>) {
        self.delivery.execute(move || {
            // Empty slot: cancelled in the meantime
            if let Some(callback) = waiter.slot.take() {
                callback(outcome);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Sender, unbounded};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(3);

    /// Producer that reports each start and blocks until released per key.
    struct Gated {
        started: Sender<u32>,
        gates: Mutex<HashMap<u32, Receiver<Option<u32>>>>,
        senders: Mutex<HashMap<u32, Sender<Option<u32>>>>,
        calls: AtomicUsize,
    }

    impl Gated {
        fn new() -> (Arc<Self>, Receiver<u32>) {
            let (tx, rx) = unbounded();
            let gated = Arc::new(Self {
                started: tx,
                gates: Mutex::new(HashMap::new()),
                senders: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            });
            (gated, rx)
        }

        fn gate(&self, key: u32) -> Receiver<Option<u32>> {
            let mut gates = self.gates.lock().unwrap();
            gates
                .entry(key)
                .or_insert_with(|| {
                    let (tx, rx) = bounded(1);
                    self.senders.lock().unwrap().insert(key, tx);
                    rx
                })
                .clone()
        }

        fn release(&self, key: u32, value: Option<u32>) {
            let _ = self.gate(key);
            let tx = self.senders.lock().unwrap().get(&key).cloned().unwrap();
            tx.send(value).unwrap();
        }
    }

    fn gated_coordinator(limits: Limits) -> (Coordinator<u32, u32>, Arc<Gated>, Receiver<u32>) {
        let (gated, started) = Gated::new();
        let producer = Arc::clone(&gated);
        let coordinator = Coordinator::new(
            "test",
            move |key: &u32| {
                producer.calls.fetch_add(1, Ordering::SeqCst);
                let gate = producer.gate(*key);
                producer.started.send(*key).unwrap();
                gate.recv_timeout(WAIT).ok().flatten()
            },
            limits,
        );
        (coordinator, gated, started)
    }

    fn limits(max_active: usize, max_pending: usize) -> Limits {
        Limits {
            max_active,
            max_pending,
            max_queue_age: None,
            cache_size: 16,
        }
    }

    #[test]
    fn test_deduplicates_concurrent_requests() {
        let (coord, gated, started) = gated_coordinator(limits(2, 8));

        let receivers: Vec<_> = (0..5)
            .map(|_| coord.request_channel(7, Priority::Normal).1)
            .collect();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), 7);
        assert_eq!(coord.active(), 1);

        gated.release(7, Some(70));
        for rx in receivers {
            let outcome = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(outcome.available(), Some(70));
        }
        assert_eq!(gated.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coord.stats().coalesced, 4);
    }

    #[test]
    fn test_cached_value_served_without_second_call() {
        let (coord, gated, started) = gated_coordinator(limits(1, 8));

        let (_h, rx) = coord.request_channel(1, Priority::Normal);
        started.recv_timeout(WAIT).unwrap();
        gated.release(1, Some(10));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().available(), Some(10));

        for _ in 0..2 {
            let (_h, rx) = coord.request_channel(1, Priority::Normal);
            assert_eq!(rx.recv_timeout(WAIT).unwrap().available(), Some(10));
        }
        assert_eq!(gated.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coord.stats().cache_hits, 2);
    }

    #[test]
    fn test_priority_then_recency_dispatch_order() {
        let (coord, gated, started) = gated_coordinator(limits(1, 8));

        let (_a, rx_a) = coord.request_channel(1, Priority::Normal);
        assert_eq!(started.recv_timeout(WAIT).unwrap(), 1);

        let (_b, _rx_b) = coord.request_channel(2, Priority::High);
        let (_c, _rx_c) = coord.request_channel(3, Priority::Normal);
        let (_d, _rx_d) = coord.request_channel(4, Priority::Normal);
        assert_eq!(coord.queued(), 3);

        gated.release(1, Some(1));
        rx_a.recv_timeout(WAIT).unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), 2);

        gated.release(2, Some(2));
        // Equal priority: most recently created first
        assert_eq!(started.recv_timeout(WAIT).unwrap(), 4);
        gated.release(4, Some(4));
        assert_eq!(started.recv_timeout(WAIT).unwrap(), 3);
        gated.release(3, Some(3));
    }

    #[test]
    fn test_backpressure_rejects_when_queue_full() {
        let (coord, gated, started) = gated_coordinator(limits(1, 2));

        let (_a, rx_a) = coord.request_channel(1, Priority::Normal);
        started.recv_timeout(WAIT).unwrap();
        let (_b, rx_b) = coord.request_channel(2, Priority::Normal);
        let (_c, rx_c) = coord.request_channel(3, Priority::Normal);

        // max_active + max_pending outstanding: next one is refused at once
        let (_d, rx_d) = coord.request_channel(4, Priority::High);
        let outcome = rx_d.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(outcome.reason(), Some(Unavailable::Busy));
        assert_eq!(coord.stats().rejected, 1);

        for key in 1..=3 {
            gated.release(key, Some(key));
        }
        for rx in [rx_a, rx_b, rx_c] {
            assert!(rx.recv_timeout(WAIT).unwrap().is_available());
        }
    }

    #[test]
    fn test_cancel_queued_never_delivers() {
        let (coord, gated, started) = gated_coordinator(limits(1, 4));

        let (_a, rx_a) = coord.request_channel(1, Priority::Normal);
        started.recv_timeout(WAIT).unwrap();
        let (b, rx_b) = coord.request_channel(2, Priority::Normal);
        assert_eq!(coord.queued(), 1);

        assert!(coord.cancel(&b));
        assert_eq!(coord.queued(), 0);
        assert!(!b.is_pending());

        gated.release(1, Some(1));
        rx_a.recv_timeout(WAIT).unwrap();
        // Key 2 was never dispatched and its callback never runs
        assert!(started.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(rx_b.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(gated.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_in_flight_still_populates_store() {
        let (coord, gated, started) = gated_coordinator(limits(1, 4));

        let (a, rx_a) = coord.request_channel(1, Priority::Normal);
        let (_a2, rx_a2) = coord.request_channel(1, Priority::Normal);
        started.recv_timeout(WAIT).unwrap();

        assert!(coord.cancel(&a));
        gated.release(1, Some(11));

        // The other waiter still gets the value, the cancelled one never does
        assert_eq!(rx_a2.recv_timeout(WAIT).unwrap().available(), Some(11));
        assert!(rx_a.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(coord.store().peek(&1), Some(11));
    }

    #[test]
    fn test_cancel_after_delivery_is_noop() {
        let (coord, gated, started) = gated_coordinator(limits(1, 4));
        let delivered = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = bounded(1);

        let counter = Arc::clone(&delivered);
        let handle = coord.request(5, Priority::Normal, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        });
        started.recv_timeout(WAIT).unwrap();
        gated.release(5, None);
        rx.recv_timeout(WAIT).unwrap();

        assert!(!coord.cancel(&handle));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_delivered_to_every_waiter() {
        let (coord, gated, started) = gated_coordinator(limits(2, 4));

        let rxs: Vec<_> = (0..3)
            .map(|_| coord.request_channel(9, Priority::Normal).1)
            .collect();
        started.recv_timeout(WAIT).unwrap();
        gated.release(9, None);

        for rx in rxs {
            assert_eq!(
                rx.recv_timeout(WAIT).unwrap().reason(),
                Some(Unavailable::Failed)
            );
        }
        assert!(coord.store().is_empty());
        assert_eq!(coord.stats().failed, 1);
    }

    #[test]
    fn test_concurrency_cap_holds() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let coord: Coordinator<u32, u32> = Coordinator::new(
            "cap",
            move |key: &u32| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                r.fetch_sub(1, Ordering::SeqCst);
                Some(*key)
            },
            limits(3, 64),
        );

        let rxs: Vec<_> = (0..30)
            .map(|k| coord.request_channel(k, Priority::Normal).1)
            .collect();
        for rx in rxs {
            assert!(rx.recv_timeout(WAIT).unwrap().is_available());
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(coord.active(), 0);
    }

    #[test]
    fn test_queued_request_expires() {
        let (coord, gated, started) = gated_coordinator(Limits {
            max_queue_age: Some(Duration::from_millis(20)),
            ..limits(1, 4)
        });

        let (_a, rx_a) = coord.request_channel(1, Priority::Normal);
        started.recv_timeout(WAIT).unwrap();
        let (_b, rx_b) = coord.request_channel(2, Priority::Normal);

        thread::sleep(Duration::from_millis(40));
        gated.release(1, Some(1));
        rx_a.recv_timeout(WAIT).unwrap();

        assert_eq!(
            rx_b.recv_timeout(WAIT).unwrap().reason(),
            Some(Unavailable::Expired)
        );
        assert_eq!(gated.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_answers_everyone() {
        let (coord, gated, started) = gated_coordinator(limits(1, 4));

        let (_a, rx_a) = coord.request_channel(1, Priority::Normal);
        started.recv_timeout(WAIT).unwrap();
        let (_b, rx_b) = coord.request_channel(2, Priority::Normal);

        coord.shutdown();
        for rx in [rx_a, rx_b] {
            assert_eq!(
                rx.recv_timeout(WAIT).unwrap().reason(),
                Some(Unavailable::Closed)
            );
        }
        let (_c, rx_c) = coord.request_channel(3, Priority::Normal);
        assert_eq!(
            rx_c.recv_timeout(WAIT).unwrap().reason(),
            Some(Unavailable::Closed)
        );
        gated.release(1, Some(1));
    }

    #[test]
    fn test_panicking_producer_answers_waiters_and_frees_slot() {
        let coord: Coordinator<u32, u32> = Coordinator::new(
            "panic",
            |key: &u32| {
                if *key == 1 {
                    panic!("decoder crashed");
                }
                Some(*key * 10)
            },
            limits(1, 4),
        );

        let (_a, rx_a) = coord.request_channel(1, Priority::Normal);
        let (_b, rx_b) = coord.request_channel(2, Priority::Normal);

        assert_eq!(
            rx_a.recv_timeout(WAIT).unwrap().reason(),
            Some(Unavailable::Failed)
        );
        // The slot was released, so the queued key still runs
        assert_eq!(rx_b.recv_timeout(WAIT).unwrap().available(), Some(20));
        assert_eq!(coord.active(), 0);
        assert_eq!(coord.queued(), 0);
        assert_eq!(coord.stats().failed, 1);
    }
}
