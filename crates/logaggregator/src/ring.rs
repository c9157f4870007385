// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity circular log store with live subscriptions.
//!
//! A [`RingBuffer`] keeps the most recent `capacity` records in insertion
//! order, overwriting the oldest slot once full. Every record added is also
//! offered to each live subscription without blocking: a subscriber whose
//! delivery queue is full misses that record, nobody else does.
//!
//! [`RingBuffer::read_last_n_and_subscribe`] takes the snapshot and
//! registers the subscription under the same lock, so concatenating the
//! snapshot with the subscription's stream yields every record exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use syslog_record::LogRecord;
use tracing::trace;

pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 1_000;

pub type SubscriptionId = u64;

struct Inner {
    messages: Vec<Arc<LogRecord>>,
    /// Physical index of the logically oldest record.
    start: usize,
    subs: HashMap<SubscriptionId, Sender<Arc<LogRecord>>>,
    next_id: SubscriptionId,
}

impl Inner {
    /// Copies the newest `n` records, oldest first.
    fn read_last_n(&self, n: usize) -> Vec<Arc<LogRecord>> {
        let len = self.messages.len();
        let n = n.min(len);
        let mut out = Vec::with_capacity(n);
        for i in (len - n)..len {
            out.push(Arc::clone(&self.messages[(self.start + i) % len]));
        }
        out
    }

    fn subscribe(&mut self, capacity: usize) -> (Receiver<Arc<LogRecord>>, SubscriptionId) {
        let (tx, rx) = bounded(capacity);
        let id = self.next_id;
        self.next_id += 1;
        self.subs.insert(id, tx);
        (rx, id)
    }
}

/// Handle that ends a subscription.
///
/// Cancelling removes the subscription from its buffer and closes the
/// delivery queue: consumers drain what was already delivered and then see
/// the queue disconnect. Cancelling twice, or after the buffer is gone, is a
/// no-op.
#[derive(Debug, Clone)]
#[must_use = "a subscription stays registered until it is cancelled"]
pub struct CancelHandle {
    id: SubscriptionId,
    inner: Weak<Mutex<Inner>>,
}

impl CancelHandle {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner).subs.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("len", &self.messages.len())
            .field("start", &self.start)
            .field("subs", &self.subs.len())
            .finish()
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    #[allow(clippy::expect_used)]
    inner.lock().expect("lock poisoned")
}

#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    subscription_capacity: usize,
    inner: Arc<Mutex<Inner>>,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_SUBSCRIPTION_CAPACITY)
    }
}

impl RingBuffer {
    /// Creates an empty buffer. Zero capacities are raised to one.
    #[must_use]
    pub fn new(capacity: usize, subscription_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            subscription_capacity: subscription_capacity.max(1),
            inner: Arc::new(Mutex::new(Inner {
                messages: Vec::with_capacity(capacity),
                start: 0,
                subs: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn subscription_capacity(&self) -> usize {
        self.subscription_capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subs.len()
    }

    /// Stores `record`, evicting the oldest one when full, and offers it to
    /// every live subscription.
    pub fn add(&self, record: Arc<LogRecord>) {
        let mut inner = lock(&self.inner);

        inner.subs.retain(|id, tx| match tx.try_send(Arc::clone(&record)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(subscription = id, "subscriber queue full, dropping record");
                true
            }
            // The consumer dropped its receiver without cancelling.
            Err(TrySendError::Disconnected(_)) => false,
        });

        if inner.messages.len() < self.capacity {
            inner.messages.push(record);
        } else {
            let start = inner.start;
            inner.messages[start] = record;
            inner.start = (start + 1) % self.capacity;
        }
    }

    /// Copies every retained record, oldest first.
    #[must_use]
    pub fn read_all(&self) -> Vec<Arc<LogRecord>> {
        let inner = lock(&self.inner);
        inner.read_last_n(inner.messages.len())
    }

    /// Copies the newest `min(n, len)` records, oldest first.
    #[must_use]
    pub fn read_last_n(&self, n: usize) -> Vec<Arc<LogRecord>> {
        lock(&self.inner).read_last_n(n)
    }

    /// Registers a subscription for records added from now on.
    pub fn subscribe(&self) -> (Receiver<Arc<LogRecord>>, CancelHandle) {
        let (rx, id) = lock(&self.inner).subscribe(self.subscription_capacity);
        (rx, self.handle(id))
    }

    /// Atomically copies the newest `n` records and subscribes to every
    /// record added after the copy.
    pub fn read_last_n_and_subscribe(
        &self,
        n: usize,
    ) -> (Vec<Arc<LogRecord>>, Receiver<Arc<LogRecord>>, CancelHandle) {
        let mut inner = lock(&self.inner);
        let snapshot = inner.read_last_n(n);
        let (rx, id) = inner.subscribe(self.subscription_capacity);
        drop(inner);
        (snapshot, rx, self.handle(id))
    }

    pub fn cancel(&self, handle: &CancelHandle) {
        handle.cancel();
    }

    /// Ends every live subscription, as happens when the buffer is torn
    /// down.
    pub fn close_subscriptions(&self) {
        lock(&self.inner).subs.clear();
    }

    fn handle(&self, id: SubscriptionId) -> CancelHandle {
        CancelHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    fn start(&self) -> usize {
        lock(&self.inner).start
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crossbeam_channel::TryRecvError;
    use proptest::prelude::*;
    use syslog_record::Header;

    fn msg(body: impl Into<Vec<u8>>) -> Arc<LogRecord> {
        Arc::new(LogRecord::new(Arc::new(Header::default()), body))
    }

    fn bodies(records: &[Arc<LogRecord>]) -> Vec<String> {
        records
            .iter()
            .map(|r| String::from_utf8_lossy(r.msg()).into_owned())
            .collect()
    }

    #[test]
    fn test_new_buffer() {
        let b = RingBuffer::default();
        assert_eq!(b.len(), 0);
        assert!(b.is_empty());
        assert_eq!(b.capacity(), DEFAULT_BUFFER_CAPACITY);
        assert_eq!(b.subscription_capacity(), DEFAULT_SUBSCRIPTION_CAPACITY);
        assert_eq!(b.start(), 0);
    }

    #[test]
    fn test_buffer() {
        let b = RingBuffer::default();
        assert!(b.read_all().is_empty());

        let msg0 = msg("0");
        let msg1 = msg("1");
        b.add(Arc::clone(&msg0));
        b.add(Arc::clone(&msg1));

        let res = b.read_all();
        assert_eq!(res.len(), 2);
        assert!(Arc::ptr_eq(&res[0], &msg0));
        assert!(Arc::ptr_eq(&res[1], &msg1));

        // overfill the buffer by exactly one
        for i in 2..=DEFAULT_BUFFER_CAPACITY {
            b.add(msg(i.to_string()));
        }
        let mut res = b.read_all();
        assert_eq!(res.len(), DEFAULT_BUFFER_CAPACITY);
        assert!(Arc::ptr_eq(&res[0], &msg1));
        for (i, record) in res.iter().enumerate().skip(1) {
            assert_eq!(record.msg(), (i + 1).to_string().as_bytes());
        }

        // modifying the copy leaves the buffer untouched
        res[0] = msg("A replacement message");
        res.truncate(1);
        let again = b.read_all();
        assert_eq!(again.len(), DEFAULT_BUFFER_CAPACITY);
        assert!(Arc::ptr_eq(&again[0], &msg1));
    }

    #[test]
    fn test_read_last_n() {
        let b = RingBuffer::default();
        b.add(msg("0"));
        b.add(msg("1"));

        let res = b.read_last_n(1);
        assert_eq!(bodies(&res), vec!["1"]);
        assert_eq!(b.read_last_n(10).len(), 2);
        assert!(b.read_last_n(0).is_empty());

        // overfill the buffer by exactly one
        for i in 2..=DEFAULT_BUFFER_CAPACITY {
            b.add(msg(i.to_string()));
        }
        let mut res = b.read_last_n(5);
        let expected: Vec<String> = (0..5)
            .map(|i| (b.capacity() - 4 + i).to_string())
            .collect();
        assert_eq!(bodies(&res), expected);

        // modifying the copy leaves the buffer untouched
        res[0] = msg("A replacement message");
        res.pop();
        assert_eq!(bodies(&b.read_last_n(5)), expected);
        assert_eq!(b.len(), DEFAULT_BUFFER_CAPACITY);
    }

    #[test]
    fn test_wraps_around_small_capacity() {
        let b = RingBuffer::with_capacity(3);
        for i in 0..7 {
            b.add(msg(i.to_string()));
        }
        assert_eq!(b.len(), 3);
        assert_eq!(b.start(), 1);
        assert_eq!(bodies(&b.read_all()), vec!["4", "5", "6"]);
        assert_eq!(bodies(&b.read_last_n(2)), vec!["5", "6"]);
    }

    #[test]
    fn test_read_last_n_and_subscribe() {
        let b = RingBuffer::default();
        b.add(msg("preexisting message 1"));
        b.add(msg("preexisting message 2"));

        let (messages, msgc, cancel) = b.read_last_n_and_subscribe(1);
        assert_eq!(bodies(&messages), vec!["preexisting message 2"]);
        assert_eq!(msgc.try_recv(), Err(TryRecvError::Empty));

        b.add(msg("new message 1"));
        b.add(msg("new message 2"));

        assert_eq!(msgc.try_recv().unwrap().msg(), b"new message 1");
        assert_eq!(msgc.try_recv().unwrap().msg(), b"new message 2");

        cancel.cancel();
        assert_eq!(b.subscriber_count(), 0);
        assert_eq!(msgc.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_subscribe() {
        let b = RingBuffer::default();
        b.add(msg("preexisting message"));

        let (msgc, cancel) = b.subscribe();
        assert_eq!(msgc.capacity(), Some(1000));
        assert_eq!(msgc.try_recv(), Err(TryRecvError::Empty));

        b.add(msg("new message 1"));
        b.add(msg("new message 2"));
        assert_eq!(msgc.len(), 2);

        for i in 1..3 {
            let record = msgc.try_recv().unwrap();
            assert_eq!(record.msg(), format!("new message {i}").as_bytes());
        }

        b.cancel(&cancel);
        b.cancel(&cancel);
        assert_eq!(b.subscriber_count(), 0);
        assert_eq!(msgc.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_cancel_delivers_backlog_before_closing() {
        let b = RingBuffer::default();
        let (msgc, cancel) = b.subscribe();
        b.add(msg("delivered"));
        cancel.cancel();
        b.add(msg("after cancel"));

        let received: Vec<_> = msgc.iter().collect();
        assert_eq!(bodies(&received), vec!["delivered"]);
    }

    #[test]
    fn test_slow_subscriber_only_loses_its_own_records() {
        let b = RingBuffer::new(100, 2);
        let (slow, _slow_cancel) = b.subscribe();
        let (fast, _fast_cancel) = b.subscribe();

        for i in 0..5 {
            b.add(msg(i.to_string()));
            let record = fast.try_recv().unwrap();
            assert_eq!(record.msg(), i.to_string().as_bytes());
        }

        let slow_received: Vec<_> = slow.try_iter().collect();
        assert_eq!(bodies(&slow_received), vec!["0", "1"]);
        assert_eq!(b.len(), 5);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let b = RingBuffer::default();
        let (msgc, _cancel) = b.subscribe();
        assert_eq!(b.subscriber_count(), 1);
        drop(msgc);
        b.add(msg("x"));
        assert_eq!(b.subscriber_count(), 0);
    }

    #[test]
    fn test_close_subscriptions() {
        let b = RingBuffer::default();
        let (first, _c1) = b.subscribe();
        let (_, second, _c2) = b.read_last_n_and_subscribe(10);
        b.close_subscriptions();
        assert_eq!(first.recv(), Err(crossbeam_channel::RecvError));
        assert_eq!(second.recv(), Err(crossbeam_channel::RecvError));
        assert_eq!(b.subscriber_count(), 0);
    }

    #[test]
    fn test_cancel_after_buffer_dropped() {
        let b = RingBuffer::default();
        let (msgc, cancel) = b.subscribe();
        drop(b);
        cancel.cancel();
        assert!(msgc.recv().is_err());
    }

    #[test]
    fn test_snapshot_and_stream_are_gap_free_under_concurrent_adds() {
        let b = Arc::new(RingBuffer::new(10_000, 10_000));
        let writer = {
            let b = Arc::clone(&b);
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    b.add(msg(i.to_string()));
                }
            })
        };

        std::thread::yield_now();
        let (snapshot, msgc, cancel) = b.read_last_n_and_subscribe(10_000);
        writer.join().unwrap();
        cancel.cancel();

        let mut timeline = bodies(&snapshot);
        timeline.extend(bodies(&msgc.iter().collect::<Vec<_>>()));
        let expected: Vec<String> = (0..2_000).map(|i: i32| i.to_string()).collect();
        assert_eq!(timeline, expected);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        Subscribe,
        Cancel,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![6 => Just(Op::Add), 2 => Just(Op::Subscribe), 2 => Just(Op::Cancel)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_operations_keep_invariants(
            capacity in 1usize..16,
            scripts in prop::collection::vec(prop::collection::vec(op(), 0..64), 1..5),
        ) {
            let b = Arc::new(RingBuffer::new(capacity, 4));

            let workers: Vec<_> = scripts
                .iter()
                .cloned()
                .enumerate()
                .map(|(worker, script)| {
                    let b = Arc::clone(&b);
                    std::thread::spawn(move || {
                        let mut handles = Vec::new();
                        let mut seq = 0usize;
                        for op in script {
                            match op {
                                Op::Add => {
                                    b.add(msg(format!("{worker}:{seq}")));
                                    seq += 1;
                                }
                                Op::Subscribe => handles.push(b.subscribe()),
                                Op::Cancel => {
                                    if let Some((_, handle)) = handles.pop() {
                                        handle.cancel();
                                    }
                                }
                            }
                        }
                        (seq, handles)
                    })
                })
                .collect();

            let mut adds = 0;
            let mut live = Vec::new();
            for worker in workers {
                let (seq, handles) = worker.join().unwrap();
                adds += seq;
                live.extend(handles);
            }

            let all = b.read_all();
            prop_assert_eq!(b.len(), adds.min(capacity));
            prop_assert_eq!(all.len(), adds.min(capacity));
            prop_assert!(b.start() < capacity);
            prop_assert_eq!(b.subscriber_count(), live.len());

            // Each worker's records stay in the order it added them.
            let mut last_seen: HashMap<String, usize> = HashMap::new();
            for record in &all {
                let body = String::from_utf8_lossy(record.msg()).into_owned();
                let (worker, seq) = body.split_once(':').unwrap();
                let seq: usize = seq.parse().unwrap();
                if let Some(prev) = last_seen.insert(worker.to_string(), seq) {
                    prop_assert!(prev < seq);
                }
            }

            for (_, handle) in &live {
                handle.cancel();
            }
            prop_assert_eq!(b.subscriber_count(), 0);
        }
    }
}
