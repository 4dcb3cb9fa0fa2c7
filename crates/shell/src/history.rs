use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::clock;

/// Maximum number of records retained in a history buffer.
pub const HISTORY_CAPACITY: usize = 20;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub text: String,
    pub recorded_at: OffsetDateTime,
}

impl HistoryRecord {
    pub fn new(text: impl Into<String>, recorded_at: OffsetDateTime) -> Self {
        Self {
            text: text.into(),
            recorded_at,
        }
    }

    pub fn now(text: impl Into<String>) -> Self {
        Self::new(text, clock::now())
    }
}

/// Observer invoked after every append with a most-recent-first snapshot.
/// Runs on the delivering thread, so it should only mark UI state dirty.
/// Identity is the `Arc` pointer: register a clone of the same `Arc` to
/// unregister it later.
pub type HistoryObserver = Arc<dyn Fn(&[HistoryRecord]) + Send + Sync>;

struct Inner {
    records: VecDeque<HistoryRecord>,
    observers: Vec<HistoryObserver>,
    capacity: usize,
}

/// Fixed-capacity, most-recent-first record log with observer fan-out.
///
/// All mutation is serialized behind one mutex. Observers are called after
/// the lock is released, on a snapshot taken while it was held.
pub struct HistoryBuffer {
    inner: Mutex<Inner>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HistoryBuffer {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(capacity + 1),
                observers: Vec::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Insert at the front, evicting the oldest record past capacity, then
    /// notify every observer once in registration order.
    pub fn append(&self, record: HistoryRecord) {
        let notify = {
            let mut inner = self.inner.lock();
            inner.records.push_front(record);
            if inner.records.len() > inner.capacity {
                inner.records.pop_back();
            }
            if inner.observers.is_empty() {
                None
            } else {
                let snapshot: Vec<HistoryRecord> = inner.records.iter().cloned().collect();
                Some((snapshot, inner.observers.clone()))
            }
        };

        if let Some((snapshot, observers)) = notify {
            for observer in &observers {
                observer(&snapshot);
            }
        }
    }

    /// Append a text record stamped with the current time.
    pub fn push(&self, text: impl Into<String>) {
        self.append(HistoryRecord::now(text));
    }

    pub fn snapshot(&self) -> Vec<HistoryRecord> {
        self.inner.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Returns `false` if this observer was already registered.
    pub fn register_observer(&self, observer: &HistoryObserver) -> bool {
        let mut inner = self.inner.lock();
        if inner.observers.iter().any(|o| Arc::ptr_eq(o, observer)) {
            return false;
        }
        inner.observers.push(Arc::clone(observer));
        true
    }

    /// Returns `false` if the observer was not registered.
    pub fn unregister_observer(&self, observer: &HistoryObserver) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.observers.len();
        inner.observers.retain(|o| !Arc::ptr_eq(o, observer));
        inner.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn texts(buf: &HistoryBuffer) -> Vec<String> {
        buf.snapshot().into_iter().map(|r| r.text).collect()
    }

    fn counting_observer() -> (HistoryObserver, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let obs: HistoryObserver = Arc::new(move |_records: &[HistoryRecord]| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (obs, hits)
    }

    #[test]
    fn append_inserts_most_recent_first() {
        let buf = HistoryBuffer::new();
        buf.push("a");
        buf.push("b");
        buf.push("c");
        assert_eq!(texts(&buf), vec!["c", "b", "a"]);
    }

    #[test]
    fn twenty_one_appends_evict_the_oldest() {
        let buf = HistoryBuffer::new();
        for i in 0..21 {
            buf.push(format!("r{i}"));
        }
        let t = texts(&buf);
        assert_eq!(t.len(), HISTORY_CAPACITY);
        assert_eq!(t.first().map(String::as_str), Some("r20"));
        assert_eq!(t.last().map(String::as_str), Some("r1"));
        assert!(!t.contains(&"r0".to_string()));
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let buf = HistoryBuffer::new();
        for i in 0..100 {
            buf.push(format!("r{i}"));
            assert!(buf.len() <= HISTORY_CAPACITY, "len {} after {i}", buf.len());
        }
        let t = texts(&buf);
        let expected: Vec<String> = (80..100).rev().map(|i| format!("r{i}")).collect();
        assert_eq!(t, expected);
    }

    #[test]
    fn empty_buffer_snapshot_is_empty() {
        let buf = HistoryBuffer::new();
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }

    #[test]
    fn observer_sees_committed_snapshot() {
        let buf = HistoryBuffer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let obs: HistoryObserver = Arc::new(move |records: &[HistoryRecord]| {
            sink.lock().push(records[0].text.clone());
        });
        buf.register_observer(&obs);

        buf.push("first");
        buf.push("second");
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn duplicate_registration_notifies_once() {
        let buf = HistoryBuffer::new();
        let (obs, hits) = counting_observer();
        assert!(buf.register_observer(&obs));
        assert!(!buf.register_observer(&obs));
        assert!(!buf.register_observer(&Arc::clone(&obs)));

        buf.push("x");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(buf.observer_count(), 1);
    }

    #[test]
    fn unregister_stops_notifications() {
        let buf = HistoryBuffer::new();
        let (obs, hits) = counting_observer();
        buf.register_observer(&obs);
        buf.push("x");
        assert!(buf.unregister_observer(&obs));
        buf.push("y");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_unknown_observer_is_noop() {
        let buf = HistoryBuffer::new();
        let (registered, hits) = counting_observer();
        let (stranger, _) = counting_observer();
        buf.register_observer(&registered);

        assert!(!buf.unregister_observer(&stranger));
        buf.push("x");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observers_run_in_registration_order() {
        let buf = HistoryBuffer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let observers: Vec<HistoryObserver> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                let obs: HistoryObserver = Arc::new(move |_: &[HistoryRecord]| order.lock().push(i));
                obs
            })
            .collect();
        for obs in &observers {
            buf.register_observer(obs);
        }

        buf.push("x");
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn observer_may_read_buffer_without_deadlock() {
        let buf = Arc::new(HistoryBuffer::new());
        let reader = Arc::clone(&buf);
        let lens = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lens);
        let obs: HistoryObserver = Arc::new(move |_: &[HistoryRecord]| {
            sink.lock().push(reader.len());
        });
        buf.register_observer(&obs);

        buf.push("a");
        buf.push("b");
        assert_eq!(*lens.lock(), vec![1, 2]);
        // break the Arc cycle
        buf.unregister_observer(&obs);
    }

    #[test]
    fn concurrent_appends_respect_capacity() {
        let buf = Arc::new(HistoryBuffer::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        buf.push(format!("t{t}-{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.len(), HISTORY_CAPACITY);
    }
}
