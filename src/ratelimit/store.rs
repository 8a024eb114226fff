//! Concurrent window store shared by every policy.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace};

use super::key::RecordKey;
use super::record::RateLimitRecord;

/// Concurrent map from (policy, key) to its [`RateLimitRecord`].
///
/// Backed by a sharded map: all work on one record happens under that
/// record's shard lock, so updates to the same key are linearizable while
/// keys in other shards proceed in parallel. The janitor goes through the
/// same map API, one shard at a time.
#[derive(Debug, Default)]
pub struct WindowStore {
    records: DashMap<RecordKey, RateLimitRecord>,
}

impl WindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or lazily create the record for `(policy, key)` and run `f` with
    /// exclusive access to it.
    ///
    /// `f` must not call back into the store or wait on anything: the shard
    /// lock is held for its whole duration.
    pub fn with_record<R>(
        &self,
        policy: &Arc<str>,
        key: &str,
        window: Duration,
        now: u64,
        f: impl FnOnce(&mut RateLimitRecord) -> R,
    ) -> R {
        let record_key = RecordKey::new(policy, key);
        let mut entry = self.records.entry(record_key).or_insert_with(|| {
            debug!(policy = %policy, key = %key, "Creating new rate limit record");
            RateLimitRecord::new(key, now, window)
        });
        f(entry.value_mut())
    }

    /// Undo one optimistic increment made in the window that started at
    /// `window_start`.
    ///
    /// Does nothing if the record is gone, has rolled over to a newer window,
    /// or its window has already ended. Returns `true` if a decrement happened.
    pub fn decrement(&self, policy: &Arc<str>, key: &str, window_start: u64, now: u64) -> bool {
        let record_key = RecordKey::new(policy, key);
        match self.records.get_mut(&record_key) {
            Some(mut record) if record.window_start == window_start && !record.is_expired(now) => {
                let count = record.decrement();
                trace!(key = %record_key, count, "Compensated successful request");
                true
            }
            _ => {
                trace!(key = %record_key, "Ignoring stale compensation");
                false
            }
        }
    }

    /// Remove every record whose window ended before `now`.
    ///
    /// Returns the number of records evicted.
    pub fn sweep(&self, now: u64) -> usize {
        let mut evicted = 0;
        self.records.retain(|_, record| {
            if record.is_expired(now) {
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Copy of the current record for `(policy, key)`, if any.
    pub fn snapshot(&self, policy: &Arc<str>, key: &str) -> Option<RateLimitRecord> {
        self.records
            .get(&RecordKey::new(policy, key))
            .map(|record| record.value().clone())
    }

    /// Get the number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(1000);

    fn policy(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn test_with_record_creates_lazily() {
        let store = WindowStore::new();
        let global = policy("global");

        assert!(store.snapshot(&global, "a").is_none());
        let count = store.with_record(&global, "a", WINDOW, 0, |r| r.increment());

        assert_eq!(count, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot(&global, "a").unwrap().reset_at, 1000);
    }

    #[test]
    fn test_one_record_per_policy_and_key() {
        let store = WindowStore::new();
        let global = policy("global");
        let auth = policy("auth");

        for _ in 0..3 {
            store.with_record(&global, "a", WINDOW, 0, |r| r.increment());
        }
        store.with_record(&auth, "a", WINDOW, 0, |r| r.increment());
        store.with_record(&global, "b", WINDOW, 0, |r| r.increment());

        assert_eq!(store.len(), 3);
        assert_eq!(store.snapshot(&global, "a").unwrap().count, 3);
        assert_eq!(store.snapshot(&auth, "a").unwrap().count, 1);
    }

    #[test]
    fn test_decrement_same_window() {
        let store = WindowStore::new();
        let global = policy("global");
        let start = store.with_record(&global, "a", WINDOW, 0, |r| {
            r.increment();
            r.increment();
            r.window_start
        });

        assert!(store.decrement(&global, "a", start, 10));
        assert_eq!(store.snapshot(&global, "a").unwrap().count, 1);
    }

    #[test]
    fn test_decrement_stale_window_is_noop() {
        let store = WindowStore::new();
        let global = policy("global");
        let stale = store.with_record(&global, "a", WINDOW, 0, |r| {
            r.increment();
            r.window_start
        });

        // Roll the record into a new window and count once there.
        store.with_record(&global, "a", WINDOW, 2000, |r| {
            r.roll_if_expired(2000, WINDOW);
            r.increment();
        });

        assert!(!store.decrement(&global, "a", stale, 2100));
        assert_eq!(store.snapshot(&global, "a").unwrap().count, 1);
    }

    #[test]
    fn test_decrement_missing_or_expired_is_noop() {
        let store = WindowStore::new();
        let global = policy("global");
        assert!(!store.decrement(&global, "missing", 0, 0));

        let start = store.with_record(&global, "a", WINDOW, 0, |r| {
            r.increment();
            r.window_start
        });
        assert!(!store.decrement(&global, "a", start, 1001));
        assert_eq!(store.snapshot(&global, "a").unwrap().count, 1);
    }

    #[test]
    fn test_sweep_evicts_only_expired() {
        let store = WindowStore::new();
        let global = policy("global");
        store.with_record(&global, "old", WINDOW, 0, |r| r.increment());
        store.with_record(&global, "new", WINDOW, 900, |r| r.increment());

        assert_eq!(store.sweep(1000), 0);
        assert_eq!(store.sweep(1001), 1);
        assert!(store.snapshot(&global, "old").is_none());
        assert!(store.snapshot(&global, "new").is_some());
    }

    #[test]
    fn test_clear() {
        let store = WindowStore::new();
        store.with_record(&policy("global"), "a", WINDOW, 0, |r| r.increment());
        assert!(!store.is_empty());

        store.clear();
        assert!(store.is_empty());
    }
}
