//! The process-wide TTL key-value store used for rate-limiting counters and
//! other cross-session bookkeeping.
//!
//! A single [`Store`] instance is shared (behind an `Arc`) by every session
//! and every adapter that needs cross-connection state. All operations are
//! linearizable per key; the map itself is protected by a single
//! `parking_lot::Mutex`, which trivially gives per-key linearizability at
//! the cost of coarser-than-necessary contention — acceptable here since
//! hold times are microseconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Stored value. Only `Number` participates in [`Store::increment`]; any
/// other shape makes `increment` fail with [`StoreError::NotNumeric`].
pub type Value = serde_json::Value;

/// What [`Store::get_and_update`]'s closure should do with the computed
/// replacement value.
pub enum Update {
    /// Write the new value back (with the given TTL, if any).
    Put(Value),
    /// Remove the entry.
    Delete,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("value stored at this key is not numeric")]
    NotNumeric,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// The process-wide concurrent TTL store (C2).
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the stored value, or `None` if absent or expired. An expired
    /// entry is deleted as a side effect of the lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut map = self.inner.lock();
        match map.get(key) {
            Some(entry) if entry.is_expired(now) => {
                map.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Unconditional write.
    pub fn put(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let mut map = self.inner.lock();
        map.insert(
            key.into(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Removes the entry regardless of existence.
    pub fn delete(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    /// Equivalent to `get(k) != None`.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Atomic (with respect to concurrent `increment` on the same key)
    /// read-increment-write. Absent/expired entries start at `delta`.
    pub fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut map = self.inner.lock();

        let existing = map.get(key).filter(|entry| !entry.is_expired(now));
        let new_value = match existing {
            None => delta,
            Some(entry) => match entry.value.as_i64() {
                Some(old) => old + delta,
                None => return Err(StoreError::NotNumeric),
            },
        };

        map.insert(
            key.to_string(),
            Entry {
                value: Value::from(new_value),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(new_value)
    }

    /// Advisory (non-atomic across keys) read-modify-write. `f` receives the
    /// current value (`None` if absent/expired) and returns `(ret, update)`.
    pub fn get_and_update<R>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: impl FnOnce(Option<Value>) -> (R, Update),
    ) -> R {
        let now = Instant::now();
        let mut map = self.inner.lock();

        let current = map
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone());

        let (ret, update) = f(current);

        match update {
            Update::Put(value) => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
            }
            Update::Delete => {
                map.remove(key);
            }
        }

        ret
    }

    /// Drops every entry, expired or not.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Deletes every entry whose expiry has already passed.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.inner.lock().retain(|_, entry| !entry.is_expired(now));
    }

    /// Spawns a background task that calls [`Store::sweep`] on a fixed
    /// interval (default 60s). Dropping the returned handle
    /// does not stop the task; abort it explicitly if needed.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep();
                tracing::trace!("TTL store sweep complete");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn put_get_delete_roundtrip() {
        let store = Store::new();
        store.put("k", Value::from("v"), None);
        assert_eq!(store.get("k"), Some(Value::from("v")));
        store.delete("k");
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn expiry_is_honored_lazily() {
        let store = Store::new();
        store.put("k", Value::from(1), Some(Duration::from_millis(10)));
        assert!(store.exists("k"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!store.exists("k"));
    }

    #[test]
    fn increment_starts_at_delta() {
        let store = Store::new();
        assert_eq!(store.increment("c", 5, None).unwrap(), 5);
        assert_eq!(store.increment("c", 3, None).unwrap(), 8);
    }

    #[test]
    fn increment_on_expired_restarts() {
        let store = Store::new();
        store.put("c", Value::from(100), Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.increment("c", 1, None).unwrap(), 1);
    }

    #[test]
    fn increment_on_non_numeric_fails() {
        let store = Store::new();
        store.put("c", Value::from("not a number"), None);
        assert_eq!(store.increment("c", 1, None), Err(StoreError::NotNumeric));
    }

    #[test]
    fn get_and_update_can_delete() {
        let store = Store::new();
        store.put("k", Value::from(1), None);
        store.get_and_update("k", None, |_| ((), Update::Delete));
        assert!(!store.exists("k"));
    }

    #[test]
    fn sweep_drops_only_expired() {
        let store = Store::new();
        store.put("expired", Value::from(1), Some(Duration::from_millis(1)));
        store.put("fresh", Value::from(1), None);
        std::thread::sleep(Duration::from_millis(20));
        store.sweep();
        assert!(!store.exists("expired"));
        assert!(store.exists("fresh"));
    }

    /// Invariant: concurrent increments on the same key each get a distinct
    /// return value, and the max of those values equals the final stored
    /// value.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_increment_is_linearizable() {
        let store = Store::new();
        let mut set = tokio::task::JoinSet::new();
        const N: usize = 64;

        for _ in 0..N {
            let store = store.clone();
            set.spawn(async move { store.increment("shared", 1, None).unwrap() });
        }

        let mut results = Vec::with_capacity(N);
        while let Some(result) = set.join_next().await {
            results.push(result.unwrap());
        }

        let mut sorted = results.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), N, "every increment must return a distinct value");

        let max = *results.iter().max().unwrap();
        assert_eq!(store.get("shared").unwrap().as_i64().unwrap(), max as i64);
        assert_eq!(max, N as i64);
    }
}
