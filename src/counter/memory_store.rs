//! In-process counter store.
//!
//! Implements the same atomic-batch contract as Redis by holding a single
//! lock for the duration of a batch. Used by tests; the server always runs
//! against Redis. Expiry is not time-driven: callers sweep explicitly with
//! [`MemoryCounterStore::sweep_expired`].

use super::{CounterOp, CounterStore, CounterStoreError, Reply};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
struct MemoryState {
    ints: HashMap<String, i64>,
    sets: HashMap<String, BTreeSet<String>>,
    expiries: HashMap<String, i64>,
    leases: HashMap<String, (String, i64)>,
}

impl MemoryState {
    fn exists(&self, key: &str) -> bool {
        self.ints.contains_key(key) || self.sets.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> i64 {
        self.expiries.remove(key);
        let removed = self.ints.remove(key).is_some() || self.sets.remove(key).is_some();
        removed as i64
    }

    /// Reject the whole batch up front if any op targets a key of the wrong type.
    fn check(&self, ops: &[CounterOp]) -> Result<(), CounterStoreError> {
        for op in ops {
            let (key, wants_set) = match op {
                CounterOp::Incr { key } | CounterOp::Get { key } => (key, false),
                CounterOp::AddToSet { set, .. }
                | CounterOp::ReadSet { set }
                | CounterOp::RemoveFromSet { set, .. } => (set, true),
                CounterOp::ExpireAt { .. } | CounterOp::Delete { .. } => continue,
            };
            let wrong_type = if wants_set {
                self.ints.contains_key(key)
            } else {
                self.sets.contains_key(key)
            };
            if wrong_type {
                return Err(CounterStoreError::Rejected(format!(
                    "WRONGTYPE {} against key '{}'",
                    op.name(),
                    key
                )));
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: CounterOp) -> Reply {
        match op {
            CounterOp::Incr { key } => {
                let value = self.ints.entry(key).or_insert(0);
                *value += 1;
                Reply::Int(*value)
            }
            CounterOp::Get { key } => Reply::Int(self.ints.get(&key).copied().unwrap_or(0)),
            CounterOp::ExpireAt { key, at } => {
                if self.exists(&key) {
                    self.expiries.insert(key, at);
                    Reply::Int(1)
                } else {
                    Reply::Int(0)
                }
            }
            CounterOp::AddToSet { set, member } => {
                Reply::Int(self.sets.entry(set).or_default().insert(member) as i64)
            }
            CounterOp::ReadSet { set } => Reply::Members(
                self.sets
                    .get(&set)
                    .map(|members| members.iter().cloned().collect())
                    .unwrap_or_default(),
            ),
            CounterOp::RemoveFromSet { set, member } => {
                let removed = match self.sets.get_mut(&set) {
                    Some(members) => members.remove(&member),
                    None => false,
                };
                // Redis drops empty sets.
                if self.sets.get(&set).is_some_and(|m| m.is_empty()) {
                    self.remove(&set);
                }
                Reply::Int(removed as i64)
            }
            CounterOp::Delete { key } => Reply::Int(self.remove(&key)),
        }
    }
}

/// Counter store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    state: Mutex<MemoryState>,
    fail_batches: AtomicBool,
    batch_count: AtomicUsize,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave a batch half-applied:
        // ops are validated before any mutation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent batch fail as if the store were unreachable.
    pub fn set_unavailable(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    /// Number of batches executed successfully so far.
    pub fn batch_count(&self) -> usize {
        self.batch_count.load(Ordering::SeqCst)
    }

    /// Drop every key whose expiry is at or before `now` (unix seconds).
    pub fn sweep_expired(&self, now: i64) -> usize {
        let mut state = self.state();
        let expired: Vec<String> = state
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Current integer value of `key`, if present.
    pub fn value(&self, key: &str) -> Option<i64> {
        self.state().ints.get(key).copied()
    }

    /// Members of `set`, sorted.
    pub fn members(&self, set: &str) -> Vec<String> {
        self.state()
            .sets
            .get(set)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Expiry timestamp recorded for `key`, if any.
    pub fn expiry(&self, key: &str) -> Option<i64> {
        self.state().expiries.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state().exists(key)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn batch(&self, ops: Vec<CounterOp>) -> Result<Vec<Reply>, CounterStoreError> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(CounterStoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }

        let mut state = self.state();
        state.check(&ops)?;
        let replies = ops.into_iter().map(|op| state.apply(op)).collect();
        self.batch_count.fetch_add(1, Ordering::SeqCst);
        Ok(replies)
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_secs: u64,
    ) -> Result<bool, CounterStoreError> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(CounterStoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }

        let now = unix_now();
        let mut state = self.state();
        match state.leases.get(key) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                state.leases.insert(
                    key.to_string(),
                    (owner.to_string(), now + ttl_secs.max(1) as i64),
                );
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), CounterStoreError> {
        let mut state = self.state();
        if state.leases.get(key).is_some_and(|(holder, _)| holder == owner) {
            state.leases.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_replies_are_positional() {
        let store = MemoryCounterStore::new();
        let replies = store
            .batch(vec![
                CounterOp::incr("a"),
                CounterOp::incr("a"),
                CounterOp::get("b"),
                CounterOp::add_to_set("s", "1"),
                CounterOp::add_to_set("s", "1"),
                CounterOp::read_set("s"),
            ])
            .await
            .unwrap();

        assert_eq!(
            replies,
            vec![
                Reply::Int(1),
                Reply::Int(2),
                Reply::Int(0),
                Reply::Int(1),
                Reply::Int(0),
                Reply::Members(vec!["1".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn wrong_type_rejects_whole_batch() {
        let store = MemoryCounterStore::new();
        store.add_to_set("s", "1").await.unwrap();

        let result = store
            .batch(vec![CounterOp::incr("a"), CounterOp::incr("s")])
            .await;
        assert!(matches!(result, Err(CounterStoreError::Rejected(_))));
        assert_eq!(store.value("a"), None, "no partial increments");
    }

    #[tokio::test]
    async fn unavailable_store_applies_nothing() {
        let store = MemoryCounterStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.increment("a").await,
            Err(CounterStoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert_eq!(store.get("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expiry_and_sweep() {
        let store = MemoryCounterStore::new();
        store.increment("a").await.unwrap();
        store.increment("b").await.unwrap();
        store.expire_at("a", 100).await.unwrap();
        store.expire_at("missing", 100).await.unwrap();

        assert_eq!(store.expiry("a"), Some(100));
        assert_eq!(store.expiry("missing"), None);
        assert_eq!(store.sweep_expired(99), 0);
        assert_eq!(store.sweep_expired(100), 1);
        assert!(!store.contains_key("a"));
        assert_eq!(store.value("b"), Some(1));
    }

    #[tokio::test]
    async fn removing_last_member_drops_set() {
        let store = MemoryCounterStore::new();
        store.add_to_set("s", "1").await.unwrap();
        store.remove_from_set("s", "1").await.unwrap();
        assert!(!store.contains_key("s"));
        assert!(store.read_set("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leases_are_exclusive_until_released() {
        let store = MemoryCounterStore::new();
        assert!(store.try_acquire_lease("l", "a", 60).await.unwrap());
        assert!(!store.try_acquire_lease("l", "b", 60).await.unwrap());

        // Only the holder can release.
        store.release_lease("l", "b").await.unwrap();
        assert!(!store.try_acquire_lease("l", "b", 60).await.unwrap());

        store.release_lease("l", "a").await.unwrap();
        assert!(store.try_acquire_lease("l", "b", 60).await.unwrap());
    }
}
