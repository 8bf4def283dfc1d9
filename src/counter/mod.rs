//! Volatile counter storage.
//!
//! [`CounterStore`] is the only synchronization primitive the service relies
//! on: every logical event is expressed as one [`CounterStore::batch`] call,
//! which implementations must apply atomically. Single-operation helpers are
//! thin wrappers over a one-element batch.

mod memory_store;
mod redis_store;

pub use memory_store::MemoryCounterStore;
pub use redis_store::RedisCounterStore;

use async_trait::async_trait;
use std::fmt::Debug;

/// One operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterOp {
    Incr { key: String },
    Get { key: String },
    /// Expire `key` at the given unix timestamp (seconds).
    ExpireAt { key: String, at: i64 },
    AddToSet { set: String, member: String },
    ReadSet { set: String },
    RemoveFromSet { set: String, member: String },
    Delete { key: String },
}

impl CounterOp {
    pub fn incr(key: impl Into<String>) -> Self {
        CounterOp::Incr { key: key.into() }
    }

    pub fn get(key: impl Into<String>) -> Self {
        CounterOp::Get { key: key.into() }
    }

    pub fn expire_at(key: impl Into<String>, at: i64) -> Self {
        CounterOp::ExpireAt {
            key: key.into(),
            at,
        }
    }

    pub fn add_to_set(set: impl Into<String>, member: impl Into<String>) -> Self {
        CounterOp::AddToSet {
            set: set.into(),
            member: member.into(),
        }
    }

    pub fn read_set(set: impl Into<String>) -> Self {
        CounterOp::ReadSet { set: set.into() }
    }

    pub fn remove_from_set(set: impl Into<String>, member: impl Into<String>) -> Self {
        CounterOp::RemoveFromSet {
            set: set.into(),
            member: member.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        CounterOp::Delete { key: key.into() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CounterOp::Incr { .. } => "INCR",
            CounterOp::Get { .. } => "GET",
            CounterOp::ExpireAt { .. } => "EXPIREAT",
            CounterOp::AddToSet { .. } => "SADD",
            CounterOp::ReadSet { .. } => "SMEMBERS",
            CounterOp::RemoveFromSet { .. } => "SREM",
            CounterOp::Delete { .. } => "DEL",
        }
    }
}

/// Positional reply to a [`CounterOp`].
///
/// `Incr` and `Get` yield the counter value (0 when absent); `AddToSet`,
/// `RemoveFromSet` and `Delete` yield the number of elements affected;
/// `ExpireAt` yields 1 if the key existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Int(i64),
    Members(Vec<String>),
}

impl Reply {
    pub fn as_int(&self) -> Result<i64, CounterStoreError> {
        match self {
            Reply::Int(v) => Ok(*v),
            Reply::Members(_) => Err(CounterStoreError::UnexpectedReply(
                "expected integer, got set members".to_string(),
            )),
        }
    }

    pub fn into_members(self) -> Result<Vec<String>, CounterStoreError> {
        match self {
            Reply::Members(m) => Ok(m),
            Reply::Int(_) => Err(CounterStoreError::UnexpectedReply(
                "expected set members, got integer".to_string(),
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CounterStoreError {
    /// The store could not be reached; nothing was applied.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the batch (e.g. type mismatch on a key).
    #[error("counter batch rejected: {0}")]
    Rejected(String),

    #[error("unexpected counter store reply: {0}")]
    UnexpectedReply(String),
}

/// Atomic counter and set operations over a volatile key/value store.
///
/// Implementations never retry; retry policy belongs to callers.
#[async_trait]
pub trait CounterStore: Debug + Send + Sync {
    /// Execute `ops` as one atomic unit and return one reply per op, in order.
    async fn batch(&self, ops: Vec<CounterOp>) -> Result<Vec<Reply>, CounterStoreError>;

    /// Take a named lease if nobody holds it. Returns true when acquired.
    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_secs: u64,
    ) -> Result<bool, CounterStoreError>;

    /// Release a lease, but only if `owner` still holds it.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), CounterStoreError>;

    async fn increment(&self, key: &str) -> Result<i64, CounterStoreError> {
        single(self, CounterOp::incr(key)).await?.as_int()
    }

    async fn get(&self, key: &str) -> Result<i64, CounterStoreError> {
        single(self, CounterOp::get(key)).await?.as_int()
    }

    async fn expire_at(&self, key: &str, at: i64) -> Result<(), CounterStoreError> {
        single(self, CounterOp::expire_at(key, at)).await?;
        Ok(())
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), CounterStoreError> {
        single(self, CounterOp::add_to_set(set, member)).await?;
        Ok(())
    }

    async fn read_set(&self, set: &str) -> Result<Vec<String>, CounterStoreError> {
        single(self, CounterOp::read_set(set)).await?.into_members()
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), CounterStoreError> {
        single(self, CounterOp::remove_from_set(set, member)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError> {
        single(self, CounterOp::delete(key)).await?;
        Ok(())
    }
}

async fn single<S: CounterStore + ?Sized>(
    store: &S,
    op: CounterOp,
) -> Result<Reply, CounterStoreError> {
    let name = op.name();
    store
        .batch(vec![op])
        .await?
        .pop()
        .ok_or_else(|| CounterStoreError::UnexpectedReply(format!("no reply for {}", name)))
}

/// Check that a batch produced exactly one reply per op.
pub(crate) fn expect_replies(
    replies: Vec<Reply>,
    expected: usize,
) -> Result<Vec<Reply>, CounterStoreError> {
    if replies.len() != expected {
        return Err(CounterStoreError::UnexpectedReply(format!(
            "expected {} replies, got {}",
            expected,
            replies.len()
        )));
    }
    Ok(replies)
}
