//! Redis-backed counter store.
//!
//! Batches are sent as a `MULTI`/`EXEC` pipeline over a shared
//! [`ConnectionManager`], so other clients observe either none or all of a
//! batch's effects.

use super::{expect_replies, CounterOp, CounterStore, CounterStoreError, Reply};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Value};
use std::fmt;
use tracing::warn;

const RELEASE_LEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    redis: ConnectionManager,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("redis", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisCounterStore {
    pub async fn new(redis_url: &str) -> Result<Self, CounterStoreError> {
        let client = redis::Client::open(redis_url).map_err(classify)?;
        let redis = ConnectionManager::new(client).await.map_err(classify)?;
        Ok(Self { redis })
    }

    /// Get a clone of the redis connection manager.
    fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

fn classify(e: RedisError) -> CounterStoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        CounterStoreError::Unavailable(e.to_string())
    } else {
        CounterStoreError::Rejected(e.to_string())
    }
}

fn convert(op: &CounterOp, value: &Value) -> Result<Reply, CounterStoreError> {
    let reply = match op {
        CounterOp::Get { .. } => {
            Reply::Int(redis::from_redis_value::<Option<i64>>(value).map_err(classify)?.unwrap_or(0))
        }
        CounterOp::ReadSet { .. } => {
            Reply::Members(redis::from_redis_value::<Vec<String>>(value).map_err(classify)?)
        }
        CounterOp::Incr { .. }
        | CounterOp::ExpireAt { .. }
        | CounterOp::AddToSet { .. }
        | CounterOp::RemoveFromSet { .. }
        | CounterOp::Delete { .. } => {
            Reply::Int(redis::from_redis_value::<i64>(value).map_err(classify)?)
        }
    };
    Ok(reply)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    #[tracing::instrument(
        name = "redis_batch",
        skip(self, ops),
        fields(webcounter.ops = ops.len())
    )]
    async fn batch(&self, ops: Vec<CounterOp>) -> Result<Vec<Reply>, CounterStoreError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                CounterOp::Incr { key } => pipe.cmd("INCR").arg(key),
                CounterOp::Get { key } => pipe.cmd("GET").arg(key),
                CounterOp::ExpireAt { key, at } => pipe.cmd("EXPIREAT").arg(key).arg(*at),
                CounterOp::AddToSet { set, member } => pipe.cmd("SADD").arg(set).arg(member),
                CounterOp::ReadSet { set } => pipe.cmd("SMEMBERS").arg(set),
                CounterOp::RemoveFromSet { set, member } => pipe.cmd("SREM").arg(set).arg(member),
                CounterOp::Delete { key } => pipe.cmd("DEL").arg(key),
            };
        }

        let values: Vec<Value> = pipe.query_async(&mut self.redis()).await.map_err(|e| {
            warn!("counter: redis batch failed: {}", e);
            classify(e)
        })?;

        let replies = ops
            .iter()
            .zip(values.iter())
            .map(|(op, value)| convert(op, value))
            .collect::<Result<Vec<_>, _>>()?;

        expect_replies(replies, ops.len())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_secs: u64,
    ) -> Result<bool, CounterStoreError> {
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut self.redis())
            .await
            .map_err(classify)?;
        Ok(acquired)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), CounterStoreError> {
        let _: i64 = redis::cmd("EVAL")
            .arg(RELEASE_LEASE_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(owner)
            .query_async(&mut self.redis())
            .await
            .map_err(classify)?;
        Ok(())
    }
}
