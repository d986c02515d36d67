//! Redis counter store for `tollgate`.
//!
//! Window logs live in sorted sets: one member per admitted request, scored by
//! its timestamp in milliseconds. The conditional add runs as a Lua script so
//! that concurrent gateways sharing one Redis never admit more than the limit.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate_redis::RedisCounterStore;
//!
//! # async fn demo() -> Result<(), tollgate::StoreError> {
//! let store = RedisCounterStore::connect("redis://127.0.0.1:6379/").await?;
//! let rules = tollgate::RuleSet::new(tollgate::presets::tiered_rules());
//! let limiter = tollgate::RateLimiter::builder(rules).store(Arc::new(store)).build();
//! # let _ = limiter;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::fmt;
use std::time::Duration;
use tollgate::error::StoreError;
use tollgate::rate_limit::{CounterStore, WindowAdmission};
use tracing::debug;

const ADD_IF_UNDER_LIMIT: &str = r#"
local key = KEYS[1]
local threshold = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. threshold)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
    count = count + redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, ttl_ms + 1)
    admitted = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
    oldest_ms = tonumber(oldest[2])
end
return {admitted, count, oldest_ms}
"#;

/// Counter store shared by every gateway pointed at the same Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
    prefix: String,
}

impl RedisCounterStore {
    /// Open a managed, auto-reconnecting connection to `url`.
    ///
    /// # Errors
    /// [`StoreError::Protocol`] for a malformed URL, [`StoreError::Unavailable`]
    /// when the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Protocol(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;
        debug!(target: "tollgate::redis", url, "connected to counter store");
        Ok(Self::from_manager(conn))
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn, script: Script::new(ADD_IF_UNDER_LIMIT), prefix: String::new() }
    }

    /// Prefix every key, for sharing one Redis between deployments.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

fn classify(err: RedisError) -> StoreError {
    if err.is_timeout()
        || err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

fn admission(reply: &[i64]) -> Result<WindowAdmission, StoreError> {
    match reply {
        [admitted, count, oldest] => Ok(WindowAdmission {
            admitted: *admitted == 1,
            count: u64::try_from(*count).unwrap_or(0),
            oldest_millis: u64::try_from(*oldest).ok(),
        }),
        other => Err(StoreError::Protocol(format!("expected 3 integers, got {other:?}"))),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn remove_older_than(&self, key: &str, threshold_millis: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let max = format!("({threshold_millis}");
        let _: i64 = conn.zrembyscore(self.key(key), "-inf", max).await.map_err(classify)?;
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.zcard(self.key(key)).await.map_err(classify)
    }

    async fn add_if_under_limit(
        &self,
        key: &str,
        member: &str,
        at_millis: u64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowAdmission, StoreError> {
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .script
            .key(self.key(key))
            .arg(at_millis.saturating_sub(ttl_millis))
            .arg(at_millis)
            .arg(limit)
            .arg(ttl_millis)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        admission(&reply)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
