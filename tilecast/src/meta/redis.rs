//! Redis/Valkey MetaStore for fleet-shared state.
//!
//! Uses a multiplexed connection manager so every operation is a single
//! round trip on a shared pipeline. The token bucket runs as a Lua script to
//! keep refill-and-spend atomic; the caller supplies the timestamp so the
//! script stays replication-safe.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;

use super::{BoxFuture, BucketDecision, MetaStore, MetaStoreError};

/// Refill-and-spend in one atomic script.
///
/// Returns `{allowed, tokens-as-string, retry_ms}`; tokens travel as a string
/// because Lua-to-Redis number conversion truncates to integers.
const BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local cost = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_per_sec = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill_per_sec)

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'ts', now_ms)
redis.call('PEXPIRE', key, 120000)

local retry_ms = 0
if allowed == 0 and refill_per_sec > 0 then
  retry_ms = math.ceil((cost - tokens) / refill_per_sec * 1000)
end
return {allowed, tostring(tokens), retry_ms}
"#;

/// MetaStore backed by Redis or Valkey.
pub struct RedisMetaStore {
    manager: ConnectionManager,
    bucket_script: Script,
}

impl std::fmt::Debug for RedisMetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMetaStore").finish_non_exhaustive()
    }
}

impl RedisMetaStore {
    /// Connects to the given Redis URL.
    ///
    /// # Errors
    ///
    /// `MetaStoreError::Unavailable` when the URL is invalid or the initial
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, MetaStoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| MetaStoreError::Unavailable(format!("invalid redis url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| MetaStoreError::Unavailable(format!("redis connect failed: {e}")))?;
        Ok(Self {
            manager,
            bucket_script: Script::new(BUCKET_SCRIPT),
        })
    }

    fn map_err(e: redis::RedisError) -> MetaStoreError {
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
            MetaStoreError::Unavailable(e.to_string())
        } else {
            MetaStoreError::Backend(e.to_string())
        }
    }
}

impl MetaStore for RedisMetaStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, MetaStoreError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)
        })
    }

    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), MetaStoreError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("PX")
                .arg(ttl.as_millis().max(1) as u64)
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)?;
            Ok(())
        })
    }

    fn setnx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, MetaStoreError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis().max(1) as u64)
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)?;
            Ok(reply.is_some())
        })
    }

    fn del(&self, key: &str) -> BoxFuture<'_, Result<(), MetaStoreError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: () = redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)?;
            Ok(())
        })
    }

    fn del_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<u64, MetaStoreError>> {
        let pattern = format!("{}*", prefix.replace('*', "\\*"));
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await
                    .map_err(Self::map_err)?;
                if !keys.is_empty() {
                    let count: u64 = redis::cmd("DEL")
                        .arg(&keys)
                        .query_async(&mut conn)
                        .await
                        .map_err(Self::map_err)?;
                    removed += count;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(removed)
        })
    }

    fn incr_bucket(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        refill_per_sec: f64,
    ) -> BoxFuture<'_, Result<BucketDecision, MetaStoreError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let (allowed, tokens, retry_ms): (i64, String, i64) = self
                .bucket_script
                .key(&key)
                .arg(cost)
                .arg(capacity)
                .arg(refill_per_sec)
                .arg(now_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(Self::map_err)?;
            let remaining = tokens.parse::<f64>().unwrap_or(0.0).max(0.0) as u64;
            Ok(BucketDecision {
                allowed: allowed == 1,
                remaining,
                retry_after: Duration::from_millis(retry_ms.max(0) as u64),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let err = RedisMetaStore::connect("not-a-redis-url").await.unwrap_err();
        assert!(matches!(err, MetaStoreError::Unavailable(_)));
    }

    #[test]
    fn test_bucket_script_shape() {
        // The script must keep refill and spend in one atomic unit and
        // always bound the key's lifetime.
        assert!(BUCKET_SCRIPT.contains("HMGET"));
        assert!(BUCKET_SCRIPT.contains("HSET"));
        assert!(BUCKET_SCRIPT.contains("PEXPIRE"));
    }
}
