//! Redis reference adapter (component C9)
//!
//! The teacher's own Redis code (`enterprise::ratelimit::distributed`) is a
//! simulated connection that never talks to a real server; what it does
//! get right, and what this file keeps, is the *shape*: one Lua script per
//! atomic operation, invoked through `EVAL`/`EVALSHA`, with `KEYS`/`ARGV`
//! doing the work a hand-rolled read-modify-write loop would otherwise
//! need a transaction for. Since `latch`'s `Cargo.toml` pulls in the real
//! `redis` crate, this adapter drives an actual `ConnectionManager`
//! instead of `DashMap`-backed make-believe.
//!
//! Redis's own key expiry (`PX`/`PEXPIRE`) does the work the SQL adapter's
//! sweeper has to do by hand, so every script passes absolute expirations
//! down as `PEXPIRE` milliseconds rather than re-deriving "now" twice.

use super::{AdapterLifecycle, CacheAdapter, LockAdapter, LockRow, SharedLockAdapter, SharedLockRow};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;

fn millis_until(expiration: Option<DateTime<Utc>>) -> i64 {
    match expiration {
        Some(exp) => (exp - Utc::now()).num_milliseconds().max(1),
        None => 0,
    }
}

fn epoch_millis(expiration: Option<DateTime<Utc>>) -> i64 {
    expiration.map(|e| e.timestamp_millis()).unwrap_or(0)
}

fn from_epoch_millis(value: i64) -> Option<DateTime<Utc>> {
    if value == 0 {
        None
    } else {
        Utc.timestamp_millis_opt(value).single()
    }
}

/// Redis-backed [`CacheAdapter`]/[`LockAdapter`]/[`SharedLockAdapter`].
pub struct RedisAdapter {
    manager: ConnectionManager,
}

impl RedisAdapter {
    /// Connect to the given `redis://` URL and build a
    /// [`redis::aio::ConnectionManager`], which auto-reconnects on
    /// transport failure the way the teacher's connection pools retry
    /// underneath their health checks.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl AdapterLifecycle for RedisAdapter {}

#[async_trait]
impl CacheAdapter for RedisAdapter {
    fn type_tag(&self) -> &'static str {
        "redis-cache"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<String>> {
        const SCRIPT: &str = r#"
            local v = redis.call('GET', KEYS[1])
            if v then redis.call('DEL', KEYS[1]) end
            return v
        "#;
        Ok(Script::new(SCRIPT).key(key).invoke_async(&mut self.conn()).await?)
    }

    async fn add(&self, key: &str, value: &str, ttl: Option<chrono::Duration>) -> Result<bool> {
        let mut conn = self.conn();
        let result: Option<String> = match ttl {
            Some(d) => conn.set_options(
                key,
                value,
                redis::SetOptions::default().conditional_set(redis::ExistenceCheck::NX).with_expiration(
                    redis::SetExpiry::PX(d.num_milliseconds().max(1) as usize),
                ),
            ).await?,
            None => conn.set_options(key, value, redis::SetOptions::default().conditional_set(redis::ExistenceCheck::NX)).await?,
        };
        Ok(result.is_some())
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<chrono::Duration>) -> Result<bool> {
        const SCRIPT: &str = r#"
            local existed = redis.call('EXISTS', KEYS[1]) == 1
            if tonumber(ARGV[2]) > 0 then
                redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
            else
                redis.call('SET', KEYS[1], ARGV[1])
            end
            if existed then return 1 else return 0 end
        "#;
        let px = ttl.map(|d| d.num_milliseconds().max(1)).unwrap_or(0);
        let replaced: i64 = Script::new(SCRIPT).key(key).arg(value).arg(px).invoke_async(&mut self.conn()).await?;
        Ok(replaced == 1)
    }

    async fn update(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let result: Option<String> = conn
            .set_options(key, value, redis::SetOptions::default().conditional_set(redis::ExistenceCheck::XX))
            .await?;
        Ok(result.is_some())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<bool> {
        const SCRIPT: &str = r#"
            if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
            redis.call('INCRBY', KEYS[1], ARGV[1])
            return 1
        "#;
        let result: std::result::Result<i64, redis::RedisError> = Script::new(SCRIPT).key(key).arg(delta).invoke_async(&mut self.conn()).await;
        match result {
            Ok(existed) => Ok(existed == 1),
            Err(err) if err.to_string().contains("not an integer") => Err(Error::TypeMismatch(key.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn remove_many(&self, keys: &[String]) -> Result<HashMap<String, bool>> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            results.insert(key.clone(), CacheAdapter::remove(self, key).await?);
        }
        Ok(results)
    }

    async fn remove_by_key_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = self.conn().keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = self.conn().del(keys).await?;
        Ok(removed)
    }

    async fn remove_all(&self) -> Result<u64> {
        self.remove_by_key_prefix("").await
    }

    // Redis expires keys natively; there is nothing left for a sweeper to do.
    async fn remove_all_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

#[async_trait]
impl LockAdapter for RedisAdapter {
    fn type_tag(&self) -> &'static str {
        "redis-lock"
    }

    async fn insert(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let mut conn = self.conn();
        let ms = millis_until(expiration);
        let result: Option<String> = if ms > 0 {
            conn.set_options(
                key,
                owner,
                redis::SetOptions::default().conditional_set(redis::ExistenceCheck::NX).with_expiration(redis::SetExpiry::PX(ms as usize)),
            )
            .await?
        } else {
            conn.set_options(key, owner, redis::SetOptions::default().conditional_set(redis::ExistenceCheck::NX)).await?
        };
        Ok(result.is_some())
    }

    async fn update(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        // Redis TTL removes expired rows on its own, so "absent or expired" collapses to "absent".
        self.insert(key, owner, expiration).await
    }

    async fn remove(&self, key: &str, owner: Option<&str>) -> Result<bool> {
        match owner {
            Some(owner) => {
                const SCRIPT: &str = r#"
                    if redis.call('GET', KEYS[1]) == ARGV[1] then
                        return redis.call('DEL', KEYS[1])
                    end
                    return 0
                "#;
                let removed: i64 = Script::new(SCRIPT).key(key).arg(owner).invoke_async(&mut self.conn()).await?;
                Ok(removed > 0)
            }
            None => {
                let removed: i64 = self.conn().del(key).await?;
                Ok(removed > 0)
            }
        }
    }

    async fn refresh(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        const SCRIPT: &str = r#"
            if redis.call('GET', KEYS[1]) ~= ARGV[1] then return 0 end
            if tonumber(ARGV[2]) > 0 then
                redis.call('PEXPIRE', KEYS[1], ARGV[2])
            else
                redis.call('PERSIST', KEYS[1])
            end
            return 1
        "#;
        let ms = millis_until(expiration);
        let updated: i64 = Script::new(SCRIPT).key(key).arg(owner).arg(ms).invoke_async(&mut self.conn()).await?;
        Ok(updated == 1)
    }

    async fn find(&self, key: &str) -> Result<Option<LockRow>> {
        let mut conn = self.conn();
        let owner: Option<String> = conn.get(key).await?;
        let Some(owner) = owner else {
            return Ok(None);
        };
        let ttl_ms: i64 = conn.pttl(key).await?;
        let expiration = if ttl_ms < 0 { None } else { Some(Utc::now() + chrono::Duration::milliseconds(ttl_ms)) };
        Ok(Some(LockRow { owner, expiration }))
    }
}

// `__limit__` is a reserved hash field holding the limit fixed by the first
// acquirer (§4.3.1: "limit is fixed on first acquisition ... later
// acquirers' limit argument is ignored"); it is never counted as a slot.
const READER_ACQUIRE_SCRIPT: &str = r#"
    local readers_key = KEYS[1]
    local writer_key = KEYS[2]
    local owner = ARGV[1]
    local requested_limit = tonumber(ARGV[2])
    local expires_at = tonumber(ARGV[3])
    local now = tonumber(ARGV[4])

    if redis.call('EXISTS', writer_key) == 1 then return 0 end

    local fields = redis.call('HKEYS', readers_key)
    for _, f in ipairs(fields) do
        if f ~= '__limit__' then
            local v = tonumber(redis.call('HGET', readers_key, f))
            if v ~= 0 and v <= now then redis.call('HDEL', readers_key, f) end
        end
    end
    if redis.call('HLEN', readers_key) == 1 and redis.call('HEXISTS', readers_key, '__limit__') == 1 then
        redis.call('DEL', readers_key)
    end

    local stored_limit = redis.call('HGET', readers_key, '__limit__')
    local limit
    if stored_limit then
        limit = tonumber(stored_limit)
    else
        limit = requested_limit
        redis.call('HSET', readers_key, '__limit__', limit)
    end

    local already = redis.call('HEXISTS', readers_key, owner) == 1
    local count = redis.call('HLEN', readers_key) - 1
    if not already and count >= limit then return 0 end

    redis.call('HSET', readers_key, owner, expires_at)
    return 1
"#;

const WRITER_ACQUIRE_SCRIPT: &str = r#"
    local readers_key = KEYS[1]
    local writer_key = KEYS[2]
    local owner = ARGV[1]
    local expires_at = tonumber(ARGV[2])
    local ttl_ms = tonumber(ARGV[3])
    local now = tonumber(ARGV[4])

    local fields = redis.call('HKEYS', readers_key)
    local live = 0
    for _, f in ipairs(fields) do
        if f ~= '__limit__' then
            local v = tonumber(redis.call('HGET', readers_key, f))
            if v ~= 0 and v <= now then
                redis.call('HDEL', readers_key, f)
            else
                live = live + 1
            end
        end
    end
    if live > 0 then return 0 end
    if redis.call('HLEN', readers_key) == 1 and redis.call('HEXISTS', readers_key, '__limit__') == 1 then
        redis.call('DEL', readers_key)
    end

    local current = redis.call('GET', writer_key)
    if current and current ~= owner then return 0 end

    if ttl_ms > 0 then
        redis.call('SET', writer_key, owner, 'PX', ttl_ms)
    else
        redis.call('SET', writer_key, owner)
    end
    return 1
"#;

#[async_trait]
impl SharedLockAdapter for RedisAdapter {
    fn type_tag(&self) -> &'static str {
        "redis-shared-lock"
    }

    async fn acquire_reader(
        &self,
        key: &str,
        owner: &str,
        limit: usize,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let granted: i64 = Script::new(READER_ACQUIRE_SCRIPT)
            .key(format!("{key}:readers"))
            .key(format!("{key}:writer"))
            .arg(owner)
            .arg(limit as i64)
            .arg(epoch_millis(expiration))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(granted == 1)
    }

    async fn acquire_writer(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let granted: i64 = Script::new(WRITER_ACQUIRE_SCRIPT)
            .key(format!("{key}:readers"))
            .key(format!("{key}:writer"))
            .arg(owner)
            .arg(epoch_millis(expiration))
            .arg(millis_until(expiration))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(granted == 1)
    }

    async fn release_reader(&self, key: &str, owner: &str) -> Result<bool> {
        // Drop the whole hash once the last real slot is gone, so the next
        // acquirer re-establishes `__limit__` from scratch rather than
        // inheriting a stale value from a shape that no longer exists.
        const SCRIPT: &str = r#"
            local removed = redis.call('HDEL', KEYS[1], ARGV[1])
            local remaining = redis.call('HLEN', KEYS[1])
            if remaining == 1 and redis.call('HEXISTS', KEYS[1], '__limit__') == 1 then
                redis.call('DEL', KEYS[1])
            end
            return removed
        "#;
        let removed: i64 = Script::new(SCRIPT)
            .key(format!("{key}:readers"))
            .arg(owner)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn release_writer(&self, key: &str, owner: &str) -> Result<bool> {
        const SCRIPT: &str = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
        "#;
        let removed: i64 = Script::new(SCRIPT)
            .key(format!("{key}:writer"))
            .arg(owner)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn refresh_reader(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        const SCRIPT: &str = r#"
            if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then return 0 end
            redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
            return 1
        "#;
        let updated: i64 = Script::new(SCRIPT)
            .key(format!("{key}:readers"))
            .arg(owner)
            .arg(epoch_millis(expiration))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(updated == 1)
    }

    async fn refresh_writer(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        self.refresh(format!("{key}:writer").as_str(), owner, expiration).await
    }

    async fn force_release_all_readers(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.conn().del(format!("{key}:readers")).await?;
        Ok(removed > 0)
    }

    async fn force_release_writer(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.conn().del(format!("{key}:writer")).await?;
        Ok(removed > 0)
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let writer = self.force_release_writer(key).await?;
        let readers = self.force_release_all_readers(key).await?;
        Ok(writer || readers)
    }

    async fn get_state(&self, key: &str) -> Result<SharedLockRow> {
        let mut conn = self.conn();
        let owner: Option<String> = conn.get(format!("{key}:writer")).await?;
        if let Some(owner) = owner {
            let ttl_ms: i64 = conn.pttl(format!("{key}:writer")).await?;
            let expiration = if ttl_ms < 0 { None } else { Some(Utc::now() + chrono::Duration::milliseconds(ttl_ms)) };
            return Ok(SharedLockRow::Writer { owner, expiration });
        }

        let mut raw: HashMap<String, i64> = conn.hgetall(format!("{key}:readers")).await?;
        let limit = raw.remove("__limit__").map(|v| v as usize);
        let now = Utc::now().timestamp_millis();
        let slots: HashMap<String, Option<DateTime<Utc>>> = raw
            .into_iter()
            .filter(|(_, exp)| *exp == 0 || *exp > now)
            .map(|(owner, exp)| (owner, from_epoch_millis(exp)))
            .collect();
        if slots.is_empty() {
            Ok(SharedLockRow::Absent)
        } else {
            let limit = limit.unwrap_or(slots.len()).max(1);
            Ok(SharedLockRow::Readers { limit, slots })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_url() -> Option<String> {
        std::env::var("LATCH_TEST_REDIS_URL").ok()
    }

    // These exercise the real Lua scripts above; they only run when a
    // reachable Redis instance is configured, matching the teacher's own
    // pattern of gating integration tests behind environment-provided
    // infrastructure rather than mocking the wire protocol.
    #[tokio::test]
    async fn add_and_get_round_trip() {
        let Some(url) = test_url() else { return };
        let adapter = RedisAdapter::connect(&url).await.unwrap();
        let key = format!("latch-test:{}", uuid::Uuid::new_v4());
        assert!(adapter.add(&key, "1", None).await.unwrap());
        assert_eq!(adapter.get(&key).await.unwrap(), Some("1".to_string()));
        CacheAdapter::remove(&adapter, &key).await.unwrap();
    }

    #[tokio::test]
    async fn shared_lock_writer_excludes_readers() {
        let Some(url) = test_url() else { return };
        let adapter = RedisAdapter::connect(&url).await.unwrap();
        let key = format!("latch-test:{}", uuid::Uuid::new_v4());
        assert!(adapter.acquire_writer(&key, "w", None).await.unwrap());
        assert!(!adapter.acquire_reader(&key, "r", 2, None).await.unwrap());
        adapter.force_release(&key).await.unwrap();
    }
}
