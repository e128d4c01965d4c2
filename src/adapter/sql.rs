//! SQLite reference adapter (component C9)
//!
//! Mirrors the teacher's `database::connection_pool::ConnectionPool`: a
//! `sqlx::SqlitePool` built from `SqliteConnectOptions`/`SqlitePoolOptions`,
//! the same WAL/synchronous/cache_size/temp_store pragma tuning, and a
//! background task spawned with `tokio::time::interval` — here it sweeps
//! expired rows instead of pinging `SELECT 1`, since SQLite has no native
//! per-row expiry and every read path re-checks `expiration` itself
//! (`remove_all_expired` exists for adapters exactly like this one).
//!
//! Every multi-step operation runs inside one `sqlx::Transaction` (`BEGIN
//! IMMEDIATE` under the hood via SQLite's locking, see the teacher's
//! `database::transaction` module for the isolation-level vocabulary this
//! follows), which is what lets a single [`CacheAdapter`]/[`LockAdapter`]/
//! [`SharedLockAdapter`] per key-shape satisfy the "load row, decide,
//! write row" contract described in §6.1/§6.2 atomically.

use super::{AdapterLifecycle, CacheAdapter, LockAdapter, LockRow, SharedLockAdapter, SharedLockRow};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Connection and sweeper tuning for [`SqlAdapter`], modeled on the
/// teacher's `DatabaseConfig`.
#[derive(Debug, Clone)]
pub struct SqlAdapterConfig {
    /// `sqlx` connection string, e.g. `sqlite://latch.db` or
    /// `sqlite::memory:`.
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub busy_timeout: Duration,
    pub enable_wal: bool,
    /// How often the background sweeper deletes expired rows.
    pub sweep_interval: Duration,
}

impl Default for SqlAdapterConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://latch.db".to_string(),
            max_connections: 20,
            connect_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_millis(5000),
            enable_wal: true,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

fn to_text(expiration: Option<DateTime<Utc>>) -> Option<String> {
    expiration.map(|dt| dt.to_rfc3339())
}

fn from_text(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc))
}

fn is_live(expiration: &Option<DateTime<Utc>>) -> bool {
    match expiration {
        Some(exp) => *exp > Utc::now(),
        None => true,
    }
}

/// SQLite-backed [`CacheAdapter`]/[`LockAdapter`]/[`SharedLockAdapter`].
pub struct SqlAdapter {
    pool: SqlitePool,
    config: SqlAdapterConfig,
    sweeper: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SqlAdapter {
    /// Open (and create if missing) the SQLite database described by
    /// `config`, applying the same pragma tuning as the teacher's
    /// `ConnectionPool::new`. Does not create the schema or start the
    /// sweeper; call [`AdapterLifecycle::init`] for that.
    pub async fn connect(config: SqlAdapterConfig) -> Result<Self> {
        let is_memory = config.url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| Error::unexpected("connect", e))?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);
        if is_memory {
            // A private in-memory database is per-connection; share it across
            // the pool's connections so every handle sees the same rows.
            connect_options = connect_options.shared_cache(true);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { config.max_connections })
            .acquire_timeout(config.connect_timeout)
            .connect_with(connect_options)
            .await?;

        if config.enable_wal {
            sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        }
        sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await?;
        sqlx::query("PRAGMA cache_size=-64000").execute(&pool).await?;
        sqlx::query("PRAGMA temp_store=MEMORY").execute(&pool).await?;

        Ok(Self {
            pool,
            config,
            sweeper: AsyncMutex::new(None),
        })
    }

    async fn sweep_once(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let mut total = 0u64;
        total += sqlx::query("DELETE FROM cache WHERE expiration IS NOT NULL AND expiration <= ?")
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        total += sqlx::query("DELETE FROM lock WHERE expiration IS NOT NULL AND expiration <= ?")
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        total += sqlx::query("DELETE FROM shared_lock_writer WHERE expiration IS NOT NULL AND expiration <= ?")
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        total += sqlx::query("DELETE FROM shared_lock_reader WHERE expiration IS NOT NULL AND expiration <= ?")
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM shared_lock_reader_limit WHERE key NOT IN (SELECT DISTINCT key FROM shared_lock_reader)")
            .execute(&self.pool)
            .await?;
        Ok(total)
    }
}

#[async_trait]
impl AdapterLifecycle for SqlAdapter {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache (key TEXT PRIMARY KEY, value TEXT NOT NULL, expiration TEXT)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS lock (key TEXT PRIMARY KEY, owner TEXT NOT NULL, expiration TEXT)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS shared_lock_writer (key TEXT PRIMARY KEY, owner TEXT NOT NULL, expiration TEXT)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS shared_lock_reader (key TEXT NOT NULL, owner TEXT NOT NULL, expiration TEXT, PRIMARY KEY (key, owner))",
        )
        .execute(&self.pool)
        .await?;
        // Limit is fixed by the first acquirer for a key (§4.3.1) and lives
        // apart from the per-owner rows above so later acquirers' own
        // `limit` argument can be ignored rather than overwriting it.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS shared_lock_reader_limit (key TEXT PRIMARY KEY, reader_limit INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        let mut guard = self.sweeper.lock().await;
        if guard.is_none() {
            let pool = self.pool.clone();
            let sweep_interval = self.config.sweep_interval;
            *guard = Some(tokio::spawn(async move {
                let mut ticker = interval(sweep_interval);
                loop {
                    ticker.tick().await;
                    let now = Utc::now().to_rfc3339();
                    for table in ["cache", "lock", "shared_lock_writer", "shared_lock_reader"] {
                        let query = format!("DELETE FROM {table} WHERE expiration IS NOT NULL AND expiration <= ?");
                        if let Err(err) = sqlx::query(&query).bind(&now).execute(&pool).await {
                            log::warn!("sweeper failed to prune {table}: {err}");
                        }
                    }
                    if let Err(err) = sqlx::query(
                        "DELETE FROM shared_lock_reader_limit WHERE key NOT IN (SELECT DISTINCT key FROM shared_lock_reader)",
                    )
                    .execute(&pool)
                    .await
                    {
                        log::warn!("sweeper failed to prune shared_lock_reader_limit: {err}");
                    }
                }
            }));
        }
        Ok(())
    }

    async fn de_init(&self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl CacheAdapter for SqlAdapter {
    fn type_tag(&self) -> &'static str {
        "sql-cache"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, expiration FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            let value: String = r.get("value");
            let expiration: Option<String> = r.get("expiration");
            is_live(&from_text(expiration)).then_some(value)
        }))
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT value, expiration FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let value: String = row.get("value");
        let expiration: Option<String> = row.get("expiration");
        if !is_live(&from_text(expiration)) {
            tx.commit().await?;
            return Ok(None);
        }
        sqlx::query("DELETE FROM cache WHERE key = ?").bind(key).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(Some(value))
    }

    async fn add(&self, key: &str, value: &str, ttl: Option<chrono::Duration>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let live = row_is_live_cache(&mut tx, key).await?;
        if live {
            tx.commit().await?;
            return Ok(false);
        }
        let expiration = to_text(ttl.map(|d| Utc::now() + d));
        sqlx::query(
            "INSERT INTO cache(key, value, expiration) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expiration = excluded.expiration",
        )
        .bind(key)
        .bind(value)
        .bind(expiration)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<chrono::Duration>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let replaced = row_is_live_cache(&mut tx, key).await?;
        let expiration = to_text(ttl.map(|d| Utc::now() + d));
        sqlx::query(
            "INSERT INTO cache(key, value, expiration) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expiration = excluded.expiration",
        )
        .bind(key)
        .bind(value)
        .bind(expiration)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(replaced)
    }

    async fn update(&self, key: &str, value: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !row_is_live_cache(&mut tx, key).await? {
            tx.commit().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE cache SET value = ? WHERE key = ?")
            .bind(value)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT value, expiration FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(false);
        };
        let value: String = row.get("value");
        let expiration: Option<String> = row.get("expiration");
        if !is_live(&from_text(expiration)) {
            tx.commit().await?;
            return Ok(false);
        }
        let current: i64 = value.parse().map_err(|_| Error::TypeMismatch(key.to_string()))?;
        sqlx::query("UPDATE cache SET value = ? WHERE key = ?")
            .bind((current + delta).to_string())
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let live = row_is_live_cache(&mut tx, key).await?;
        if live {
            sqlx::query("DELETE FROM cache WHERE key = ?").bind(key).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(live)
    }

    async fn remove_many(&self, keys: &[String]) -> Result<HashMap<String, bool>> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            results.insert(key.clone(), CacheAdapter::remove(self, key).await?);
        }
        Ok(results)
    }

    async fn remove_by_key_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{prefix}%");
        let result = sqlx::query("DELETE FROM cache WHERE key LIKE ?")
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn remove_all_expired(&self) -> Result<u64> {
        self.sweep_once().await
    }
}

/// Drops the reserved reader-limit row once no reader rows remain for
/// `key`, so the next acquirer re-establishes the limit from scratch
/// rather than inheriting one from a shape that no longer exists.
async fn clear_reader_limit_if_empty(tx: &mut Transaction<'_, Sqlite>, key: &str) -> Result<()> {
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shared_lock_reader WHERE key = ?")
        .bind(key)
        .fetch_one(&mut **tx)
        .await?;
    if remaining == 0 {
        sqlx::query("DELETE FROM shared_lock_reader_limit WHERE key = ?").bind(key).execute(&mut **tx).await?;
    }
    Ok(())
}

async fn row_is_live_cache(tx: &mut Transaction<'_, Sqlite>, key: &str) -> Result<bool> {
    let row = sqlx::query("SELECT expiration FROM cache WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|r| is_live(&from_text(r.get("expiration")))).unwrap_or(false))
}

#[async_trait]
impl LockAdapter for SqlAdapter {
    fn type_tag(&self) -> &'static str {
        "sql-lock"
    }

    async fn insert(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT expiration FROM lock WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        let live = row.map(|r| is_live(&from_text(r.get("expiration")))).unwrap_or(false);
        if live {
            tx.commit().await?;
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO lock(key, owner, expiration) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, expiration = excluded.expiration",
        )
        .bind(key)
        .bind(owner)
        .bind(to_text(expiration))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn update(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        self.insert(key, owner, expiration).await
    }

    async fn remove(&self, key: &str, owner: Option<&str>) -> Result<bool> {
        let result = match owner {
            Some(owner) => sqlx::query("DELETE FROM lock WHERE key = ? AND owner = ?")
                .bind(key)
                .bind(owner)
                .execute(&self.pool)
                .await?,
            None => sqlx::query("DELETE FROM lock WHERE key = ?").bind(key).execute(&self.pool).await?,
        };
        Ok(result.rows_affected() > 0)
    }

    async fn refresh(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT owner, expiration FROM lock WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(false);
        };
        let stored_owner: String = row.get("owner");
        let stored_expiration: Option<String> = row.get("expiration");
        if stored_owner != owner || !is_live(&from_text(stored_expiration)) {
            tx.commit().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE lock SET expiration = ? WHERE key = ?")
            .bind(to_text(expiration))
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn find(&self, key: &str) -> Result<Option<LockRow>> {
        let row = sqlx::query("SELECT owner, expiration FROM lock WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            let owner: String = r.get("owner");
            let expiration = from_text(r.get("expiration"));
            is_live(&expiration).then_some(LockRow { owner, expiration })
        }))
    }
}

#[async_trait]
impl SharedLockAdapter for SqlAdapter {
    fn type_tag(&self) -> &'static str {
        "sql-shared-lock"
    }

    async fn acquire_reader(
        &self,
        key: &str,
        owner: &str,
        limit: usize,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let writer = sqlx::query("SELECT expiration FROM shared_lock_writer WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = &writer {
            if is_live(&from_text(row.get("expiration"))) {
                tx.commit().await?;
                return Ok(false);
            }
            sqlx::query("DELETE FROM shared_lock_writer WHERE key = ?").bind(key).execute(&mut *tx).await?;
        }

        sqlx::query(
            "DELETE FROM shared_lock_reader WHERE key = ? AND owner != ? AND expiration IS NOT NULL AND expiration <= ?",
        )
        .bind(key)
        .bind(owner)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        // Establish the limit on first acquisition; every later acquirer's
        // `limit` argument is ignored in favor of the stored value.
        let stored_limit: Option<i64> =
            sqlx::query_scalar("SELECT reader_limit FROM shared_lock_reader_limit WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
        let effective_limit = match stored_limit {
            Some(stored) => stored as usize,
            None => {
                sqlx::query("INSERT INTO shared_lock_reader_limit(key, reader_limit) VALUES (?, ?)")
                    .bind(key)
                    .bind(limit as i64)
                    .execute(&mut *tx)
                    .await?;
                limit
            }
        };

        let already_owned: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM shared_lock_reader WHERE key = ? AND owner = ?")
                .bind(key)
                .bind(owner)
                .fetch_optional(&mut *tx)
                .await?;
        if already_owned.is_none() {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shared_lock_reader WHERE key = ?")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;
            if count as usize >= effective_limit {
                tx.commit().await?;
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO shared_lock_reader(key, owner, expiration) VALUES (?, ?, ?)
             ON CONFLICT(key, owner) DO UPDATE SET expiration = excluded.expiration",
        )
        .bind(key)
        .bind(owner)
        .bind(to_text(expiration))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn acquire_writer(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM shared_lock_reader WHERE key = ? AND expiration IS NOT NULL AND expiration <= ?",
        )
        .bind(key)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        let readers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shared_lock_reader WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        if readers > 0 {
            tx.commit().await?;
            return Ok(false);
        }
        sqlx::query("DELETE FROM shared_lock_reader_limit WHERE key = ?").bind(key).execute(&mut *tx).await?;

        let writer = sqlx::query("SELECT owner, expiration FROM shared_lock_writer WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = &writer {
            let stored_owner: String = row.get("owner");
            if stored_owner != owner && is_live(&from_text(row.get("expiration"))) {
                tx.commit().await?;
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO shared_lock_writer(key, owner, expiration) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, expiration = excluded.expiration",
        )
        .bind(key)
        .bind(owner)
        .bind(to_text(expiration))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn release_reader(&self, key: &str, owner: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM shared_lock_reader WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        clear_reader_limit_if_empty(&mut tx, key).await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_writer(&self, key: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM shared_lock_writer WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn refresh_reader(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let result = sqlx::query("UPDATE shared_lock_reader SET expiration = ? WHERE key = ? AND owner = ?")
            .bind(to_text(expiration))
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn refresh_writer(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let result = sqlx::query("UPDATE shared_lock_writer SET expiration = ? WHERE key = ? AND owner = ?")
            .bind(to_text(expiration))
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn force_release_all_readers(&self, key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM shared_lock_reader WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM shared_lock_reader_limit WHERE key = ?").bind(key).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn force_release_writer(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM shared_lock_writer WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let writer = self.force_release_writer(key).await?;
        let readers = self.force_release_all_readers(key).await?;
        Ok(writer || readers)
    }

    async fn get_state(&self, key: &str) -> Result<SharedLockRow> {
        let writer = sqlx::query("SELECT owner, expiration FROM shared_lock_writer WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = writer {
            let owner: String = row.get("owner");
            let expiration = from_text(row.get("expiration"));
            if is_live(&expiration) {
                return Ok(SharedLockRow::Writer { owner, expiration });
            }
        }

        let rows = sqlx::query("SELECT owner, expiration FROM shared_lock_reader WHERE key = ?")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        let mut slots = HashMap::new();
        for row in rows {
            let owner: String = row.get("owner");
            let expiration = from_text(row.get("expiration"));
            if is_live(&expiration) {
                slots.insert(owner, expiration);
            }
        }
        if slots.is_empty() {
            Ok(SharedLockRow::Absent)
        } else {
            let stored_limit: Option<i64> =
                sqlx::query_scalar("SELECT reader_limit FROM shared_lock_reader_limit WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            let limit = stored_limit.map(|v| v as usize).unwrap_or(slots.len()).max(1);
            Ok(SharedLockRow::Readers { limit, slots })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn adapter() -> SqlAdapter {
        let adapter = SqlAdapter::connect(SqlAdapterConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        AdapterLifecycle::init(&adapter).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let adapter = adapter().await;
        assert!(adapter.add("a", "1", None).await.unwrap());
        assert_eq!(adapter.get("a").await.unwrap(), Some("1".to_string()));
        assert!(!adapter.add("a", "2", None).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expiry_makes_key_absent() {
        let adapter = adapter().await;
        adapter.add("a", "1", Some(chrono::Duration::milliseconds(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(adapter.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lock_insert_and_conditional_remove() {
        let adapter = adapter().await;
        assert!(LockAdapter::insert(&adapter, "k", "a", None).await.unwrap());
        assert!(!LockAdapter::insert(&adapter, "k", "b", None).await.unwrap());
        assert!(!LockAdapter::remove(&adapter, "k", Some("b")).await.unwrap());
        assert!(LockAdapter::remove(&adapter, "k", Some("a")).await.unwrap());
    }

    #[tokio::test]
    async fn shared_lock_reader_limit_enforced() {
        let adapter = adapter().await;
        assert!(adapter.acquire_reader("k", "r1", 1, None).await.unwrap());
        assert!(!adapter.acquire_reader("k", "r2", 1, None).await.unwrap());
        assert!(adapter.release_reader("k", "r1").await.unwrap());
        assert!(adapter.acquire_reader("k", "r2", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn shared_lock_reader_limit_ignores_later_disagreement() {
        let adapter = adapter().await;
        assert!(adapter.acquire_reader("k", "r1", 1, None).await.unwrap());
        // r2 asks for a much larger limit, but the limit fixed by r1 still holds.
        assert!(!adapter.acquire_reader("k", "r2", 100, None).await.unwrap());

        assert!(adapter.release_reader("k", "r1").await.unwrap());
        // Shape is now absent, so the next acquirer re-establishes the limit.
        assert!(adapter.acquire_reader("k", "r2", 2, None).await.unwrap());
        assert!(adapter.acquire_reader("k", "r3", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn sweeper_can_be_started_and_stopped_idempotently() {
        let adapter = adapter().await;
        AdapterLifecycle::init(&adapter).await.unwrap();
        AdapterLifecycle::de_init(&adapter).await.unwrap();
        AdapterLifecycle::de_init(&adapter).await.unwrap();
    }
}
