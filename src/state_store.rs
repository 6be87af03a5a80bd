// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable cluster state: the small key/value record a node uses to recover
//! its role after a restart.
//!
//! # Write-Through
//!
//! Unlike a cache with debounced flushes, every `set()` is on disk before it
//! returns. The in-memory cache is only updated once SQLite accepted the
//! write, so a read never observes a value a crash could take back.
//!
//! # Key-Level Serialization
//!
//! Concurrent writers of the *same* key are serialized by a per-key async
//! mutex; writers of different keys proceed independently. There is no
//! multi-key atomicity. [`ClusterStateStore::commit_role`] orders its writes
//! so the role is always written last: a crash in between leaves the old
//! role next to a newer stripe id, which is conservative.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff before
//! the error is surfaced.
//!
//! # Keys
//!
//! | Key | Value |
//! |-----|-------|
//! | `l2state` | last committed role (`PASSIVE`, `ACTIVE`, ...) |
//! | `groupid` | replication group id |
//! | `stripeid` | this node's stripe id |
//! | `stripeid-for-<group>` | stripe id of a known peer group |
//! | `maxdatastoragesize` | storage cap in bytes |
//! | `version` | schema version `major.minor.micro` |
//! | `dbclean` | `true` after a graceful shutdown; absent means clean |

use crate::config::StateStoreConfig;
use crate::error::{BoxFuture, CoordinatorError, Result};
use crate::types::{GroupId, Role, SchemaVersion, StripeId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const KEY_ROLE: &str = "l2state";
pub const KEY_GROUP_ID: &str = "groupid";
pub const KEY_STRIPE_ID: &str = "stripeid";
pub const KEY_STRIPE_ID_FOR_PREFIX: &str = "stripeid-for-";
pub const KEY_MAX_DATA_STORAGE_SIZE: &str = "maxdatastoragesize";
pub const KEY_VERSION: &str = "version";
pub const KEY_CLEAN: &str = "dbclean";

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::state_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable key/value substrate behind the cluster state record.
///
/// `set` and `clear` must be durable when their future resolves.
pub trait StateBackend: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, ()>;

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;

    /// Remove every key.
    fn clear(&self) -> BoxFuture<'_, ()>;

    /// Checkpoint and release resources. Later calls may fail.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Per-key async locks; writers of one key queue, other keys pass.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite backend
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite-backed state, cached in memory and written through.
pub struct SqliteStateBackend {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, String>>,
    key_locks: KeyLocks,
    path: String,
}

impl SqliteStateBackend {
    /// Open (creating if needed) the database and load every key.
    ///
    /// Failure here is fatal to node startup.
    pub async fn open(config: &StateStoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Opening cluster state store");

        let (options, pool_options) = if config.is_in_memory() {
            // A single long-lived connection; every new connection would be a fresh database.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| CoordinatorError::Config(format!("Invalid SQLite path: {}", e)))?;
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true)
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Full);
            (options, SqlitePoolOptions::new().max_connections(2))
        };

        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM cluster_state")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (key, value) in rows {
            debug!(key = %key, value = %value, "Loaded cluster state from disk");
            cache.insert(key, value);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cluster state from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            key_locks: KeyLocks::default(),
            path,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        let lock = self.key_locks.lock_for(key);
        let _guard = lock.lock().await;

        let now = chrono::Utc::now().timestamp();
        let result = execute_with_retry("set", || async {
            sqlx::query(
                r#"
                INSERT INTO cluster_state (key, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(&self.pool)
            .await
        })
        .await;

        crate::metrics::record_state_store_write(key, result.is_ok());
        result?;

        self.cache.write().await.insert(key.to_string(), value.to_string());
        debug!(key, value, "Cluster state written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let lock = self.key_locks.lock_for(key);
        let _guard = lock.lock().await;

        execute_with_retry("remove", || async {
            sqlx::query("DELETE FROM cluster_state WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
        })
        .await?;
        self.cache.write().await.remove(key);
        debug!(key, "Cluster state key removed");
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        execute_with_retry("clear", || async {
            sqlx::query("DELETE FROM cluster_state").execute(&self.pool).await
        })
        .await?;
        self.cache.write().await.clear();
        info!(path = %self.path, "Cluster state cleared");
        Ok(())
    }

    async fn checkpoint_and_close(&self) -> Result<()> {
        info!(path = %self.path, "Closing cluster state store");
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool).await {
            warn!(error = %e, "WAL checkpoint on close failed");
        }
        self.pool.close().await;
        Ok(())
    }
}

impl StateBackend for SqliteStateBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.cache.read().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.write(key, value))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.delete(key))
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.clear_all())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.checkpoint_and_close())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Volatile backend for tests. Writes can be made to fail on demand.
#[derive(Default)]
pub struct MemoryStateBackend {
    values: RwLock<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without going through the write path.
    pub async fn seed(&self, key: &str, value: &str) {
        self.values.write().await.insert(key.to_string(), value.to_string());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().await.clone()
    }
}

impl StateBackend for MemoryStateBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.values.read().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CoordinatorError::Internal(format!("injected write failure for '{}'", key)));
            }
            self.values.write().await.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CoordinatorError::Internal(format!("injected write failure for '{}'", key)));
            }
            self.values.write().await.remove(key);
            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.values.write().await.clear();
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Typed record
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of the persisted facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStateRecord {
    /// Absent on a fresh store.
    pub role: Option<Role>,
    pub group_id: GroupId,
    pub stripe_id: StripeId,
    pub max_data_storage_size: Option<u64>,
    pub version: Option<SchemaVersion>,
    pub clean_shutdown: bool,
}

/// Typed view over a [`StateBackend`].
#[derive(Clone)]
pub struct ClusterStateStore {
    backend: Arc<dyn StateBackend>,
    initial_role: Option<Role>,
}

impl ClusterStateStore {
    /// Open the SQLite store named by `config`.
    pub async fn open(config: &StateStoreConfig) -> Result<Self> {
        let backend = SqliteStateBackend::open(config).await?;
        Self::with_backend(Arc::new(backend)).await
    }

    /// Wrap an existing backend, capturing the role it holds right now.
    pub async fn with_backend(backend: Arc<dyn StateBackend>) -> Result<Self> {
        let initial_role = parse_role(backend.get(KEY_ROLE).await?)?;
        Ok(Self { backend, initial_role })
    }

    /// Role persisted when the store was opened.
    pub fn initial_role(&self) -> Option<Role> {
        self.initial_role
    }

    pub async fn record(&self) -> Result<ClusterStateRecord> {
        Ok(ClusterStateRecord {
            role: self.current_role().await?,
            group_id: self.group_id().await?,
            stripe_id: self.stripe_id().await?,
            max_data_storage_size: self.max_data_storage_size().await?,
            version: self.version().await?,
            clean_shutdown: self.is_clean_shutdown().await?,
        })
    }

    pub async fn current_role(&self) -> Result<Option<Role>> {
        parse_role(self.backend.get(KEY_ROLE).await?)
    }

    pub async fn group_id(&self) -> Result<GroupId> {
        match self.backend.get(KEY_GROUP_ID).await? {
            None => Ok(GroupId::NULL),
            Some(raw) => raw
                .parse::<i32>()
                .map(GroupId)
                .map_err(|_| CoordinatorError::StateCorrupt(format!("{} = '{}'", KEY_GROUP_ID, raw))),
        }
    }

    pub async fn set_group_id(&self, group: GroupId) -> Result<()> {
        self.backend.set(KEY_GROUP_ID, &group.0.to_string()).await
    }

    pub async fn stripe_id(&self) -> Result<StripeId> {
        Ok(self.backend.get(KEY_STRIPE_ID).await?.map(StripeId::new).unwrap_or_default())
    }

    pub async fn set_stripe_id(&self, stripe: &StripeId) -> Result<()> {
        self.backend.set(KEY_STRIPE_ID, stripe.as_str()).await
    }

    /// Stripe id last seen for a peer group.
    pub async fn stripe_id_for(&self, group: GroupId) -> Result<StripeId> {
        let key = format!("{}{}", KEY_STRIPE_ID_FOR_PREFIX, group.0);
        Ok(self.backend.get(&key).await?.map(StripeId::new).unwrap_or_default())
    }

    pub async fn set_stripe_id_for(&self, group: GroupId, stripe: &StripeId) -> Result<()> {
        let key = format!("{}{}", KEY_STRIPE_ID_FOR_PREFIX, group.0);
        self.backend.set(&key, stripe.as_str()).await
    }

    pub async fn max_data_storage_size(&self) -> Result<Option<u64>> {
        match self.backend.get(KEY_MAX_DATA_STORAGE_SIZE).await? {
            None => Ok(None),
            Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| {
                CoordinatorError::StateCorrupt(format!("{} = '{}'", KEY_MAX_DATA_STORAGE_SIZE, raw))
            }),
        }
    }

    pub async fn set_max_data_storage_size(&self, bytes: u64) -> Result<()> {
        self.backend.set(KEY_MAX_DATA_STORAGE_SIZE, &bytes.to_string()).await
    }

    pub async fn version(&self) -> Result<Option<SchemaVersion>> {
        match self.backend.get(KEY_VERSION).await? {
            None => Ok(None),
            Some(raw) => raw
                .parse::<SchemaVersion>()
                .map(Some)
                .map_err(|_| CoordinatorError::StateCorrupt(format!("{} = '{}'", KEY_VERSION, raw))),
        }
    }

    /// Refuse state written by a newer major version, then stamp ours.
    pub async fn check_and_stamp_version(&self) -> Result<()> {
        let current = SchemaVersion::current();
        if let Some(persisted) = self.version().await? {
            if persisted.major > current.major {
                return Err(CoordinatorError::StateCorrupt(format!(
                    "state written by version {} cannot be read by {}",
                    persisted, current
                )));
            }
            if persisted != current {
                info!(from = %persisted, to = %current, "Upgrading cluster state version");
            }
        }
        self.backend.set(KEY_VERSION, &current.to_string()).await
    }

    /// Absent means clean.
    pub async fn is_clean_shutdown(&self) -> Result<bool> {
        match self.backend.get(KEY_CLEAN).await?.as_deref() {
            None | Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(CoordinatorError::StateCorrupt(format!("{} = '{}'", KEY_CLEAN, other))),
        }
    }

    pub async fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.backend.set(KEY_CLEAN, if clean { "true" } else { "false" }).await
    }

    /// Persist a committed role. The stripe id goes first, the role last.
    ///
    /// STOPPED is never persisted; the previous role stays on disk.
    pub async fn commit_role(&self, role: Role, stripe: &StripeId) -> Result<()> {
        if role == Role::Stopped {
            return Ok(());
        }
        self.set_stripe_id(stripe).await?;
        self.backend.set(KEY_ROLE, role.as_str()).await
    }

    /// Put back a role read earlier with [`current_role`](Self::current_role).
    pub async fn rollback_role(&self, role: Option<Role>) -> Result<()> {
        match role {
            Some(role) => self.backend.set(KEY_ROLE, role.as_str()).await,
            None => self.backend.remove(KEY_ROLE).await,
        }
    }

    /// Forget everything.
    pub async fn reset(&self) -> Result<()> {
        warn!("Resetting cluster state");
        self.backend.clear().await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

fn parse_role(raw: Option<String>) -> Result<Option<Role>> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse::<Role>()
            .map(Some)
            .map_err(|_| CoordinatorError::StateCorrupt(format!("{} = '{}'", KEY_ROLE, raw))),
    }
}
