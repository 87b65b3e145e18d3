// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite queue store, used as the persistent tier.
//!
//! All queues share one table and are told apart by `queue_id`:
//!
//! ```sql
//! CREATE TABLE queue_entries (
//!   queue_id TEXT NOT NULL,
//!   id       INTEGER NOT NULL,   -- EntryId, increasing
//!   priority INTEGER NOT NULL,
//!   durable  INTEGER NOT NULL,   -- 0 for entries swapped out of the cache
//!   size     INTEGER NOT NULL,
//!   payload  BLOB NOT NULL,
//!   PRIMARY KEY (queue_id, id)
//! )
//! ```
//!
//! Queue order is `priority DESC, id ASC`. Entry/byte counters are cached and
//! refreshed with one aggregate query after every mutation, so the synchronous
//! accounting getters never touch the database.
//!
//! Failed queries are counted by a [`StoreHealth`]; crossing its threshold
//! announces `storage_unavailable` to the registered listener. Recovery is
//! announced by [`SqlQueueStore::probe`], typically driven by
//! [`SqlQueueStore::spawn_probe_task`].

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::{
    check_not_overloaded, fits_budget, select_lowest, QueueStore, StorageError, StorageProblemListener,
    StorageStatus, StoreLimits,
};
use crate::queue_entry::{EntryId, QueueEntry};
use crate::resilience::health::{StoreHealth, Transition};
use crate::resilience::retry::{retry, RetryConfig};

const ENTRY_COLUMNS: &str = "id, priority, durable, size, payload";
const QUEUE_ORDER: &str = "ORDER BY priority DESC, id ASC";
const TAIL_ORDER: &str = "ORDER BY priority ASC, id DESC";

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    entries: u64,
    bytes: u64,
    durable_entries: u64,
    durable_bytes: u64,
}

pub struct SqlQueueStore {
    pool: SqlitePool,
    queue_id: RwLock<String>,
    limits: RwLock<StoreLimits>,
    counters: RwLock<Counters>,
    /// Set when a refresh after a committed write failed
    counters_stale: AtomicBool,
    health: StoreHealth,
    listener: RwLock<Option<Weak<dyn StorageProblemListener>>>,
    shutdown: AtomicBool,
}

impl SqlQueueStore {
    /// Connect with startup-mode retry (fails fast if the URL is wrong).
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        Self::connect_with(url, &RetryConfig::startup()).await
    }

    pub async fn connect_with(url: &str, retry_config: &RetryConfig) -> Result<Self, StorageError> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StorageError::InvalidArgument(format!("bad sqlite url '{url}': {e}")))?
            .create_if_missing(true)
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            })
            .synchronous(SqliteSynchronous::Normal);

        // every in-memory connection would be its own database
        let max_connections = if in_memory { 1 } else { 8 };

        let pool = retry("sqlite_connect", retry_config, || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
                    .map_err(|e| StorageError::Unavailable(e.to_string()))
            }
        })
        .await?;

        let store = Self {
            pool,
            queue_id: RwLock::new(String::new()),
            limits: RwLock::new(StoreLimits::UNBOUNDED),
            counters: RwLock::new(Counters::default()),
            counters_stale: AtomicBool::new(false),
            health: StoreHealth::new(),
            listener: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        };
        store.init_schema().await?;
        info!(url = %url, "SQLite queue store connected");
        Ok(store)
    }

    /// Get a clone of the connection pool.
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    #[must_use]
    pub fn status(&self) -> StorageStatus {
        self.health.status()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        retry("sqlite_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS queue_entries (
                    queue_id TEXT NOT NULL,
                    id INTEGER NOT NULL,
                    priority INTEGER NOT NULL,
                    durable INTEGER NOT NULL,
                    size INTEGER NOT NULL,
                    payload BLOB NOT NULL,
                    PRIMARY KEY (queue_id, id)
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_queue_entries_order ON queue_entries (queue_id, priority DESC, id ASC)",
            )
            .execute(&self.pool)
            .await?;
            Ok::<_, sqlx::Error>(())
        })
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to create schema: {e}")))
    }

    /// Ping the database and announce a status change to the listener.
    pub async fn probe(&self) -> StorageStatus {
        let transition = self
            .health
            .check(|| async { sqlx::query("SELECT 1").execute(&self.pool).await.map(|_| ()) })
            .await;

        let queue_id = self.queue_id();
        match transition {
            Some(t) => {
                if t.current == StorageStatus::Available {
                    self.sync_counters(&queue_id).await;
                }
                self.announce(t).await;
            }
            None if self.health.status() == StorageStatus::Available => self.refresh_if_stale(&queue_id).await,
            None => {}
        }
        self.health.status()
    }

    /// Probe every `interval` until the store is shut down.
    pub fn spawn_probe_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                if store.is_shutdown() {
                    break;
                }
                store.probe().await;
            }
        })
    }

    fn queue_id(&self) -> String {
        self.queue_id.read().clone()
    }

    async fn announce(&self, transition: Transition) {
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        let Some(listener) = listener else { return };

        match transition.current {
            StorageStatus::Unavailable => {
                warn!(previous = %transition.previous, "SQLite queue store unavailable");
                listener.storage_unavailable(transition.previous).await;
            }
            StorageStatus::Available => {
                info!(previous = %transition.previous, "SQLite queue store available again");
                listener.storage_available(transition.previous).await;
            }
            StorageStatus::Undefined => {}
        }
    }

    /// Run a query, feeding its outcome into the health tracker.
    async fn guarded<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(StorageError::Shutdown);
        }
        let _timer = crate::metrics::LatencyTimer::new("sqlite", operation);
        match fut.await {
            Ok(value) => {
                self.health.record_success();
                Ok(value)
            }
            Err(e) => {
                debug!(operation, error = %e, "SQLite query failed");
                crate::metrics::record_store_error("sqlite", operation);
                if let Some(t) = self.health.record_failure() {
                    self.announce(t).await;
                }
                Err(StorageError::Backend(e.to_string()))
            }
        }
    }

    async fn refresh_counters(&self, queue_id: &str) -> Result<(), sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS cnt,
                   COALESCE(SUM(size), 0) AS bytes,
                   COALESCE(SUM(CASE WHEN durable = 1 THEN 1 ELSE 0 END), 0) AS durable_cnt,
                   COALESCE(SUM(CASE WHEN durable = 1 THEN size ELSE 0 END), 0) AS durable_bytes
            FROM queue_entries WHERE queue_id = ?
            "#,
        )
        .bind(queue_id)
        .fetch_one(&self.pool)
        .await?;

        let counters = Counters {
            entries: row.try_get::<i64, _>("cnt")? as u64,
            bytes: row.try_get::<i64, _>("bytes")? as u64,
            durable_entries: row.try_get::<i64, _>("durable_cnt")? as u64,
            durable_bytes: row.try_get::<i64, _>("durable_bytes")? as u64,
        };
        *self.counters.write() = counters;
        self.counters_stale.store(false, Ordering::Release);
        Ok(())
    }

    /// Refresh the counters after a committed write. A failure leaves the
    /// write standing and only marks the counters stale.
    async fn sync_counters(&self, queue_id: &str) {
        if let Err(e) = self.refresh_counters(queue_id).await {
            warn!(queue = %queue_id, error = %e, "Counter refresh failed, counters marked stale");
            crate::metrics::record_store_error("sqlite", "refresh_counters");
            self.counters_stale.store(true, Ordering::Release);
        }
    }

    async fn refresh_if_stale(&self, queue_id: &str) {
        if self.counters_stale.load(Ordering::Acquire) {
            self.sync_counters(queue_id).await;
        }
    }

    fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry, sqlx::Error> {
        Ok(QueueEntry::restore(
            EntryId(row.try_get::<i64, _>("id")? as u64),
            row.try_get::<i32, _>("priority")?,
            row.try_get::<bool, _>("durable")?,
            row.try_get::<i64, _>("size")? as u64,
            row.try_get::<Vec<u8>, _>("payload")?,
        ))
    }

    fn budgeted(rows: Vec<SqliteRow>, num_entries: Option<usize>, num_bytes: Option<u64>) -> Result<Vec<QueueEntry>, sqlx::Error> {
        let mut out = Vec::new();
        let mut bytes = 0u64;
        for row in &rows {
            let entry = Self::entry_from_row(row)?;
            if !fits_budget(out.len(), bytes, entry.size_bytes, num_entries, num_bytes) {
                break;
            }
            bytes += entry.size_bytes;
            out.push(entry);
        }
        Ok(out)
    }

    /// SQLite treats a negative LIMIT as unlimited.
    fn sql_limit(num_entries: Option<usize>) -> i64 {
        num_entries.map_or(-1, |n| n as i64)
    }

    async fn select_tail<'e, E>(
        executor: E,
        queue_id: &str,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        limit: Option<&QueueEntry>,
    ) -> Result<Vec<QueueEntry>, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        // only a pure count target can be pushed down into LIMIT
        let fetch = match (num_entries, num_bytes) {
            (Some(n), None) => n as i64,
            _ => -1,
        };
        let rows = match limit {
            Some(l) => {
                sqlx::query(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE queue_id = ? \
                     AND (priority < ? OR (priority = ? AND id > ?)) {TAIL_ORDER} LIMIT ?"
                ))
                .bind(queue_id)
                .bind(l.priority)
                .bind(l.priority)
                .bind(l.id.as_u64() as i64)
                .bind(fetch)
                .fetch_all(executor)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE queue_id = ? {TAIL_ORDER} LIMIT ?"
                ))
                .bind(queue_id)
                .bind(fetch)
                .fetch_all(executor)
                .await?
            }
        };
        rows.iter().map(Self::entry_from_row).collect()
    }
}

#[async_trait]
impl QueueStore for SqlQueueStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn init(&self, queue_id: &str, limits: StoreLimits) -> Result<(), StorageError> {
        *self.queue_id.write() = queue_id.to_string();
        *self.limits.write() = limits;
        self.shutdown.store(false, Ordering::Release);

        match self.refresh_counters(queue_id).await {
            Ok(()) => {
                self.health.mark_available();
                let counters = *self.counters.read();
                info!(
                    queue = %queue_id,
                    entries = counters.entries,
                    durable = counters.durable_entries,
                    "SQLite queue store initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.health.mark_unavailable();
                Err(StorageError::Unavailable(e.to_string()))
            }
        }
    }

    fn set_limits(&self, limits: StoreLimits) {
        *self.limits.write() = limits;
    }

    async fn put(&self, entries: &[QueueEntry], _ignore_put_interceptor: bool) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let queue_id = self.queue_id();
        self.refresh_if_stale(&queue_id).await;
        let counters = *self.counters.read();
        check_not_overloaded(&queue_id, counters.entries, counters.bytes, *self.limits.read())?;

        self.guarded("put", async {
            let mut tx = self.pool.begin().await?;
            for entry in entries {
                sqlx::query(
                    "INSERT OR IGNORE INTO queue_entries (queue_id, id, priority, durable, size, payload) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&queue_id)
                .bind(entry.id.as_u64() as i64)
                .bind(entry.priority)
                .bind(entry.durable)
                .bind(entry.size_bytes as i64)
                .bind(&entry.payload)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;
        self.sync_counters(&queue_id).await;
        Ok(())
    }

    async fn peek_entries(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let queue_id = self.queue_id();
        self.guarded("peek", async {
            let rows = sqlx::query(&format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE queue_id = ? {QUEUE_ORDER} LIMIT ?"
            ))
            .bind(&queue_id)
            .bind(Self::sql_limit(num_entries))
            .fetch_all(&self.pool)
            .await?;
            Self::budgeted(rows, num_entries, num_bytes)
        })
        .await
    }

    async fn peek_with_priority(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let queue_id = self.queue_id();
        // ordered by priority, so "stop at the first entry below min" is a range filter
        self.guarded("peek_with_priority", async {
            let rows = sqlx::query(&format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE queue_id = ? \
                 AND priority >= ? AND priority <= ? {QUEUE_ORDER} LIMIT ?"
            ))
            .bind(&queue_id)
            .bind(min_priority)
            .bind(max_priority)
            .bind(Self::sql_limit(num_entries))
            .fetch_all(&self.pool)
            .await?;
            Self::budgeted(rows, num_entries, num_bytes)
        })
        .await
    }

    async fn peek_with_limit_entry(&self, limit: &QueueEntry) -> Result<Vec<QueueEntry>, StorageError> {
        let queue_id = self.queue_id();
        self.guarded("peek_with_limit_entry", async {
            let rows = sqlx::query(&format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE queue_id = ? \
                 AND (priority > ? OR (priority = ? AND id < ?)) {QUEUE_ORDER}"
            ))
            .bind(&queue_id)
            .bind(limit.priority)
            .bind(limit.priority)
            .bind(limit.id.as_u64() as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(Self::entry_from_row).collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    async fn peek_start_at(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        after: &QueueEntry,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let queue_id = self.queue_id();
        self.guarded("peek_start_at", async {
            let rows = sqlx::query(&format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE queue_id = ? \
                 AND (priority < ? OR (priority = ? AND id > ?)) {QUEUE_ORDER} LIMIT ?"
            ))
            .bind(&queue_id)
            .bind(after.priority)
            .bind(after.priority)
            .bind(after.id.as_u64() as i64)
            .bind(Self::sql_limit(num_entries))
            .fetch_all(&self.pool)
            .await?;
            Self::budgeted(rows, num_entries, num_bytes)
        })
        .await
    }

    async fn peek_lowest(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        limit: Option<&QueueEntry>,
        leave_one: bool,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let queue_id = self.queue_id();
        self.refresh_if_stale(&queue_id).await;
        let total = self.num_entries() as usize;
        self.guarded("peek_lowest", async {
            let tail = Self::select_tail(&self.pool, &queue_id, num_entries, num_bytes, limit).await?;
            Ok::<_, sqlx::Error>(select_lowest(tail.iter(), total, num_entries, num_bytes, limit, leave_one))
        })
        .await
    }

    async fn take_lowest(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        limit: Option<&QueueEntry>,
        leave_one: bool,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let queue_id = self.queue_id();
        self.refresh_if_stale(&queue_id).await;
        let total = self.num_entries() as usize;
        let picked = self.guarded("take_lowest", async {
            let mut tx = self.pool.begin().await?;
            let tail = Self::select_tail(&mut *tx, &queue_id, num_entries, num_bytes, limit).await?;
            let picked = select_lowest(tail.iter(), total, num_entries, num_bytes, limit, leave_one);
            for entry in &picked {
                sqlx::query("DELETE FROM queue_entries WHERE queue_id = ? AND id = ?")
                    .bind(&queue_id)
                    .bind(entry.id.as_u64() as i64)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(picked)
        })
        .await?;
        self.sync_counters(&queue_id).await;
        Ok(picked)
    }

    async fn remove_random(&self, entries: &[QueueEntry]) -> Result<Vec<bool>, StorageError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let queue_id = self.queue_id();
        let removed = self.guarded("remove_random", async {
            let mut tx = self.pool.begin().await?;
            let mut removed = Vec::with_capacity(entries.len());
            for entry in entries {
                let result = sqlx::query("DELETE FROM queue_entries WHERE queue_id = ? AND id = ?")
                    .bind(&queue_id)
                    .bind(entry.id.as_u64() as i64)
                    .execute(&mut *tx)
                    .await?;
                removed.push(result.rows_affected() > 0);
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(removed)
        })
        .await?;
        self.sync_counters(&queue_id).await;
        Ok(removed)
    }

    async fn remove_with_limit_entry(&self, limit: &QueueEntry, inclusive: bool) -> Result<u64, StorageError> {
        let queue_id = self.queue_id();
        let id_cmp = if inclusive { "<=" } else { "<" };
        let removed = self.guarded("remove_with_limit_entry", async {
            let result = sqlx::query(&format!(
                "DELETE FROM queue_entries WHERE queue_id = ? \
                 AND (priority > ? OR (priority = ? AND id {id_cmp} ?))"
            ))
            .bind(&queue_id)
            .bind(limit.priority)
            .bind(limit.priority)
            .bind(limit.id.as_u64() as i64)
            .execute(&self.pool)
            .await?;
            Ok::<_, sqlx::Error>(result.rows_affected())
        })
        .await?;
        self.sync_counters(&queue_id).await;
        Ok(removed)
    }

    async fn remove_transient(&self) -> Result<u64, StorageError> {
        let queue_id = self.queue_id();
        let removed = self.guarded("remove_transient", async {
            let result = sqlx::query("DELETE FROM queue_entries WHERE queue_id = ? AND durable = 0")
                .bind(&queue_id)
                .execute(&self.pool)
                .await?;
            Ok::<_, sqlx::Error>(result.rows_affected())
        })
        .await?;
        self.sync_counters(&queue_id).await;
        Ok(removed)
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let queue_id = self.queue_id();
        let removed = self.guarded("clear", async {
            let result = sqlx::query("DELETE FROM queue_entries WHERE queue_id = ?")
                .bind(&queue_id)
                .execute(&self.pool)
                .await?;
            Ok::<_, sqlx::Error>(result.rows_affected())
        })
        .await?;
        self.sync_counters(&queue_id).await;
        Ok(removed)
    }

    fn num_entries(&self) -> u64 {
        self.counters.read().entries
    }

    fn num_durable_entries(&self) -> u64 {
        self.counters.read().durable_entries
    }

    fn num_bytes(&self) -> u64 {
        self.counters.read().bytes
    }

    fn num_durable_bytes(&self) -> u64 {
        self.counters.read().durable_bytes
    }

    fn max_entries(&self) -> u64 {
        self.limits.read().max_entries
    }

    fn max_bytes(&self) -> u64 {
        self.limits.read().max_bytes
    }

    fn register_storage_problem_listener(&self, listener: Weak<dyn StorageProblemListener>) -> bool {
        let mut slot = self.listener.write();
        if slot.as_ref().is_some_and(|l| l.strong_count() > 0) {
            return false;
        }
        *slot = Some(listener);
        true
    }

    fn unregister_storage_problem_listener(&self) -> bool {
        self.listener.write().take().is_some()
    }

    async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
        info!(queue = %self.queue_id(), "SQLite queue store closed");
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir, queue_id: &str) -> SqlQueueStore {
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let store = SqlQueueStore::connect_with(&url, &RetryConfig::test()).await.unwrap();
        store.init(queue_id, StoreLimits::UNBOUNDED).await.unwrap();
        store
    }

    fn entry(priority: i32, durable: bool, payload: &[u8]) -> QueueEntry {
        QueueEntry::new(priority, durable, payload.to_vec())
    }

    #[tokio::test]
    async fn test_put_peek_in_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "orders").await;

        let low = entry(1, true, b"low");
        let high = entry(9, false, b"high");
        let mid = entry(5, true, b"mid");
        store.put(&[low.clone(), high.clone(), mid.clone()], false).await.unwrap();

        let peeked = store.peek_entries(None, None).await.unwrap();
        assert_eq!(peeked, vec![high.clone(), mid.clone(), low.clone()]);
        assert_eq!(store.num_entries(), 3);
        assert_eq!(store.num_durable_entries(), 2);
        assert_eq!(store.num_bytes(), 10);
        assert_eq!(store.num_durable_bytes(), 6);
    }

    #[tokio::test]
    async fn test_duplicates_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "dups").await;
        let e = entry(5, true, b"once");

        store.put(&[e.clone()], false).await.unwrap();
        store.put(&[e], false).await.unwrap();
        assert_eq!(store.num_entries(), 1);
    }

    #[tokio::test]
    async fn test_byte_budget_and_priority_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "budget").await;
        store
            .put(
                &[
                    entry(9, true, &[0; 100]),
                    entry(7, true, &[0; 10]),
                    entry(5, true, &[0; 10]),
                    entry(3, true, &[0; 10]),
                ],
                false,
            )
            .await
            .unwrap();

        assert_eq!(store.peek_entries(None, Some(5)).await.unwrap().len(), 1);
        assert_eq!(store.peek_entries(Some(2), None).await.unwrap().len(), 2);

        let window = store.peek_with_priority(None, None, 5, 7).await.unwrap();
        assert_eq!(window.iter().map(|e| e.priority).collect::<Vec<_>>(), vec![7, 5]);
    }

    #[tokio::test]
    async fn test_limit_entry_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "limits").await;
        let all: Vec<_> = (0..4).map(|i| entry(5, true, &[i])).collect();
        store.put(&all, false).await.unwrap();

        assert_eq!(store.peek_with_limit_entry(&all[2]).await.unwrap(), all[..2].to_vec());
        assert_eq!(store.peek_start_at(None, None, &all[1]).await.unwrap(), all[2..].to_vec());
        assert_eq!(store.remove_with_limit_entry(&all[1], false).await.unwrap(), 1);
        assert_eq!(store.remove_with_limit_entry(&all[2], true).await.unwrap(), 2);
        assert_eq!(store.peek().await.unwrap(), Some(all[3].clone()));
    }

    #[tokio::test]
    async fn test_take_lowest_and_remove_transient() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "take").await;
        let head = entry(9, true, b"a");
        let swapped = entry(5, false, b"bb");
        let tail = entry(1, false, b"ccc");
        store.put(&[head.clone(), swapped.clone(), tail.clone()], false).await.unwrap();

        let taken = store.take_lowest(Some(1), None, None, false).await.unwrap();
        assert_eq!(taken, vec![tail]);
        assert_eq!(store.num_entries(), 2);

        assert_eq!(store.remove_transient().await.unwrap(), 1);
        assert_eq!(store.peek_entries(None, None).await.unwrap(), vec![head.clone()]);

        let kept = store.take_lowest(None, None, None, true).await.unwrap();
        assert!(kept.is_empty());
        assert_eq!(store.num_entries(), 1);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let durable = entry(5, true, b"persisted");
        {
            let store = open_store(&dir, "reopen").await;
            store.put(&[durable.clone()], false).await.unwrap();
            store.shutdown().await;
            assert!(store.is_shutdown());
        }

        let store = open_store(&dir, "reopen").await;
        assert_eq!(store.peek().await.unwrap(), Some(durable));

        // queues sharing the file do not see each other
        let other = open_store(&dir, "other").await;
        assert_eq!(other.num_entries(), 0);
    }

    #[tokio::test]
    async fn test_overflow_when_beyond_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "full").await;
        store.set_limits(StoreLimits::new(1, u64::MAX));

        store.put(&[entry(5, true, b"a"), entry(5, true, b"b")], false).await.unwrap();
        let err = store.put(&[entry(5, true, b"c")], false).await.unwrap_err();
        assert!(matches!(err, StorageError::Overflow { .. }));
    }

    struct CountingListener {
        unavailable: AtomicUsize,
        available: AtomicUsize,
    }

    #[async_trait]
    impl StorageProblemListener for CountingListener {
        async fn storage_unavailable(&self, _previous: StorageStatus) {
            self.unavailable.fetch_add(1, Ordering::SeqCst);
        }

        async fn storage_available(&self, _previous: StorageStatus) {
            self.available.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_listener_slot_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "probe").await;
        let listener = Arc::new(CountingListener {
            unavailable: AtomicUsize::new(0),
            available: AtomicUsize::new(0),
        });
        let weak: Weak<dyn StorageProblemListener> = Arc::downgrade(&listener) as Weak<dyn StorageProblemListener>;

        assert!(store.register_storage_problem_listener(weak.clone()));
        assert!(!store.register_storage_problem_listener(weak));

        // healthy and already available: nothing to announce
        assert_eq!(store.probe().await, StorageStatus::Available);
        assert_eq!(listener.available.load(Ordering::SeqCst), 0);

        assert!(store.unregister_storage_problem_listener());
        assert!(!store.unregister_storage_problem_listener());
    }

    #[tokio::test]
    async fn test_failed_counter_refresh_marks_stale_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "stale").await;
        store.put(&[entry(5, true, b"first")], false).await.unwrap();

        sqlx::query("ALTER TABLE queue_entries RENAME TO queue_entries_moved")
            .execute(&store.pool())
            .await
            .unwrap();
        store.sync_counters("stale").await;
        assert!(store.counters_stale.load(Ordering::Acquire));
        assert_eq!(store.num_entries(), 1);
        assert_eq!(store.status(), StorageStatus::Available);

        sqlx::query("ALTER TABLE queue_entries_moved RENAME TO queue_entries")
            .execute(&store.pool())
            .await
            .unwrap();
        // a row written behind the store's back is picked up by the next refresh
        sqlx::query("INSERT INTO queue_entries (queue_id, id, priority, durable, size, payload) VALUES ('stale', 999999, 1, 1, 4, x'00000000')")
            .execute(&store.pool())
            .await
            .unwrap();

        store.put(&[entry(3, true, b"second")], false).await.unwrap();
        assert!(!store.counters_stale.load(Ordering::Acquire));
        assert_eq!(store.num_entries(), 3);
        assert_eq!(store.num_durable_bytes(), 5 + 4 + 6);
    }
}
