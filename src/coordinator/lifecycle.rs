//! Queue lifecycle: open, reconfigure, shutdown.

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::config::CacheQueueConfig;
use crate::storage::{MemoryQueueStore, QueueStore, SqlQueueStore, StorageError, StorageProblemListener};

use super::{CacheQueue, ConnectionState};

impl CacheQueue {
    /// Open a queue over the given stores.
    ///
    /// Startup sequence:
    /// 1. Initialize the cache with the (clamped) cache limits
    /// 2. Initialize the persistent store; if that fails the queue starts
    ///    disconnected and runs from memory only
    /// 3. Register as the persistent store's availability listener
    /// 4. Drop swapped leftovers of a previous run from the persistent store
    ///    and reload its durable entries into the cache
    #[tracing::instrument(skip(config, transient, persistent))]
    pub async fn open(
        queue_id: &str,
        config: &CacheQueueConfig,
        transient: Arc<dyn QueueStore>,
        persistent: Arc<dyn QueueStore>,
    ) -> Result<Arc<Self>, StorageError> {
        transient.init(queue_id, config.cache_limits()).await?;

        let initial = match persistent.init(queue_id, config.persistent_limits()).await {
            Ok(()) => ConnectionState::Connected,
            Err(e) => {
                warn!(queue = %queue_id, error = %e, "Persistent store failed to initialize, starting from memory only");
                ConnectionState::Disconnected
            }
        };

        let queue = Arc::new(Self::new(queue_id, transient, persistent, initial));
        crate::metrics::record_connection_change(initial.as_str());

        let listener: Weak<dyn StorageProblemListener> = Arc::downgrade(&queue) as Weak<dyn StorageProblemListener>;
        if !queue.persistent.register_storage_problem_listener(listener) {
            debug!(queue = %queue_id, store = queue.persistent.name(), "Persistent store does not report availability");
        }

        if queue.is_connected() {
            let _guard = queue.main_lock.lock().await;
            match queue.persistent.remove_transient().await {
                Ok(0) => {}
                Ok(n) => info!(queue = %queue_id, removed = n, "Dropped swapped entries left by a previous run"),
                Err(e) => queue.persistent_failed("startup", &e),
            }
            queue.reload().await;
            queue.record_sizes();
        }

        info!(
            queue = %queue_id,
            state = %queue.connection_state(),
            cache = queue.transient.name(),
            persistent = queue.persistent.name(),
            entries = queue.totals().0,
            "Cache queue opened"
        );
        Ok(queue)
    }

    /// Open a queue with a memory cache over the SQLite store named by
    /// `config.sql_url`, and start its health probe if configured.
    pub async fn open_sqlite(queue_id: &str, config: &CacheQueueConfig) -> Result<Arc<Self>, StorageError> {
        let url = config
            .sql_url
            .as_deref()
            .ok_or_else(|| StorageError::InvalidArgument("sql_url is not configured".to_string()))?;

        let persistent = Arc::new(SqlQueueStore::connect_with(url, &config.persistent_retry.config()).await?);
        let queue = Self::open(queue_id, config, Arc::new(MemoryQueueStore::new()), persistent.clone()).await?;

        if let Some(interval) = config.probe_interval() {
            *queue.probe_task.lock() = Some(persistent.spawn_probe_task(interval));
        }
        Ok(queue)
    }

    /// Apply new limits to both stores and refill the cache if it grew.
    pub async fn reconfigure(&self, config: &CacheQueueConfig) -> Result<(), StorageError> {
        self.ensure_open()?;
        {
            let _guard = self.main_lock.lock().await;
            self.transient.set_limits(config.cache_limits());
            self.persistent.set_limits(config.persistent_limits());
            info!(
                queue = %self.queue_id,
                max_entries = config.max_entries,
                max_bytes = config.max_bytes,
                max_entries_cache = config.cache_limits().max_entries,
                max_bytes_cache = config.cache_limits().max_bytes,
                "Queue reconfigured"
            );
            self.reload().await;
            self.record_sizes();
        }
        self.notify_size_change();
        Ok(())
    }

    /// Shut the queue down. Idempotent.
    ///
    /// Entries that only live in memory are lost; the count is logged.
    #[tracing::instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }

        let _guard = self.main_lock.lock().await;

        let (entries, _) = self.totals();
        let (durable, _) = self.durable_totals();
        let lost = entries.saturating_sub(durable);
        if lost > 0 {
            warn!(lost, "Shutting down with transient entries, they will be lost");
        }
        let (unpersisted, _) = self.cache_only_totals();
        if unpersisted > 0 {
            warn!(unpersisted, "Shutting down with durable entries the persistent store never received");
        }

        if let Some(task) = self.probe_task.lock().take() {
            task.abort();
        }

        self.transient.shutdown().await;
        self.persistent.shutdown().await;
        self.persistent.unregister_storage_problem_listener();
        self.size_listeners.write().clear();

        info!("Cache queue shut down");
    }
}
