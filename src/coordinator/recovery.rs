// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Availability recovery.
//!
//! The queue registers itself with the persistent store as its
//! [`StorageProblemListener`]. Losing the store only flips the connection
//! state, since stores report it from inside calls made under the queue lock.
//! Regaining it reconciles both tiers under the lock:
//!
//! 1. Entries the consumers removed from the cache during the outage are
//!    dropped from the persistent store: everything sorting strictly before
//!    the cache head, or everything if the cache is empty.
//! 2. Durable entries that only reached the cache, whether put during the
//!    outage or after a failed write, are written back in queue order as far
//!    as the store's free capacity allows.
//! 3. The queue is connected again and the cache is refilled. Entries a failed
//!    reconciliation left cache-only stay counted and are retried by the next
//!    reload.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::queue_entry::QueueEntry;
use crate::storage::{StorageError, StorageProblemListener, StorageStatus};

use super::{CacheQueue, ConnectionState};

#[async_trait]
impl StorageProblemListener for CacheQueue {
    async fn storage_unavailable(&self, previous: StorageStatus) {
        warn!(queue = %self.queue_id, previous = %previous, "Persistent store unavailable, running from the cache only");
        self.set_state(ConnectionState::Disconnected);
    }

    async fn storage_available(&self, previous: StorageStatus) {
        if previous == StorageStatus::Undefined || self.is_shutdown() {
            return;
        }

        {
            let _guard = self.main_lock.lock().await;
            info!(queue = %self.queue_id, previous = %previous, "Persistent store available, reconciling");

            match self.reconcile().await {
                Ok((removed, persisted)) => {
                    info!(queue = %self.queue_id, removed, persisted, "Reconciled cache with persistent store");
                    crate::metrics::record_recovery(removed, persisted);
                }
                Err(e) => {
                    error!(queue = %self.queue_id, error = %e, "Reconciliation failed");
                    crate::metrics::record_store_error("persistent", "reconcile");
                }
            }

            self.set_state(ConnectionState::Connected);
            self.reload().await;
            self.record_sizes();
        }

        self.notify_size_change();
    }
}

impl CacheQueue {
    /// Returns (entries removed from, entries written to) the persistent store.
    async fn reconcile(&self) -> Result<(u64, usize), StorageError> {
        let removed = match self.transient.peek().await? {
            Some(head) => self.persistent.remove_with_limit_entry(&head, false).await?,
            None => self.persistent.clear().await?,
        };
        let persisted = self.persist_cache_only().await?;
        Ok((removed, persisted))
    }

    /// Write cache-only durable entries to the persistent store in queue
    /// order, as far as its free capacity allows. Returns the number written.
    pub(super) async fn persist_cache_only(&self) -> Result<usize, StorageError> {
        let p = &self.persistent;
        let pending: Vec<QueueEntry> = self.cache_only.lock().values().cloned().collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut free_entries = p.max_entries().saturating_sub(p.num_entries());
        let mut free_bytes = p.max_bytes().saturating_sub(p.num_bytes());
        let mut batch: Vec<QueueEntry> = Vec::new();
        for entry in &pending {
            if free_entries == 0 || entry.size_bytes > free_bytes {
                break;
            }
            free_entries -= 1;
            free_bytes -= entry.size_bytes;
            batch.push(entry.clone());
        }

        let skipped = pending.len() - batch.len();
        if skipped > 0 {
            warn!(
                queue = %self.queue_id,
                skipped,
                "Persistent store full, durable entries remain cache-only"
            );
        }

        if !batch.is_empty() {
            p.put(&batch, true).await?;
            self.untrack_cache_only(&batch);
            debug!(queue = %self.queue_id, persisted = batch.len(), "Persisted cache-only durable entries");
        }
        Ok(batch.len())
    }
}
