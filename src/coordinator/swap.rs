// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relocation between the tiers: swap out on cache overflow, reload into free
//! cache room.
//!
//! Both run with the main lock held and only while connected. Failures are
//! logged and never reach the caller of the put or remove that triggered them.

use tracing::{debug, error, warn};

use crate::queue_entry::{total_bytes, QueueEntry};

use super::CacheQueue;

impl CacheQueue {
    /// Swap the lowest cache entries out after `batch` was appended, if the
    /// cache is over capacity and the persistent store is the larger one.
    pub(super) async fn swap_if_needed(&self, batch: &[QueueEntry], cache_was_empty: bool) {
        let t = &self.transient;
        let p = &self.persistent;

        let overflowing = t.num_entries() > t.max_entries() || t.num_bytes() > t.max_bytes();
        let persistent_larger = p.max_entries() > t.max_entries() || p.max_bytes() > t.max_bytes();
        if !overflowing || !persistent_larger {
            return;
        }

        let _timer = crate::time_operation!("queue", "swap");
        {
            let _peek = self.peek_lock.write().await;

            // a cache that was empty only sheds its overflow; otherwise make
            // room for the whole batch and refill from the tail of the cache
            let (num_entries, num_bytes) = if cache_was_empty {
                (
                    t.num_entries().saturating_sub(t.max_entries()),
                    t.num_bytes().saturating_sub(t.max_bytes()),
                )
            } else {
                (batch.len() as u64, total_bytes(batch))
            };

            let evicted = match t.take_lowest(Some(num_entries as usize), Some(num_bytes), None, true).await {
                Ok(evicted) => evicted,
                Err(e) => {
                    error!(queue = %self.queue_id, error = %e, "Swap could not take entries from the cache");
                    crate::metrics::record_store_error("transient", "swap");
                    return;
                }
            };
            if evicted.is_empty() {
                return;
            }

            // durable entries are already in the persistent store unless cache-only
            let to_write: Vec<QueueEntry> = {
                let pending = self.cache_only.lock();
                evicted
                    .iter()
                    .filter(|e| !e.durable || pending.contains_key(&e.key()))
                    .cloned()
                    .collect()
            };
            if !to_write.is_empty() {
                if let Err(e) = p.put(&to_write, true).await {
                    self.persistent_failed("swap", &e);
                    if let Err(e) = t.put(&evicted, true).await {
                        error!(
                            queue = %self.queue_id,
                            entries = evicted.len(),
                            error = %e,
                            "Could not restore swapped entries to the cache, entries lost"
                        );
                    } else {
                        warn!(queue = %self.queue_id, entries = evicted.len(), "Swap failed, entries kept in the cache");
                    }
                    return;
                }
                self.untrack_cache_only(&to_write);
            }

            debug!(
                queue = %self.queue_id,
                evicted = evicted.len(),
                written = to_write.len(),
                "Swapped entries to the persistent store"
            );
            crate::metrics::record_swap(evicted.len(), to_write.len());
        }

        if !cache_was_empty {
            self.reload().await;
        }
    }

    /// Fill free cache room from the persistent store, continuing after the
    /// current cache tail. Cache-only durable entries are written back first.
    /// Returns the number of entries loaded.
    pub(super) async fn reload(&self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        if !self.cache_only.lock().is_empty() {
            if let Err(e) = self.persist_cache_only().await {
                self.persistent_failed("persist_cache_only", &e);
            }
        }
        if !self.has_uncached_entries() {
            return 0;
        }

        let t = &self.transient;
        let p = &self.persistent;
        let free_entries = t.max_entries().saturating_sub(t.num_entries());
        let free_bytes = t.max_bytes().saturating_sub(t.num_bytes());
        if free_entries == 0 || free_bytes == 0 {
            return 0;
        }

        let _timer = crate::time_operation!("queue", "reload");

        let tail = match t.peek_lowest(Some(1), None, None, false).await {
            Ok(mut lowest) => lowest.pop(),
            Err(e) => {
                error!(queue = %self.queue_id, error = %e, "Reload could not read the cache tail");
                return 0;
            }
        };

        let budget = usize::try_from(free_entries).unwrap_or(usize::MAX);
        let loaded = match &tail {
            Some(tail) => p.peek_start_at(Some(budget), Some(free_bytes), tail).await,
            None => p.peek_entries(Some(budget), Some(free_bytes)).await,
        };
        let loaded = match loaded {
            Ok(loaded) if loaded.is_empty() => return 0,
            Ok(loaded) => loaded,
            Err(e) => {
                self.persistent_failed("reload", &e);
                return 0;
            }
        };

        if let Err(e) = t.put(&loaded, true).await {
            error!(queue = %self.queue_id, error = %e, "Reload could not insert into the cache");
            crate::metrics::record_store_error("transient", "reload");
            return 0;
        }

        // swapped-out copies are now cached again; durable ones stay
        let swapped: Vec<QueueEntry> = loaded.iter().filter(|e| !e.durable).cloned().collect();
        if !swapped.is_empty() {
            if let Err(e) = p.remove_random(&swapped).await {
                self.persistent_failed("reload", &e);
            }
        }

        debug!(queue = %self.queue_id, loaded = loaded.len(), swapped = swapped.len(), "Reloaded entries into the cache");
        crate::metrics::record_reload(loaded.len());
        loaded.len()
    }
}
