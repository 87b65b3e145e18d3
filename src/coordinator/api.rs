//! Queue operations: put, the peek family, take and the remove family.

use tracing::{debug, warn};

use crate::queue_entry::{total_bytes, QueueEntry};
use crate::storage::StorageError;

use super::CacheQueue;

impl CacheQueue {
    // ═══════════════════════════════════════════════════════════════════════════
    // Put
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert a batch.
    ///
    /// Durable entries are written to the persistent store first (best effort),
    /// then the whole batch goes to the cache; an overflowing cache swaps its
    /// lowest entries out. Durable entries whose write failed stay cache-only
    /// until a later reload or reconnect persists them. Fails with [`StorageError::Overflow`] if the batch
    /// does not fit into the queue. A veto of the put interceptor drops the
    /// batch without error.
    #[tracing::instrument(skip(self, entries), fields(queue = %self.queue_id, count = entries.len()))]
    pub async fn put(&self, entries: &[QueueEntry], ignore_put_interceptor: bool) -> Result<(), StorageError> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }

        let interceptor = if ignore_put_interceptor {
            None
        } else {
            self.put_listener.lock().clone()
        };
        if let Some(interceptor) = &interceptor {
            if !interceptor.put_pre(entries) {
                debug!("Put vetoed by interceptor");
                crate::metrics::record_operation("queue", "put", "rejected");
                return Ok(());
            }
        }

        let _timer = crate::metrics::LatencyTimer::new("queue", "put");
        {
            let _guard = self.main_lock.lock().await;
            self.check_capacity(entries)?;

            let durable: Vec<QueueEntry> = entries.iter().filter(|e| e.durable).cloned().collect();
            let mut persisted = false;
            if !durable.is_empty() {
                match self.persistent.put(&durable, false).await {
                    Ok(()) => persisted = true,
                    Err(e) => self.persistent_failed("put", &e),
                }
            }

            let cache_was_empty = self.transient.num_entries() == 0;
            if let Err(e) = self.transient.put(entries, false).await {
                if persisted {
                    if let Err(rollback) = self.persistent.remove_random(&durable).await {
                        self.persistent_failed("put_rollback", &rollback);
                    }
                }
                crate::metrics::record_operation("queue", "put", "error");
                return Err(e);
            }
            if !persisted {
                self.track_cache_only(&durable);
            }

            if self.is_connected() {
                self.swap_if_needed(entries, cache_was_empty).await;
            }
            self.record_sizes();
        }

        crate::metrics::record_operation("queue", "put", "success");
        self.notify_size_change();
        if let Some(interceptor) = &interceptor {
            interceptor.put_post(entries);
        }
        self.notify_added(entries);
        Ok(())
    }

    /// Insert a single entry.
    pub async fn put_entry(&self, entry: QueueEntry, ignore_put_interceptor: bool) -> Result<(), StorageError> {
        self.put(std::slice::from_ref(&entry), ignore_put_interceptor).await
    }

    fn check_capacity(&self, entries: &[QueueEntry]) -> Result<(), StorageError> {
        let (count, bytes) = self.totals();
        let limits = self.limits();
        let batch_entries = entries.len() as u64;
        let batch_bytes = total_bytes(entries);

        if count + batch_entries > limits.max_entries {
            crate::metrics::record_overflow();
            return Err(StorageError::Overflow {
                store: self.queue_id.clone(),
                unit: "entries",
                used: count,
                limit: limits.max_entries,
            });
        }
        if bytes + batch_bytes > limits.max_bytes {
            crate::metrics::record_overflow();
            return Err(StorageError::Overflow {
                store: self.queue_id.clone(),
                unit: "bytes",
                used: bytes,
                limit: limits.max_bytes,
            });
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Peek (served from the cache)
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn peek(&self) -> Result<Option<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let _peek = self.peek_lock.read().await;
        self.transient.peek().await
    }

    /// Head entries within the budget; `None` means unlimited. The byte
    /// budget never suppresses the first entry.
    pub async fn peek_entries(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let _peek = self.peek_lock.read().await;
        self.transient.peek_entries(num_entries, num_bytes).await
    }

    /// Head entries sharing the priority of the head entry.
    pub async fn peek_same_priority(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let _peek = self.peek_lock.read().await;
        self.transient.peek_same_priority(num_entries, num_bytes).await
    }

    pub async fn peek_with_priority(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let _peek = self.peek_lock.read().await;
        self.transient
            .peek_with_priority(num_entries, num_bytes, min_priority, max_priority)
            .await
    }

    /// All cached entries sorting strictly before `limit`.
    pub async fn peek_with_limit_entry(&self, limit: &QueueEntry) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let _peek = self.peek_lock.read().await;
        self.transient.peek_with_limit_entry(limit).await
    }

    /// Not offered at queue level; see [`take_lowest`](Self::take_lowest).
    pub async fn peek_lowest(
        &self,
        _num_entries: Option<usize>,
        _num_bytes: Option<u64>,
        _limit: Option<&QueueEntry>,
        _leave_one: bool,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        Err(StorageError::NotImplemented("CacheQueue::peek_lowest"))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Take / remove
    // ═══════════════════════════════════════════════════════════════════════════

    /// Remove and return the lowest entries of the queue.
    ///
    /// While the persistent store holds entries the cache does not mirror, the
    /// lowest entries live there and only a single entry can be taken; larger
    /// requests fail with [`StorageError::NotImplemented`] and change nothing.
    #[tracing::instrument(skip(self, limit), fields(queue = %self.queue_id))]
    pub async fn take_lowest(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        limit: Option<&QueueEntry>,
        leave_one: bool,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;

        let taken = {
            let _guard = self.main_lock.lock().await;
            let t = &self.transient;
            let p = &self.persistent;

            let taken = if self.is_connected() && self.has_uncached_entries() {
                let lowest = p.peek_lowest(num_entries, num_bytes, limit, leave_one).await?;
                if lowest.len() > 1 {
                    return Err(StorageError::NotImplemented(
                        "take_lowest of more than one entry from the persistent store",
                    ));
                }
                let taken = p.take_lowest(num_entries, num_bytes, limit, leave_one).await?;
                t.remove_random(&taken).await?;
                self.untrack_cache_only(&taken);
                taken
            } else {
                let taken = t.take_lowest(num_entries, num_bytes, limit, leave_one).await?;
                self.untrack_cache_only(&taken);
                let durable: Vec<QueueEntry> = taken.iter().filter(|e| e.durable).cloned().collect();
                if !durable.is_empty() {
                    if let Err(e) = p.remove_random(&durable).await {
                        self.persistent_failed("take_lowest", &e);
                    }
                }
                taken
            };
            self.record_sizes();
            taken
        };

        if !taken.is_empty() {
            self.notify_size_change();
            self.notify_removed(&taken);
        }
        Ok(taken)
    }

    /// Remove from the head until `num_entries` entries or `num_bytes` bytes
    /// are gone (`None` = unlimited) or the queue is empty. Returns the number
    /// of entries removed.
    #[tracing::instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn remove(&self, num_entries: Option<u64>, num_bytes: Option<u64>) -> Result<u64, StorageError> {
        self.ensure_open()?;

        let mut removed = 0u64;
        let mut removed_bytes = 0u64;
        loop {
            if num_entries.is_some_and(|n| removed >= n) || num_bytes.is_some_and(|b| removed_bytes >= b) {
                break;
            }
            let want_entries = num_entries.map(|n| usize::try_from(n - removed).unwrap_or(usize::MAX));
            let want_bytes = num_bytes.map(|b| b - removed_bytes);

            let batch = self.peek_entries(want_entries, want_bytes).await?;
            if batch.is_empty() {
                break;
            }
            let flags = self.remove_random(&batch).await?;

            let mut progressed = false;
            for (entry, gone) in batch.iter().zip(flags) {
                if gone {
                    progressed = true;
                    removed += 1;
                    removed_bytes += entry.size_bytes;
                }
            }
            if !progressed {
                warn!(queue = %self.queue_id, "Peeked entries could not be removed, stopping");
                break;
            }
        }
        Ok(removed)
    }

    /// Remove the given entries wherever they live. One flag per entry, `true`
    /// if it was still in the queue.
    #[tracing::instrument(skip(self, entries), fields(queue = %self.queue_id, count = entries.len()))]
    pub async fn remove_random(&self, entries: &[QueueEntry]) -> Result<Vec<bool>, StorageError> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let flags = {
            let _guard = self.main_lock.lock().await;
            let t = &self.transient;
            let p = &self.persistent;

            let durable_idx: Vec<usize> = (0..entries.len()).filter(|&i| entries[i].durable).collect();
            let mut flags = vec![false; entries.len()];

            if !durable_idx.is_empty() {
                let durable: Vec<QueueEntry> = durable_idx.iter().map(|&i| entries[i].clone()).collect();
                match p.remove_random(&durable).await {
                    Ok(gone) => {
                        for (&i, g) in durable_idx.iter().zip(gone) {
                            flags[i] = g;
                        }
                    }
                    Err(e) => self.persistent_failed("remove", &e),
                }
            }

            let cached = t.remove_random(entries).await?;
            self.untrack_cache_only(entries.iter().zip(&cached).filter(|(_, g)| **g).map(|(e, _)| e));
            for (flag, g) in flags.iter_mut().zip(cached) {
                *flag |= g;
            }

            // swapped entries are only in the persistent store
            if p.num_entries() > p.num_durable_entries() {
                let missing_idx: Vec<usize> = (0..entries.len())
                    .filter(|&i| !flags[i] && !entries[i].durable)
                    .collect();
                if !missing_idx.is_empty() {
                    let missing: Vec<QueueEntry> = missing_idx.iter().map(|&i| entries[i].clone()).collect();
                    match p.remove_random(&missing).await {
                        Ok(gone) => {
                            for (&i, g) in missing_idx.iter().zip(gone) {
                                flags[i] = g;
                            }
                        }
                        Err(e) => self.persistent_failed("remove", &e),
                    }
                }
            }

            self.reload().await;
            self.record_sizes();
            flags
        };

        let gone: Vec<&QueueEntry> = entries.iter().zip(&flags).filter(|(_, g)| **g).map(|(e, _)| e).collect();
        if !gone.is_empty() {
            crate::metrics::record_operation("queue", "remove", "success");
            self.notify_size_change();
            self.notify_removed(gone);
        }
        Ok(flags)
    }

    pub async fn remove_random_entry(&self, entry: &QueueEntry) -> Result<bool, StorageError> {
        let flags = self.remove_random(std::slice::from_ref(entry)).await?;
        Ok(flags.first().copied().unwrap_or(false))
    }

    /// Remove what [`peek_with_priority`](Self::peek_with_priority) would
    /// return. Returns the number of entries removed.
    pub async fn remove_with_priority(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<u64, StorageError> {
        let targets = self
            .peek_with_priority(num_entries, num_bytes, min_priority, max_priority)
            .await?;
        let flags = self.remove_random(&targets).await?;
        Ok(flags.into_iter().filter(|&g| g).count() as u64)
    }

    /// Remove every entry sorting before `limit`, and `limit` itself if
    /// `inclusive`. Returns the number of entries removed.
    pub async fn remove_with_limit_entry(&self, limit: &QueueEntry, inclusive: bool) -> Result<u64, StorageError> {
        let mut targets = self.peek_with_limit_entry(limit).await?;
        if inclusive {
            targets.push(limit.clone());
        }
        let flags = self.remove_random(&targets).await?;
        Ok(flags.into_iter().filter(|&g| g).count() as u64)
    }

    /// Remove everything. Returns the number of entries removed.
    pub async fn clear(&self) -> Result<u64, StorageError> {
        self.remove(None, None).await
    }
}
