//! In-memory queue store, used as the transient (cache) tier.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::traits::{
    check_not_overloaded, fits_budget, select_lowest, QueueStore, StorageError, StoreLimits,
};
use crate::queue_entry::{EntryKey, QueueEntry};

#[derive(Default)]
struct Inner {
    queue_id: String,
    entries: BTreeMap<EntryKey, QueueEntry>,
    num_bytes: u64,
    num_durable_entries: u64,
    num_durable_bytes: u64,
}

impl Inner {
    fn insert(&mut self, entry: &QueueEntry) -> bool {
        let key = entry.key();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.num_bytes += entry.size_bytes;
        if entry.durable {
            self.num_durable_entries += 1;
            self.num_durable_bytes += entry.size_bytes;
        }
        self.entries.insert(key, entry.clone());
        true
    }

    fn remove(&mut self, key: &EntryKey) -> Option<QueueEntry> {
        let entry = self.entries.remove(key)?;
        self.num_bytes -= entry.size_bytes;
        if entry.durable {
            self.num_durable_entries -= 1;
            self.num_durable_bytes -= entry.size_bytes;
        }
        Some(entry)
    }

    fn reset(&mut self) -> u64 {
        let removed = self.entries.len() as u64;
        self.entries.clear();
        self.num_bytes = 0;
        self.num_durable_entries = 0;
        self.num_durable_bytes = 0;
        removed
    }
}

/// Ordered queue store held entirely in memory.
///
/// Entries live in a `BTreeMap` keyed by [`EntryKey`], so iteration order is
/// queue order. Never becomes unavailable, so it does not accept storage
/// problem listeners.
pub struct MemoryQueueStore {
    inner: RwLock<Inner>,
    limits: RwLock<StoreLimits>,
    shutdown: AtomicBool,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            limits: RwLock::new(StoreLimits::UNBOUNDED),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Get current entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Snapshot of every entry in queue order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.inner.read().entries.values().cloned().collect()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(StorageError::Shutdown);
        }
        Ok(())
    }

    fn collect<'a, I>(iter: I, num_entries: Option<usize>, num_bytes: Option<u64>) -> Vec<QueueEntry>
    where
        I: Iterator<Item = &'a QueueEntry>,
    {
        let mut out = Vec::new();
        let mut bytes = 0u64;
        for entry in iter {
            if !fits_budget(out.len(), bytes, entry.size_bytes, num_entries, num_bytes) {
                break;
            }
            bytes += entry.size_bytes;
            out.push(entry.clone());
        }
        out
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(&self, queue_id: &str, limits: StoreLimits) -> Result<(), StorageError> {
        self.inner.write().queue_id = queue_id.to_string();
        *self.limits.write() = limits;
        self.shutdown.store(false, Ordering::Release);
        Ok(())
    }

    fn set_limits(&self, limits: StoreLimits) {
        *self.limits.write() = limits;
    }

    async fn put(&self, entries: &[QueueEntry], _ignore_put_interceptor: bool) -> Result<(), StorageError> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }
        let limits = *self.limits.read();
        let mut inner = self.inner.write();
        check_not_overloaded(&inner.queue_id, inner.entries.len() as u64, inner.num_bytes, limits)?;
        for entry in entries {
            inner.insert(entry);
        }
        Ok(())
    }

    async fn peek_entries(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        Ok(Self::collect(inner.entries.values(), num_entries, num_bytes))
    }

    async fn peek_with_priority(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        let iter = inner
            .entries
            .values()
            .take_while(|e| e.priority >= min_priority)
            .filter(|e| e.priority <= max_priority);
        Ok(Self::collect(iter, num_entries, num_bytes))
    }

    async fn peek_with_limit_entry(&self, limit: &QueueEntry) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        Ok(inner.entries.range(..limit.key()).map(|(_, e)| e.clone()).collect())
    }

    async fn peek_start_at(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        after: &QueueEntry,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        use std::ops::Bound::{Excluded, Unbounded};

        self.ensure_open()?;
        let inner = self.inner.read();
        let iter = inner.entries.range((Excluded(after.key()), Unbounded)).map(|(_, e)| e);
        Ok(Self::collect(iter, num_entries, num_bytes))
    }

    async fn peek_lowest(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        limit: Option<&QueueEntry>,
        leave_one: bool,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        Ok(select_lowest(
            inner.entries.values().rev(),
            inner.entries.len(),
            num_entries,
            num_bytes,
            limit,
            leave_one,
        ))
    }

    async fn take_lowest(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        limit: Option<&QueueEntry>,
        leave_one: bool,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        let picked = select_lowest(
            inner.entries.values().rev(),
            inner.entries.len(),
            num_entries,
            num_bytes,
            limit,
            leave_one,
        );
        for entry in &picked {
            inner.remove(&entry.key());
        }
        Ok(picked)
    }

    async fn remove_random(&self, entries: &[QueueEntry]) -> Result<Vec<bool>, StorageError> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        Ok(entries.iter().map(|e| inner.remove(&e.key()).is_some()).collect())
    }

    async fn remove_with_limit_entry(&self, limit: &QueueEntry, inclusive: bool) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        let mut keys: Vec<EntryKey> = inner.entries.range(..limit.key()).map(|(k, _)| *k).collect();
        if inclusive && inner.entries.contains_key(&limit.key()) {
            keys.push(limit.key());
        }
        for key in &keys {
            inner.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn remove_transient(&self) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        let keys: Vec<EntryKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| !e.durable)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        self.ensure_open()?;
        Ok(self.inner.write().reset())
    }

    fn num_entries(&self) -> u64 {
        self.inner.read().entries.len() as u64
    }

    fn num_durable_entries(&self) -> u64 {
        self.inner.read().num_durable_entries
    }

    fn num_bytes(&self) -> u64 {
        self.inner.read().num_bytes
    }

    fn num_durable_bytes(&self) -> u64 {
        self.inner.read().num_durable_bytes
    }

    fn max_entries(&self) -> u64 {
        self.limits.read().max_entries
    }

    fn max_bytes(&self) -> u64 {
        self.limits.read().max_bytes
    }

    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
