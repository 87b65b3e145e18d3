// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache queue coordinator.
//!
//! The [`CacheQueue`] presents one ordered, bounded queue over two stores:
//! - a **transient** store (memory) holding the head of the queue
//! - a **persistent** store (e.g. SQLite) holding durable entries and the
//!   entries swapped out of the cache
//!
//! Producers [`put`](CacheQueue::put) into it, consumers peek and remove from
//! the cached head. When the cache overflows, its lowest entries are swapped to
//! the persistent store; when room frees up they are reloaded.
//!
//! # Connection states
//!
//! ```text
//! Connected ──storage_unavailable──▶ Disconnected ──storage_available──▶ (reconcile) ──▶ Connected
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache_queue::{CacheQueue, CacheQueueConfig, MemoryQueueStore, QueueEntry};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CacheQueueConfig::default();
//! let queue = CacheQueue::open(
//!     "callback:client/joe",
//!     &config,
//!     Arc::new(MemoryQueueStore::new()),
//!     Arc::new(MemoryQueueStore::new()),
//! )
//! .await
//! .expect("open failed");
//!
//! queue.put_entry(QueueEntry::new(5, true, b"hello".to_vec()), false).await.expect("put failed");
//! let head = queue.peek().await.expect("peek failed");
//! assert_eq!(head.map(|e| e.payload), Some(b"hello".to_vec()));
//! # }
//! ```

mod api;
mod lifecycle;
mod listeners;
mod recovery;
mod swap;
mod types;

pub use listeners::{EntryObserver, PutInterceptor, QueueSizeListener};
pub use types::{ConnectionState, QueueStats, StoreStats};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue_entry::{EntryKey, QueueEntry};
use crate::storage::{QueueStore, StorageError, StoreLimits};

/// Tiered cache queue.
///
/// # Thread Safety
///
/// Shared through an `Arc` by any number of tasks. Mutations are serialized by
/// one queue-wide async mutex; the peek family only takes the narrower peek
/// lock, which swap holds exclusively while relocating entries. Lock order is
/// always main lock, then peek lock.
pub struct CacheQueue {
    pub(super) queue_id: String,

    /// Memory cache holding the head of the queue
    pub(super) transient: Arc<dyn QueueStore>,

    /// Durable backing store
    pub(super) persistent: Arc<dyn QueueStore>,

    /// Serializes put, remove, swap, reload and recovery
    pub(super) main_lock: Mutex<()>,

    /// Shared by peeks, exclusive during swap
    pub(super) peek_lock: RwLock<()>,

    /// Connection state (broadcast to watchers)
    pub(super) state: watch::Sender<ConnectionState>,

    pub(super) shutdown: AtomicBool,

    /// Durable entries held by the cache without a persistent copy, written
    /// back on reconnect or the next reload
    pub(super) cache_only: parking_lot::Mutex<BTreeMap<EntryKey, QueueEntry>>,

    pub(super) put_listener: parking_lot::Mutex<Option<Arc<dyn PutInterceptor>>>,
    pub(super) size_listeners: parking_lot::RwLock<Vec<Arc<dyn QueueSizeListener>>>,
    pub(super) entry_observer: parking_lot::RwLock<Option<Arc<dyn EntryObserver>>>,

    /// Background health probe of the persistent store, if one was started
    pub(super) probe_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CacheQueue {
    pub(super) fn new(
        queue_id: &str,
        transient: Arc<dyn QueueStore>,
        persistent: Arc<dyn QueueStore>,
        initial: ConnectionState,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            queue_id: queue_id.to_string(),
            transient,
            persistent,
            main_lock: Mutex::new(()),
            peek_lock: RwLock::new(()),
            state,
            shutdown: AtomicBool::new(false),
            cache_only: parking_lot::Mutex::new(BTreeMap::new()),
            put_listener: parking_lot::Mutex::new(None),
            size_listeners: parking_lot::RwLock::new(Vec::new()),
            entry_observer: parking_lot::RwLock::new(None),
            probe_task: parking_lot::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Get current connection state of the persistent store.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Get a receiver to watch connection state changes.
    #[must_use]
    pub fn connection_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accounting
    // ═══════════════════════════════════════════════════════════════════════════

    /// Logical number of entries: durable entries and swapped entries from the
    /// persistent store plus the transient-only part of the cache.
    pub async fn num_entries(&self) -> u64 {
        let _guard = self.main_lock.lock().await;
        self.totals().0
    }

    pub async fn num_bytes(&self) -> u64 {
        let _guard = self.main_lock.lock().await;
        self.totals().1
    }

    pub async fn num_durable_entries(&self) -> u64 {
        let _guard = self.main_lock.lock().await;
        self.durable_totals().0
    }

    pub async fn num_durable_bytes(&self) -> u64 {
        let _guard = self.main_lock.lock().await;
        self.durable_totals().1
    }

    /// Logical capacity: the persistent store's while connected, the cache's
    /// otherwise.
    pub async fn max_entries(&self) -> u64 {
        let _guard = self.main_lock.lock().await;
        self.limits().max_entries
    }

    pub async fn max_bytes(&self) -> u64 {
        let _guard = self.main_lock.lock().await;
        self.limits().max_bytes
    }

    /// Consistent snapshot of all counters.
    pub async fn stats(&self) -> QueueStats {
        let _guard = self.main_lock.lock().await;
        let (num_entries, num_bytes) = self.totals();
        let (num_durable_entries, num_durable_bytes) = self.durable_totals();
        let limits = self.limits();
        QueueStats {
            queue_id: self.queue_id.clone(),
            state: self.connection_state(),
            num_entries,
            num_bytes,
            num_durable_entries,
            num_durable_bytes,
            max_entries: limits.max_entries,
            max_bytes: limits.max_bytes,
            transient: store_stats(self.transient.as_ref()),
            persistent: store_stats(self.persistent.as_ref()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Internal helpers (callers hold the main lock where consistency matters)
    // ═══════════════════════════════════════════════════════════════════════════

    pub(super) fn totals(&self) -> (u64, u64) {
        let t = &self.transient;
        if self.is_connected() {
            let p = &self.persistent;
            let (pending, pending_bytes) = self.cache_only_totals();
            (
                p.num_entries() + t.num_entries().saturating_sub(t.num_durable_entries()) + pending,
                p.num_bytes() + t.num_bytes().saturating_sub(t.num_durable_bytes()) + pending_bytes,
            )
        } else {
            (t.num_entries(), t.num_bytes())
        }
    }

    pub(super) fn durable_totals(&self) -> (u64, u64) {
        if self.is_connected() {
            let p = &self.persistent;
            let (pending, pending_bytes) = self.cache_only_totals();
            (p.num_durable_entries() + pending, p.num_durable_bytes() + pending_bytes)
        } else {
            (self.transient.num_durable_entries(), self.transient.num_durable_bytes())
        }
    }

    pub(super) fn cache_only_totals(&self) -> (u64, u64) {
        let pending = self.cache_only.lock();
        (pending.len() as u64, pending.values().map(|e| e.size_bytes).sum())
    }

    pub(super) fn track_cache_only(&self, entries: &[QueueEntry]) {
        let mut pending = self.cache_only.lock();
        for entry in entries.iter().filter(|e| e.durable) {
            pending.insert(entry.key(), entry.clone());
        }
    }

    pub(super) fn untrack_cache_only<'a, I>(&self, entries: I)
    where
        I: IntoIterator<Item = &'a QueueEntry>,
    {
        let mut pending = self.cache_only.lock();
        if pending.is_empty() {
            return;
        }
        for entry in entries {
            pending.remove(&entry.key());
        }
    }

    pub(super) fn limits(&self) -> StoreLimits {
        let store = if self.is_connected() { &self.persistent } else { &self.transient };
        StoreLimits::new(store.max_entries(), store.max_bytes())
    }

    /// True if the persistent store may hold entries the cache does not mirror.
    /// Cache-only durable entries are in the cache but not in the persistent
    /// store, so they do not count.
    pub(super) fn has_uncached_entries(&self) -> bool {
        let p = &self.persistent;
        let mirrored = self
            .transient
            .num_durable_entries()
            .saturating_sub(self.cache_only.lock().len() as u64);
        p.num_entries() != p.num_durable_entries() || p.num_durable_entries() > mirrored
    }

    pub(super) fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_shutdown() {
            return Err(StorageError::Shutdown);
        }
        Ok(())
    }

    pub(super) fn set_state(&self, new_state: ConnectionState) {
        let previous = self.state.send_replace(new_state);
        if previous != new_state {
            info!(queue = %self.queue_id, from = %previous, to = %new_state, "Persistent store connection changed");
            crate::metrics::record_connection_change(new_state.as_str());
        }
    }

    /// Log a failed persistent store call. The connection state only follows
    /// the store's own availability announcements.
    pub(super) fn persistent_failed(&self, operation: &'static str, e: &StorageError) {
        crate::metrics::record_store_error("persistent", operation);
        if !self.is_connected() {
            debug!(queue = %self.queue_id, operation, error = %e, "Persistent store call failed while disconnected");
        } else if e.is_outage() {
            error!(queue = %self.queue_id, operation, error = %e, "Persistent store call failed");
        } else {
            warn!(queue = %self.queue_id, operation, error = %e, "Persistent store rejected call");
        }
    }

    pub(super) fn record_sizes(&self) {
        crate::metrics::set_store_size("transient", self.transient.num_entries(), self.transient.num_bytes());
        crate::metrics::set_store_size("persistent", self.persistent.num_entries(), self.persistent.num_bytes());
    }
}

fn store_stats(store: &dyn QueueStore) -> StoreStats {
    StoreStats {
        entries: store.num_entries(),
        bytes: store.num_bytes(),
        durable_entries: store.num_durable_entries(),
        durable_bytes: store.num_durable_bytes(),
        max_entries: store.max_entries(),
        max_bytes: store.max_bytes(),
    }
}

impl fmt::Debug for CacheQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheQueue")
            .field("queue_id", &self.queue_id)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CacheQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, bytes) = self.totals();
        write!(
            f,
            "CacheQueue[{}] {} entries, {} bytes, {} (cache {}/{}, {} {}/{})",
            self.queue_id,
            entries,
            bytes,
            self.connection_state(),
            self.transient.num_entries(),
            self.transient.max_entries(),
            self.persistent.name(),
            self.persistent.num_entries(),
            self.persistent.max_entries(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheQueueConfig;
    use crate::queue_entry::QueueEntry;
    use crate::storage::MemoryQueueStore;
    use std::sync::atomic::AtomicUsize;

    fn config(max_entries_cache: u64, max_entries: u64) -> CacheQueueConfig {
        CacheQueueConfig {
            max_entries,
            max_entries_cache,
            ..Default::default()
        }
    }

    async fn open(max_entries_cache: u64, max_entries: u64) -> (Arc<CacheQueue>, Arc<MemoryQueueStore>, Arc<MemoryQueueStore>) {
        let transient = Arc::new(MemoryQueueStore::new());
        let persistent = Arc::new(MemoryQueueStore::new());
        let queue = CacheQueue::open(
            "test",
            &config(max_entries_cache, max_entries),
            transient.clone(),
            persistent.clone(),
        )
        .await
        .unwrap();
        (queue, transient, persistent)
    }

    fn entry(priority: i32, durable: bool) -> QueueEntry {
        QueueEntry::new(priority, durable, vec![0; 10])
    }

    #[derive(Default)]
    struct Counting {
        changes: AtomicUsize,
        added: AtomicUsize,
        removed: AtomicUsize,
        vetoes: bool,
        posts: AtomicUsize,
    }

    impl QueueSizeListener for Counting {
        fn changed(&self, _queue_id: &str, _num_entries: u64, _num_bytes: u64) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl EntryObserver for Counting {
        fn added(&self, _entry: &QueueEntry) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn removed(&self, _entry: &QueueEntry) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PutInterceptor for Counting {
        fn put_pre(&self, _entries: &[QueueEntry]) -> bool {
            !self.vetoes
        }

        fn put_post(&self, _entries: &[QueueEntry]) {
            self.posts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_open_starts_connected() {
        let (queue, _, _) = open(10, 100).await;
        assert_eq!(queue.connection_state(), ConnectionState::Connected);
        assert_eq!(queue.num_entries().await, 0);
        assert_eq!(queue.max_entries().await, 100);
        assert_eq!(queue.queue_id(), "test");
    }

    #[tokio::test]
    async fn test_cache_limits_are_clamped_on_open() {
        let (_, transient, _) = open(500, 20).await;
        assert_eq!(transient.max_entries(), 20);
    }

    #[tokio::test]
    async fn test_accounting_counts_durable_entries_once() {
        let (queue, transient, persistent) = open(10, 100).await;
        queue.put(&[entry(5, true), entry(5, false)], false).await.unwrap();

        assert_eq!(persistent.num_entries(), 1);
        assert_eq!(transient.num_entries(), 2);
        assert_eq!(queue.num_entries().await, 2);
        assert_eq!(queue.num_bytes().await, 20);
        assert_eq!(queue.num_durable_entries().await, 1);
        assert_eq!(queue.num_durable_bytes().await, 10);
    }

    #[tokio::test]
    async fn test_overflow_counts_the_incoming_batch() {
        let (queue, _, _) = open(10, 3).await;
        queue.put(&[entry(5, false), entry(5, false)], false).await.unwrap();

        let err = queue.put(&[entry(5, false), entry(5, false)], false).await.unwrap_err();
        assert!(matches!(err, StorageError::Overflow { unit: "entries", used: 2, limit: 3, .. }));
        assert_eq!(queue.num_entries().await, 2);

        queue.put(&[entry(5, false)], false).await.unwrap();
        assert_eq!(queue.num_entries().await, 3);
    }

    #[tokio::test]
    async fn test_byte_overflow() {
        let transient = Arc::new(MemoryQueueStore::new());
        let persistent = Arc::new(MemoryQueueStore::new());
        let config = CacheQueueConfig {
            max_bytes: 25,
            ..Default::default()
        };
        let queue = CacheQueue::open("bytes", &config, transient, persistent).await.unwrap();

        queue.put(&[entry(5, false), entry(5, false)], false).await.unwrap();
        let err = queue.put_entry(entry(5, false), false).await.unwrap_err();
        assert!(matches!(err, StorageError::Overflow { unit: "bytes", .. }));
    }

    #[tokio::test]
    async fn test_interceptor_veto_drops_batch() {
        let (queue, _, _) = open(10, 100).await;
        let vetoing = Arc::new(Counting {
            vetoes: true,
            ..Default::default()
        });
        queue.add_put_listener(vetoing.clone()).unwrap();

        queue.put_entry(entry(5, true), false).await.unwrap();
        assert_eq!(queue.num_entries().await, 0);
        assert_eq!(vetoing.posts.load(Ordering::SeqCst), 0);

        // bypassing the interceptor stores the entry
        queue.put_entry(entry(5, true), true).await.unwrap();
        assert_eq!(queue.num_entries().await, 1);
    }

    #[tokio::test]
    async fn test_put_listener_slot_is_exclusive() {
        let (queue, _, _) = open(10, 100).await;
        let first = Arc::new(Counting::default());
        queue.add_put_listener(first.clone()).unwrap();

        let err = queue.add_put_listener(Arc::new(Counting::default())).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        queue.put_entry(entry(5, false), false).await.unwrap();
        assert_eq!(first.posts.load(Ordering::SeqCst), 1);

        assert!(queue.remove_put_listener().is_some());
        assert!(queue.remove_put_listener().is_none());
        queue.add_put_listener(Arc::new(Counting::default())).unwrap();
    }

    #[tokio::test]
    async fn test_size_listeners_and_observer() {
        let (queue, _, _) = open(10, 100).await;
        let counting = Arc::new(Counting::default());
        let listener: Arc<dyn QueueSizeListener> = counting.clone();
        queue.add_queue_size_listener(listener.clone());
        queue.set_entry_observer(Some(counting.clone()));
        assert!(queue.has_queue_size_listener(Some(&listener)));
        assert!(queue.has_queue_size_listener(None));

        let e = entry(5, true);
        queue.put(&[e.clone(), entry(4, false)], false).await.unwrap();
        queue.remove_random_entry(&e).await.unwrap();
        queue.remove_random_entry(&e).await.unwrap();

        assert_eq!(counting.changes.load(Ordering::SeqCst), 2);
        assert_eq!(counting.added.load(Ordering::SeqCst), 2);
        assert_eq!(counting.removed.load(Ordering::SeqCst), 1);

        assert!(queue.remove_queue_size_listener(Some(&listener)));
        assert!(!queue.remove_queue_size_listener(Some(&listener)));
        assert!(!queue.has_queue_size_listener(None));
    }

    #[tokio::test]
    async fn test_peek_lowest_is_not_offered() {
        let (queue, _, _) = open(10, 100).await;
        let err = queue.peek_lowest(Some(1), None, None, false).await.unwrap_err();
        assert!(matches!(err, StorageError::NotImplemented(_)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let (queue, transient, persistent) = open(10, 100).await;
        queue.add_queue_size_listener(Arc::new(Counting::default()));
        queue.put_entry(entry(5, false), false).await.unwrap();

        queue.shutdown().await;
        queue.shutdown().await;

        assert!(queue.is_shutdown());
        assert!(transient.is_shutdown());
        assert!(persistent.is_shutdown());
        assert!(!queue.has_queue_size_listener(None));
        assert_eq!(queue.put_entry(entry(5, false), false).await.unwrap_err(), StorageError::Shutdown);
        assert_eq!(queue.peek().await.unwrap_err(), StorageError::Shutdown);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let (queue, _, _) = open(2, 100).await;
        queue.put(&[entry(5, true), entry(5, false), entry(1, false)], false).await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.num_entries, 3);
        assert_eq!(stats.transient.entries, 2);
        assert_eq!(stats.persistent.entries, 2);
        assert_eq!(stats.persistent.durable_entries, 1);
        assert_eq!(stats.state, ConnectionState::Connected);
        assert!(queue.to_string().starts_with("CacheQueue[test] 3 entries"));
    }

    #[tokio::test]
    async fn test_reconfigure_grows_cache_and_reloads() {
        let (queue, transient, persistent) = open(1, 100).await;
        queue.put_entry(entry(5, false), false).await.unwrap();
        queue.put_entry(entry(4, false), false).await.unwrap();
        assert_eq!(transient.num_entries(), 1);
        assert_eq!(persistent.num_entries(), 1);

        queue.reconfigure(&config(10, 100)).await.unwrap();
        assert_eq!(transient.num_entries(), 2);
        assert_eq!(persistent.num_entries(), 0);
        assert_eq!(queue.num_entries().await, 2);
    }
}
