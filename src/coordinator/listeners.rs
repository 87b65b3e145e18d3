// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Put interceptor, size listeners and the entry observer.
//!
//! All callbacks run after the mutation, outside the queue lock, against a
//! snapshot of the registry taken just before notifying.

use std::sync::Arc;

use tracing::debug;

use crate::queue_entry::QueueEntry;
use crate::storage::StorageError;

use super::CacheQueue;

/// Single-slot hook around [`CacheQueue::put`].
pub trait PutInterceptor: Send + Sync {
    /// Called before anything is stored. Returning `false` drops the whole
    /// batch silently.
    fn put_pre(&self, entries: &[QueueEntry]) -> bool;

    /// Called once the batch is stored.
    fn put_post(&self, entries: &[QueueEntry]);
}

/// Notified after every size-affecting mutation.
pub trait QueueSizeListener: Send + Sync {
    fn changed(&self, queue_id: &str, num_entries: u64, num_bytes: u64);
}

/// Per-entry notifications.
pub trait EntryObserver: Send + Sync {
    fn added(&self, entry: &QueueEntry);
    fn removed(&self, entry: &QueueEntry);
}

impl CacheQueue {
    /// Install the put interceptor. Fails if one is already installed.
    pub fn add_put_listener(&self, listener: Arc<dyn PutInterceptor>) -> Result<(), StorageError> {
        let mut slot = self.put_listener.lock();
        if slot.is_some() {
            return Err(StorageError::InvalidArgument(format!(
                "queue '{}' already has a put listener",
                self.queue_id
            )));
        }
        *slot = Some(listener);
        Ok(())
    }

    pub fn remove_put_listener(&self) -> Option<Arc<dyn PutInterceptor>> {
        self.put_listener.lock().take()
    }

    pub fn add_queue_size_listener(&self, listener: Arc<dyn QueueSizeListener>) {
        self.size_listeners.write().push(listener);
    }

    /// Remove a size listener, or all of them with `None`.
    pub fn remove_queue_size_listener(&self, listener: Option<&Arc<dyn QueueSizeListener>>) -> bool {
        let mut listeners = self.size_listeners.write();
        let before = listeners.len();
        match listener {
            Some(target) => listeners.retain(|l| !Arc::ptr_eq(l, target)),
            None => listeners.clear(),
        }
        listeners.len() != before
    }

    /// Check for a specific size listener, or for any with `None`.
    #[must_use]
    pub fn has_queue_size_listener(&self, listener: Option<&Arc<dyn QueueSizeListener>>) -> bool {
        let listeners = self.size_listeners.read();
        match listener {
            Some(target) => listeners.iter().any(|l| Arc::ptr_eq(l, target)),
            None => !listeners.is_empty(),
        }
    }

    /// Install (or with `None`, remove) the per-entry observer.
    pub fn set_entry_observer(&self, observer: Option<Arc<dyn EntryObserver>>) {
        *self.entry_observer.write() = observer;
    }

    pub(super) fn notify_size_change(&self) {
        let listeners: Vec<_> = self.size_listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        let (entries, bytes) = self.totals();
        debug!(queue = %self.queue_id, entries, bytes, listeners = listeners.len(), "Notifying size listeners");
        for listener in listeners {
            listener.changed(&self.queue_id, entries, bytes);
        }
    }

    pub(super) fn notify_added(&self, entries: &[QueueEntry]) {
        let observer = self.entry_observer.read().clone();
        if let Some(observer) = observer {
            entries.iter().for_each(|e| observer.added(e));
        }
    }

    pub(super) fn notify_removed<'a, I>(&self, entries: I)
    where
        I: IntoIterator<Item = &'a QueueEntry>,
    {
        let observer = self.entry_observer.read().clone();
        if let Some(observer) = observer {
            entries.into_iter().for_each(|e| observer.removed(e));
        }
    }
}
