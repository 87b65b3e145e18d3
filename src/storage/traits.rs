// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store contract shared by the transient (cache) and persistent tiers.

use std::fmt;
use std::sync::Weak;

use async_trait::async_trait;
use thiserror::Error;

use crate::queue_entry::QueueEntry;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("{store} queue overflow: {used} {unit} in queue, limit is {limit}")]
    Overflow {
        store: String,
        unit: &'static str,
        used: u64,
        limit: u64,
    },
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Queue has been shut down")]
    Shutdown,
}

impl StorageError {
    /// True for failures that mean the store itself is unreachable or broken,
    /// as opposed to a rejected request.
    #[must_use]
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Backend(_))
    }
}

/// Availability of a store as announced to its [`StorageProblemListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    /// Never reported (e.g. before the first successful connect)
    Undefined,
    Available,
    Unavailable,
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Available => write!(f, "available"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Capacity of a single store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_entries: u64,
    pub max_bytes: u64,
}

impl StoreLimits {
    pub const UNBOUNDED: Self = Self {
        max_entries: u64::MAX,
        max_bytes: u64::MAX,
    };

    #[must_use]
    pub fn new(max_entries: u64, max_bytes: u64) -> Self {
        Self { max_entries, max_bytes }
    }

    /// Component-wise minimum.
    #[must_use]
    pub fn clamp_to(self, outer: StoreLimits) -> Self {
        Self {
            max_entries: self.max_entries.min(outer.max_entries),
            max_bytes: self.max_bytes.min(outer.max_bytes),
        }
    }
}

/// Receives availability transitions of a persistent store.
///
/// `storage_unavailable` may be called from inside a store operation that the
/// listener itself issued, so implementations must not block on locks held
/// across store calls. `storage_available` is only announced from outside such
/// calls (health probes, explicit recovery).
#[async_trait]
pub trait StorageProblemListener: Send + Sync {
    async fn storage_unavailable(&self, previous: StorageStatus);
    async fn storage_available(&self, previous: StorageStatus);
}

/// An ordered, capacity-bounded queue store.
///
/// Entries are kept in [`EntryKey`](crate::queue_entry::EntryKey) order.
/// Count limits are `None` for "unlimited". Peeks never mutate.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Idempotent setup. Re-initializing only updates the limits.
    async fn init(&self, queue_id: &str, limits: StoreLimits) -> Result<(), StorageError>;

    fn set_limits(&self, limits: StoreLimits);

    /// Insert in queue order. Fails with [`StorageError::Overflow`] only when
    /// the store is already beyond capacity, so one batch may overshoot.
    /// Entries whose id is already stored are ignored.
    async fn put(&self, entries: &[QueueEntry], ignore_put_interceptor: bool) -> Result<(), StorageError>;

    async fn peek(&self) -> Result<Option<QueueEntry>, StorageError> {
        Ok(self.peek_entries(Some(1), None).await?.into_iter().next())
    }

    /// Head entries within the given budget. The first entry is always
    /// returned regardless of its size.
    async fn peek_entries(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
    ) -> Result<Vec<QueueEntry>, StorageError>;

    /// Head entries with `min_priority <= priority <= max_priority`, stopping
    /// at the first entry below `min_priority`.
    async fn peek_with_priority(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<QueueEntry>, StorageError>;

    /// Head entries sharing the priority of the head.
    async fn peek_same_priority(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        match self.peek().await? {
            Some(head) => {
                self.peek_with_priority(num_entries, num_bytes, head.priority, head.priority)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// All entries sorting strictly before `limit`.
    async fn peek_with_limit_entry(&self, limit: &QueueEntry) -> Result<Vec<QueueEntry>, StorageError>;

    /// Entries sorting strictly after `after`, in queue order.
    async fn peek_start_at(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        after: &QueueEntry,
    ) -> Result<Vec<QueueEntry>, StorageError>;

    /// Non-mutating twin of [`take_lowest`](Self::take_lowest).
    async fn peek_lowest(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        limit: Option<&QueueEntry>,
        leave_one: bool,
    ) -> Result<Vec<QueueEntry>, StorageError>;

    /// Eviction primitive: removes entries from the tail until at least
    /// `num_entries` entries and at least `num_bytes` bytes were taken
    /// (`None` ignores that dimension, both `None` takes everything). Never
    /// takes `limit` or anything before it; keeps one entry if `leave_one`.
    /// Returned lowest first.
    async fn take_lowest(
        &self,
        num_entries: Option<usize>,
        num_bytes: Option<u64>,
        limit: Option<&QueueEntry>,
        leave_one: bool,
    ) -> Result<Vec<QueueEntry>, StorageError>;

    /// Remove the given entries; `true` per entry that was present.
    async fn remove_random(&self, entries: &[QueueEntry]) -> Result<Vec<bool>, StorageError>;

    /// Remove everything sorting before `limit` (and `limit` itself if
    /// `inclusive`). Returns the number removed.
    async fn remove_with_limit_entry(&self, limit: &QueueEntry, inclusive: bool) -> Result<u64, StorageError>;

    /// Remove all non-durable entries.
    async fn remove_transient(&self) -> Result<u64, StorageError>;

    async fn clear(&self) -> Result<u64, StorageError>;

    fn num_entries(&self) -> u64;
    fn num_durable_entries(&self) -> u64;
    fn num_bytes(&self) -> u64;
    fn num_durable_bytes(&self) -> u64;
    fn max_entries(&self) -> u64;
    fn max_bytes(&self) -> u64;

    /// Register the single availability listener. Stores that never become
    /// unavailable do not support listeners and return `false`.
    fn register_storage_problem_listener(&self, _listener: Weak<dyn StorageProblemListener>) -> bool {
        false
    }

    fn unregister_storage_problem_listener(&self) -> bool {
        false
    }

    async fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

/// Budget check used by the peek family: the first entry always fits.
#[inline]
pub(crate) fn fits_budget(
    taken: usize,
    taken_bytes: u64,
    next_size: u64,
    num_entries: Option<usize>,
    num_bytes: Option<u64>,
) -> bool {
    if num_entries.is_some_and(|n| taken >= n) {
        return false;
    }
    taken == 0 || num_bytes.map_or(true, |b| taken_bytes.saturating_add(next_size) <= b)
}

/// Target check used by the eviction primitive.
#[inline]
pub(crate) fn below_take_target(
    taken: usize,
    taken_bytes: u64,
    num_entries: Option<usize>,
    num_bytes: Option<u64>,
) -> bool {
    match (num_entries, num_bytes) {
        (None, None) => true,
        _ => num_entries.is_some_and(|n| taken < n) || num_bytes.is_some_and(|b| taken_bytes < b),
    }
}

/// Select the entries `take_lowest` would remove from `tail_first` (the
/// store's entries, lowest first).
pub(crate) fn select_lowest<'a, I>(
    tail_first: I,
    total: usize,
    num_entries: Option<usize>,
    num_bytes: Option<u64>,
    limit: Option<&QueueEntry>,
    leave_one: bool,
) -> Vec<QueueEntry>
where
    I: Iterator<Item = &'a QueueEntry>,
{
    let mut picked = Vec::new();
    let mut bytes = 0u64;
    for entry in tail_first {
        if !below_take_target(picked.len(), bytes, num_entries, num_bytes) {
            break;
        }
        if limit.is_some_and(|l| !l.sorts_before(entry)) {
            break;
        }
        bytes += entry.size_bytes;
        picked.push(entry.clone());
    }
    if leave_one && !picked.is_empty() && picked.len() == total {
        picked.pop();
    }
    picked
}

/// Overflow check applied before a put: rejects only if already beyond capacity.
pub(crate) fn check_not_overloaded(
    store: &str,
    num_entries: u64,
    num_bytes: u64,
    limits: StoreLimits,
) -> Result<(), StorageError> {
    if num_entries > limits.max_entries {
        return Err(StorageError::Overflow {
            store: store.to_string(),
            unit: "entries",
            used: num_entries,
            limit: limits.max_entries,
        });
    }
    if num_bytes > limits.max_bytes {
        return Err(StorageError::Overflow {
            store: store.to_string(),
            unit: "bytes",
            used: num_bytes,
            limit: limits.max_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(sizes: &[u64]) -> Vec<QueueEntry> {
        sizes
            .iter()
            .map(|s| QueueEntry::new(5, false, vec![]).with_size(*s))
            .collect()
    }

    #[test]
    fn test_first_entry_always_fits() {
        assert!(fits_budget(0, 0, 1000, Some(5), Some(10)));
        assert!(!fits_budget(1, 1000, 1, Some(5), Some(10)));
        assert!(fits_budget(1, 5, 5, None, Some(10)));
        assert!(!fits_budget(2, 0, 0, Some(2), None));
    }

    #[test]
    fn test_take_target_requires_both_dimensions() {
        assert!(below_take_target(1, 100, Some(2), Some(50)));
        assert!(below_take_target(2, 10, Some(2), Some(50)));
        assert!(!below_take_target(2, 50, Some(2), Some(50)));
        assert!(!below_take_target(0, 0, Some(0), None));
        assert!(below_take_target(999, 999, None, None));
    }

    #[test]
    fn test_select_lowest_respects_limit_and_leave_one() {
        let all = entries(&[1, 2, 3, 4]);
        let tail_first: Vec<&QueueEntry> = all.iter().rev().collect();

        let picked = select_lowest(tail_first.iter().copied(), 4, None, None, None, true);
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0].id, all[3].id);

        let picked = select_lowest(tail_first.iter().copied(), 4, None, None, Some(&all[1]), false);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|e| all[1].sorts_before(e)));

        let picked = select_lowest(tail_first.iter().copied(), 4, Some(1), Some(6), None, false);
        // one entry is not enough bytes: 4 then 3 -> 7 >= 6
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_overload_check_allows_one_batch() {
        let limits = StoreLimits::new(2, 100);
        assert!(check_not_overloaded("cache", 2, 100, limits).is_ok());
        assert!(matches!(
            check_not_overloaded("cache", 3, 0, limits),
            Err(StorageError::Overflow { unit: "entries", .. })
        ));
        assert!(matches!(
            check_not_overloaded("cache", 0, 101, limits),
            Err(StorageError::Overflow { unit: "bytes", .. })
        ));
    }

    #[test]
    fn test_outage_classification() {
        assert!(StorageError::Backend("io".into()).is_outage());
        assert!(StorageError::Unavailable("down".into()).is_outage());
        assert!(!StorageError::Shutdown.is_outage());
        assert!(!StorageError::NotImplemented("x").is_outage());
    }

    #[test]
    fn test_clamp_limits() {
        let cache = StoreLimits::new(1000, 10);
        let clamped = cache.clamp_to(StoreLimits::new(10, 1000));
        assert_eq!(clamped, StoreLimits::new(10, 10));
    }
}
