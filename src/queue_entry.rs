// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue entry data structure.
//!
//! The [`QueueEntry`] is the unit that flows through the cache queue. Entries
//! are ordered by priority (higher first) and then by [`EntryId`] (older
//! first), which gives FIFO behaviour inside one priority.
//!
//! # Example
//!
//! ```
//! use cache_queue::QueueEntry;
//!
//! let urgent = QueueEntry::new(9, true, b"alarm".to_vec());
//! let routine = QueueEntry::new(5, false, b"heartbeat".to_vec());
//!
//! assert!(urgent.sorts_before(&routine));
//! assert_eq!(routine.size_bytes, 9);
//! assert!(urgent.durable);
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Unique, strictly increasing entry identifier.
///
/// Derived from the wall clock in nanoseconds and bumped when two entries are
/// created within the same tick, so ids keep increasing across a restart that
/// reopens a durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        let mut last = LAST_ID.load(Ordering::Acquire);
        loop {
            let candidate = now.max(last + 1);
            match LAST_ID.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Self(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordering key of the logical queue: priority descending, then id ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub priority: i32,
    pub id: EntryId,
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// A single queued unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Identity, stable across swap and reload
    pub id: EntryId,
    /// Higher is more urgent
    pub priority: i32,
    /// Durable entries must be recorded in the persistent store
    pub durable: bool,
    /// Accounted size in bytes
    pub size_bytes: u64,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl QueueEntry {
    /// Create an entry with a fresh id; its size is the payload length.
    pub fn new(priority: i32, durable: bool, payload: Vec<u8>) -> Self {
        Self {
            id: EntryId::next(),
            priority,
            durable,
            size_bytes: payload.len() as u64,
            payload,
        }
    }

    /// Rebuild an entry read back from a store.
    pub fn restore(id: EntryId, priority: i32, durable: bool, size_bytes: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            priority,
            durable,
            size_bytes,
            payload,
        }
    }

    /// Override the accounted size (e.g. to include envelope overhead).
    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    #[must_use]
    #[inline]
    pub fn key(&self) -> EntryKey {
        EntryKey {
            priority: self.priority,
            id: self.id,
        }
    }

    /// True if `self` comes strictly before `other` in queue order.
    #[must_use]
    #[inline]
    pub fn sorts_before(&self, other: &QueueEntry) -> bool {
        self.key() < other.key()
    }
}

impl fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} bytes - {} prio={}",
            self.id,
            self.size_bytes,
            if self.durable { "durable" } else { "transient" },
            self.priority
        )
    }
}

/// Sum of the accounted sizes of `entries`.
#[must_use]
pub fn total_bytes(entries: &[QueueEntry]) -> u64 {
    entries.iter().map(|e| e.size_bytes).sum()
}

/// Entries and bytes of the durable subset of `entries`.
#[must_use]
pub(crate) fn durable_totals(entries: &[QueueEntry]) -> (u64, u64) {
    entries
        .iter()
        .filter(|e| e.durable)
        .fold((0, 0), |(n, b), e| (n + 1, b + e.size_bytes))
}
