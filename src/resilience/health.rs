// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Availability tracking for a store that can go away.
//!
//! A [`StoreHealth`] counts consecutive failures and flips the store to
//! [`StorageStatus::Unavailable`] once a threshold is reached. Recovery is only
//! declared by an explicit successful check, never by a single lucky query,
//! so the listener sees one clean transition per outage.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::storage::StorageStatus;

/// Consecutive failures before a store is declared unavailable.
pub const DEFAULT_FAILURE_THRESHOLD: u64 = 3;

/// A status change that must be announced to the store's listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: StorageStatus,
    pub current: StorageStatus,
}

pub struct StoreHealth {
    status: Mutex<StorageStatus>,
    failures: AtomicU64,
    threshold: u64,
    /// Serializes checks
    checking: tokio::sync::Mutex<()>,
}

impl StoreHealth {
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_FAILURE_THRESHOLD)
    }

    #[must_use]
    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            status: Mutex::new(StorageStatus::Undefined),
            failures: AtomicU64::new(0),
            threshold: threshold.max(1),
            checking: tokio::sync::Mutex::new(()),
        }
    }

    /// Record a successful operation. Resets the failure streak but does not
    /// by itself end an outage.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// Record a failed operation; returns the transition if this failure
    /// crossed the threshold.
    pub fn record_failure(&self) -> Option<Transition> {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.threshold {
            return None;
        }
        self.set(StorageStatus::Unavailable)
    }

    /// Declare the store reachable.
    pub fn mark_available(&self) -> Option<Transition> {
        self.failures.store(0, Ordering::Release);
        self.set(StorageStatus::Available)
    }

    /// Declare the store unreachable regardless of the failure streak.
    pub fn mark_unavailable(&self) -> Option<Transition> {
        self.set(StorageStatus::Unavailable)
    }

    /// Run `ping` and update the status from its outcome.
    pub async fn check<F, Fut, E>(&self, ping: F) -> Option<Transition>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let _guard = self.checking.lock().await;
        match ping().await {
            Ok(()) => self.mark_available(),
            Err(_) => self.record_failure(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StorageStatus {
        *self.status.lock()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status() != StorageStatus::Unavailable
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    fn set(&self, current: StorageStatus) -> Option<Transition> {
        let mut status = self.status.lock();
        if *status == current {
            return None;
        }
        let previous = std::mem::replace(&mut *status, current);
        Some(Transition { previous, current })
    }
}

impl Default for StoreHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_after_threshold() {
        let health = StoreHealth::with_threshold(3);
        health.mark_available();

        assert!(health.record_failure().is_none());
        assert!(health.record_failure().is_none());
        let t = health.record_failure().unwrap();
        assert_eq!(t.previous, StorageStatus::Available);
        assert_eq!(t.current, StorageStatus::Unavailable);

        // announced once per outage
        assert!(health.record_failure().is_none());
        assert!(!health.is_healthy());
        assert_eq!(health.failure_count(), 4);
    }

    #[test]
    fn test_success_resets_streak_without_recovering() {
        let health = StoreHealth::with_threshold(2);
        health.mark_available();
        health.record_failure();
        health.record_success();
        assert!(health.record_failure().is_none());

        health.mark_unavailable();
        health.record_success();
        assert_eq!(health.status(), StorageStatus::Unavailable);
    }

    #[test]
    fn test_first_availability_comes_from_undefined() {
        let health = StoreHealth::new();
        let t = health.mark_available().unwrap();
        assert_eq!(t.previous, StorageStatus::Undefined);
        assert!(health.mark_available().is_none());
    }

    #[tokio::test]
    async fn test_check_drives_transitions() {
        let health = StoreHealth::with_threshold(1);
        health.mark_available();

        let down = health.check(|| async { Err::<(), _>("refused") }).await.unwrap();
        assert_eq!(down.current, StorageStatus::Unavailable);

        let up = health.check(|| async { Ok::<(), &str>(()) }).await.unwrap();
        assert_eq!(up.previous, StorageStatus::Unavailable);
        assert_eq!(up.current, StorageStatus::Available);
    }
}
