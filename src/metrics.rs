// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the cache queue.
//!
//! Uses the `metrics` facade; the embedding process installs the exporter.
//!
//! # Metric Naming Convention
//! - `cache_queue_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: transient, persistent (or the backend name for store internals)
//! - `operation`: put, peek, take_lowest, remove, reload, swap, ...
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a queue operation outcome
pub fn record_operation(store: &str, operation: &str, status: &str) {
    counter!(
        "cache_queue_operations_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "cache_queue_operation_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a failed store call (logged and tolerated by the coordinator)
pub fn record_store_error(store: &str, operation: &str) {
    counter!(
        "cache_queue_store_errors_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a put rejected for capacity
pub fn record_overflow() {
    counter!("cache_queue_overflow_total").increment(1);
}

/// Record one swap: entries evicted from the cache and how many of them were
/// written to the persistent store
pub fn record_swap(evicted: usize, written: usize) {
    counter!("cache_queue_swaps_total").increment(1);
    counter!("cache_queue_swapped_entries_total").increment(evicted as u64);
    counter!("cache_queue_swap_written_entries_total").increment(written as u64);
}

/// Record one reload pass
pub fn record_reload(loaded: usize) {
    counter!("cache_queue_reloads_total").increment(1);
    counter!("cache_queue_reloaded_entries_total").increment(loaded as u64);
}

/// Record an availability transition of the persistent store
pub fn record_connection_change(state: &str) {
    counter!(
        "cache_queue_connection_changes_total",
        "state" => state.to_string()
    )
    .increment(1);
    gauge!("cache_queue_persistent_connected").set(if state == "connected" { 1.0 } else { 0.0 });
}

/// Record a reconciliation pass after the persistent store came back
pub fn record_recovery(removed: u64, persisted: usize) {
    counter!("cache_queue_recoveries_total").increment(1);
    counter!("cache_queue_recovery_removed_total").increment(removed);
    counter!("cache_queue_recovery_persisted_total").increment(persisted as u64);
}

/// Set the per-store size gauges
pub fn set_store_size(store: &str, entries: u64, bytes: u64) {
    gauge!("cache_queue_entries", "store" => store.to_string()).set(entries as f64);
    gauge!("cache_queue_bytes", "store" => store.to_string()).set(bytes as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    store: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(store: &'static str, operation: &'static str) -> Self {
        Self {
            store,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.store, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($store:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($store, $op)
    };
}
