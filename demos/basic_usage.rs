// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cache-queue usage example.
//!
//! Demonstrates:
//! 1. Opening a queue over a SQLite file with a deliberately small cache
//! 2. Putting durable and transient entries at mixed priorities
//! 3. Watching the overflow swap entries to SQLite
//! 4. Consuming from the head while the cache reloads
//! 5. Displaying metrics
//! 6. Clean shutdown and reopen (only durable entries come back)
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use cache_queue::{CacheQueue, CacheQueueConfig, QueueEntry, RetryPreset};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           cache-queue: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open the queue
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("queue.db");
    let config = CacheQueueConfig {
        sql_url: Some(format!("sqlite://{}", db_path.display())),
        // tiny cache so the demo swaps
        max_entries_cache: 3,
        max_entries: 100,
        persistent_retry: RetryPreset::Test,
        ..Default::default()
    };

    println!("📦 Opening queue over {}", db_path.display());
    let queue = CacheQueue::open_sqlite("callback:client/demo", &config).await?;
    println!("   State: {}", queue.connection_state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Put entries
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Putting 6 entries (cache holds 3)...");
    let entries = [
        (5, true, "order #1001 created"),
        (1, false, "heartbeat"),
        (9, true, "ALARM: disk full"),
        (5, false, "order #1001 viewed"),
        (3, true, "invoice sent"),
        (1, false, "heartbeat"),
    ];
    for (priority, durable, text) in entries {
        let entry = QueueEntry::new(priority, durable, text.as_bytes().to_vec());
        let start = std::time::Instant::now();
        queue.put_entry(entry.clone(), false).await?;
        println!("   └─ {} {:?} ({:?})", entry, text, start.elapsed());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Where the entries live
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Queue Stats:");
    println!("{}", queue.stats().await);

    println!("\n🔍 Cached head:");
    for entry in queue.peek_entries(None, None).await? {
        println!("   └─ {} {:?}", entry, String::from_utf8_lossy(&entry.payload));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Consume the top 4, the cache reloads behind us
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Consuming 4 entries...");
    for _ in 0..4 {
        if let Some(head) = queue.peek().await? {
            queue.remove_random_entry(&head).await?;
            println!("   └─ {} {:?}", head, String::from_utf8_lossy(&head.payload));
        }
    }
    println!("   Remaining: {}", queue);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown and reopen
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    queue.shutdown().await;

    let queue = CacheQueue::open_sqlite("callback:client/demo", &config).await?;
    println!("\n🔁 Reopened, durable entries survive:");
    for entry in queue.peek_entries(None, None).await? {
        println!("   └─ {} {:?}", entry, String::from_utf8_lossy(&entry.payload));
    }
    queue.shutdown().await;

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, sorted by name
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = Vec::new();
    let mut gauges = Vec::new();
    let mut histograms = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.0}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("   │  └─ {}{} count={} avg={:.6}s", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
