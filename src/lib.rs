//! # Cache Queue
//!
//! A tiered, priority-ordered queue: a bounded in-memory cache holds the head
//! of the queue, a larger durable store holds everything else.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         CacheQueue                          │
//! │  • put / peek / take_lowest / remove                        │
//! │  • Capacity checks against the logical limits               │
//! │  • Put interceptor, size listeners, entry observer          │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!        (head of the queue)          (durable + swapped entries)
//!                 ▼                              ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │   Transient: MemoryQueueStore │  │  Persistent: SqlQueueStore   │
//! │  • BTreeMap in queue order    │  │  • SQLite via sqlx           │
//! │  • Small, fast                │◀─│  • Swap out on overflow      │
//! │                               │─▶│  • Reload into free room     │
//! └──────────────────────────────┘  │  • Availability listener     │
//!                                   └──────────────────────────────┘
//! ```
//!
//! Entries are ordered by priority (higher first), then by age. Durable entries
//! are written to the persistent store on put; transient entries only reach it
//! when the cache overflows. When the persistent store goes away the queue keeps
//! running from memory and reconciles both tiers once it is back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cache_queue::{CacheQueue, CacheQueueConfig, QueueEntry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CacheQueueConfig {
//!         sql_url: Some("sqlite://queue.db".into()),
//!         ..Default::default()
//!     };
//!
//!     let queue = CacheQueue::open_sqlite("callback:client/joe", &config)
//!         .await
//!         .expect("Failed to open queue");
//!
//!     queue.put_entry(QueueEntry::new(9, true, b"alarm".to_vec()), false).await.unwrap();
//!     queue.put_entry(QueueEntry::new(5, false, b"tick".to_vec()), false).await.unwrap();
//!
//!     // highest priority first
//!     for entry in queue.peek_entries(Some(10), None).await.unwrap() {
//!         println!("{entry}");
//!         queue.remove_random_entry(&entry).await.unwrap();
//!     }
//!
//!     queue.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`CacheQueue`] coordinating both tiers
//! - [`storage`]: The [`QueueStore`] contract and its memory/SQLite stores
//! - [`queue_entry`]: Entries and their ordering
//! - [`resilience`]: Retry back-off and store health tracking
//! - [`config`]: [`CacheQueueConfig`]
//! - [`metrics`]: `metrics` facade instrumentation

pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod queue_entry;
pub mod resilience;
pub mod storage;

pub use config::CacheQueueConfig;
pub use coordinator::{
    CacheQueue, ConnectionState, EntryObserver, PutInterceptor, QueueSizeListener, QueueStats, StoreStats,
};
pub use metrics::LatencyTimer;
pub use queue_entry::{EntryId, EntryKey, QueueEntry};
pub use resilience::health::StoreHealth;
pub use resilience::retry::{RetryConfig, RetryPreset};
pub use storage::{
    MemoryQueueStore, QueueStore, SqlQueueStore, StorageError, StorageProblemListener, StorageStatus, StoreLimits,
};
