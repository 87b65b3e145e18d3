//! Property-based tests for queue ordering and accounting.
//!
//! Random operation sequences run against a queue with a tiny cache, so most
//! sequences swap and reload, and are checked against a plain sorted model.
//!
//! Run with: `cargo test --test proptest_queue`

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use cache_queue::{CacheQueue, CacheQueueConfig, MemoryQueueStore, QueueEntry};

// =============================================================================
// Strategies for generating operations
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put { priority: i32, durable: bool, size: usize },
    PutBatch(Vec<(i32, bool)>),
    RemoveHead(u64),
    RemoveAt(usize),
    RemoveUnknown,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0i32..6, any::<bool>(), 1usize..64).prop_map(|(priority, durable, size)| Op::Put { priority, durable, size }),
        2 => prop::collection::vec((0i32..6, any::<bool>()), 1..6).prop_map(Op::PutBatch),
        2 => (1u64..4).prop_map(Op::RemoveHead),
        2 => any::<usize>().prop_map(Op::RemoveAt),
        1 => Just(Op::RemoveUnknown),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn sorted(entries: &[QueueEntry]) -> Vec<u64> {
    let mut entries = entries.to_vec();
    entries.sort_by_key(QueueEntry::key);
    entries.iter().map(|e| e.id.as_u64()).collect()
}

// =============================================================================
// Model checks
// =============================================================================

struct Run {
    queue: Arc<CacheQueue>,
    transient: Arc<MemoryQueueStore>,
    persistent: Arc<MemoryQueueStore>,
    model: Vec<QueueEntry>,
}

impl Run {
    async fn apply(&mut self, op: Op) {
        match op {
            Op::Put { priority, durable, size } => {
                let entry = QueueEntry::new(priority, durable, vec![0; size]);
                self.queue.put_entry(entry.clone(), false).await.unwrap();
                self.model.push(entry);
            }
            Op::PutBatch(specs) => {
                let batch: Vec<QueueEntry> = specs
                    .into_iter()
                    .map(|(priority, durable)| QueueEntry::new(priority, durable, vec![1; 8]))
                    .collect();
                self.queue.put(&batch, false).await.unwrap();
                self.model.extend(batch);
            }
            Op::RemoveHead(n) => {
                let removed = self.queue.remove(Some(n), None).await.unwrap();
                assert_eq!(removed, n.min(self.model.len() as u64));
                self.model.sort_by_key(QueueEntry::key);
                self.model.drain(..removed as usize);
            }
            Op::RemoveAt(index) => {
                if self.model.is_empty() {
                    return;
                }
                let entry = self.model.remove(index % self.model.len());
                assert!(self.queue.remove_random_entry(&entry).await.unwrap());
                assert!(!self.queue.remove_random_entry(&entry).await.unwrap());
            }
            Op::RemoveUnknown => {
                let ghost = QueueEntry::new(3, true, vec![2; 4]);
                assert!(!self.queue.remove_random_entry(&ghost).await.unwrap());
            }
        }
    }

    async fn check(&self, max_entries_cache: usize) {
        let expected_bytes: u64 = self.model.iter().map(|e| e.size_bytes).sum();
        let expected_durable = self.model.iter().filter(|e| e.durable).count() as u64;
        assert_eq!(self.queue.num_entries().await, self.model.len() as u64);
        assert_eq!(self.queue.num_bytes().await, expected_bytes);
        assert_eq!(self.queue.num_durable_entries().await, expected_durable);

        // cache holds the head of the queue
        let cached = self.transient.snapshot();
        let order = sorted(&self.model);
        let head: Vec<u64> = order.iter().take(cached.len()).copied().collect();
        assert_eq!(cached.iter().map(|e| e.id.as_u64()).collect::<Vec<_>>(), head);
        if cached.len() < max_entries_cache {
            assert_eq!(cached.len(), self.model.len());
        }

        // every durable entry is in the persistent store exactly once
        let stored: Vec<u64> = self.persistent.snapshot().iter().map(|e| e.id.as_u64()).collect();
        let unique: HashSet<u64> = stored.iter().copied().collect();
        assert_eq!(unique.len(), stored.len());
        assert!(self.model.iter().filter(|e| e.durable).all(|e| unique.contains(&e.id.as_u64())));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Accounting, cache-head and ordering hold after every operation.
    #[test]
    fn prop_queue_matches_model(
        max_entries_cache in 1usize..5,
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        runtime().block_on(async {
            let config = CacheQueueConfig {
                max_entries: 10_000,
                max_entries_cache: max_entries_cache as u64,
                ..Default::default()
            };
            let transient = Arc::new(MemoryQueueStore::new());
            let persistent = Arc::new(MemoryQueueStore::new());
            let queue = CacheQueue::open("prop", &config, transient.clone(), persistent.clone())
                .await
                .unwrap();
            let mut run = Run { queue, transient, persistent, model: Vec::new() };

            for op in ops {
                run.apply(op).await;
                run.check(max_entries_cache).await;
            }

            let mut drained = Vec::new();
            while let Some(head) = run.queue.peek().await.unwrap() {
                assert!(run.queue.remove_random_entry(&head).await.unwrap());
                drained.push(head.id.as_u64());
            }
            assert_eq!(drained, sorted(&run.model));
            assert!(run.persistent.is_empty());
        });
    }

    /// Peek budgets: the first entry is always returned, the rest only
    /// while they fit.
    #[test]
    fn prop_peek_budget(
        sizes in prop::collection::vec(1usize..100, 1..20),
        num_entries in 1usize..10,
        num_bytes in 0u64..500,
    ) {
        runtime().block_on(async {
            let queue = CacheQueue::open(
                "budget",
                &CacheQueueConfig::default(),
                Arc::new(MemoryQueueStore::new()),
                Arc::new(MemoryQueueStore::new()),
            )
            .await
            .unwrap();
            let entries: Vec<QueueEntry> = sizes.iter().map(|&s| QueueEntry::new(1, false, vec![0; s])).collect();
            queue.put(&entries, false).await.unwrap();

            let peeked = queue.peek_entries(Some(num_entries), Some(num_bytes)).await.unwrap();
            assert!(!peeked.is_empty());
            assert!(peeked.len() <= num_entries);
            let total: u64 = peeked.iter().map(|e| e.size_bytes).sum();
            assert!(peeked.len() == 1 || total <= num_bytes);
        });
    }
}
