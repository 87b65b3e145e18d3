// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue stores: the contract and the two reference tiers.

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::MemoryQueueStore;
pub use sql::SqlQueueStore;
pub use traits::{QueueStore, StorageError, StorageProblemListener, StorageStatus, StoreLimits};
