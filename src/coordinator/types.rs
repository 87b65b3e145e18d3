//! Public types for the cache queue coordinator.

use std::fmt;

/// Whether the persistent store is currently part of the queue.
///
/// Use [`super::CacheQueue::connection_state()`] to read it or
/// [`super::CacheQueue::connection_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Persistent store reachable: swap and reload run, limits come from it
    Connected,
    /// Persistent store unreachable: the memory cache is the whole queue
    Disconnected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of a single store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: u64,
    pub bytes: u64,
    pub durable_entries: u64,
    pub durable_bytes: u64,
    pub max_entries: u64,
    pub max_bytes: u64,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} entries ({} durable), {}/{} bytes ({} durable)",
            self.entries, self.max_entries, self.durable_entries, self.bytes, self.max_bytes, self.durable_bytes
        )
    }
}

/// Consistent snapshot of a queue's accounting, taken under the queue lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_id: String,
    pub state: ConnectionState,
    /// Logical totals across both stores
    pub num_entries: u64,
    pub num_bytes: u64,
    pub num_durable_entries: u64,
    pub num_durable_bytes: u64,
    pub max_entries: u64,
    pub max_bytes: u64,
    pub transient: StoreStats,
    pub persistent: StoreStats,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "queue '{}' [{}]: {}/{} entries, {}/{} bytes",
            self.queue_id, self.state, self.num_entries, self.max_entries, self.num_bytes, self.max_bytes
        )?;
        writeln!(f, "  transient:  {}", self.transient)?;
        write!(f, "  persistent: {}", self.persistent)
    }
}
