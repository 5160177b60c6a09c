//! Storage engine configuration
//!
//! `StorageOptions` is read from the `[storage]` section of the daemon
//! configuration file. Every field has a default so partial files work.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options used to open one logical database
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Page cache size handed to the engine, in bytes
    pub block_cache_size: usize,
    /// Capacity of the per-key statistics cache (0 disables it)
    pub statistics_max_size: usize,
    /// Mutations on one key before a small compaction is scheduled
    pub small_compaction_threshold: u64,
    /// Accumulated microseconds on one key before a small compaction is scheduled
    pub small_compaction_duration_threshold: u64,
    /// Capacity of the scan cursor cache
    pub scan_cursors_max_size: usize,
    /// Number of per-key lock shards
    pub lock_shards: usize,
    /// Commit every write with immediate durability
    pub sync_writes: bool,
    /// Period of the background full compaction (0 = disabled)
    pub compaction_interval_secs: u64,
    /// Capacity of the background task queue
    pub bg_queue_capacity: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            block_cache_size: 64 * 1024 * 1024, // 64 MB
            statistics_max_size: 10_000,
            small_compaction_threshold: 5000,
            small_compaction_duration_threshold: 10_000,
            scan_cursors_max_size: 5000,
            lock_shards: 1000,
            sync_writes: true,
            compaction_interval_secs: 0,
            bg_queue_capacity: 1024,
        }
    }
}

impl StorageOptions {
    /// Background compaction period, if enabled
    #[must_use]
    pub fn compaction_interval(&self) -> Option<Duration> {
        (self.compaction_interval_secs > 0)
            .then(|| Duration::from_secs(self.compaction_interval_secs))
    }
}
