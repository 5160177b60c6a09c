//! Per-key mutation statistics and the small-compaction scheduler
//!
//! Keys that are overwritten or trimmed often leave many obsolete records
//! behind. Instead of compacting the whole database, every mutation reports
//! how many records it made obsolete and how long the command spent; once a
//! key crosses both thresholds a narrow compaction of that key is queued and
//! its statistics are forgotten, so the heuristic re-arms from zero.
//!
//! Entries live in a bounded LRU. Losing one to eviction only delays the next
//! compaction of that key.

use crate::lru::LruCache;
use crossbeam_channel::{Sender, TrySendError};
use ferrodis_common::{BgTask, DataType};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Accumulated activity of one key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyStatistics {
    pub modify_count: u64,
    /// Microseconds
    pub cumulative_duration: u64,
}

impl KeyStatistics {
    pub fn add_modify_count(&mut self, count: u64) {
        self.modify_count = self.modify_count.saturating_add(count);
    }

    pub fn add_duration(&mut self, duration: u64) {
        self.cumulative_duration = self.cumulative_duration.saturating_add(duration);
    }
}

/// Statistics cache plus the scheduling predicate
pub struct StatisticsStore {
    cache: LruCache<Vec<u8>, KeyStatistics>,
    small_compaction_threshold: AtomicU64,
    small_compaction_duration_threshold: AtomicU64,
    tasks: Sender<BgTask>,
    scheduled: AtomicU64,
}

impl StatisticsStore {
    pub fn new(
        capacity: usize,
        small_compaction_threshold: u64,
        small_compaction_duration_threshold: u64,
        tasks: Sender<BgTask>,
    ) -> Self {
        Self {
            cache: LruCache::new(capacity),
            small_compaction_threshold: AtomicU64::new(small_compaction_threshold),
            small_compaction_duration_threshold: AtomicU64::new(
                small_compaction_duration_threshold,
            ),
            tasks,
            scheduled: AtomicU64::new(0),
        }
    }

    fn lookup_key(data_type: DataType, key: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(key.len() + 1);
        k.push(data_type.tag());
        k.extend_from_slice(key);
        k
    }

    fn enabled(&self) -> bool {
        self.cache.capacity() != 0 && self.small_compaction_threshold() != 0
    }

    /// Add `count` obsolete records to the key's statistics
    pub fn record_mutation(&self, data_type: DataType, key: &[u8], count: u64) {
        if count == 0 || !self.enabled() {
            return;
        }
        self.update(data_type, key, |stats| stats.add_modify_count(count));
    }

    /// Add `duration` microseconds to the key's statistics
    pub fn record_duration(&self, data_type: DataType, key: &[u8], duration: u64) {
        if duration == 0 || !self.enabled() || self.small_compaction_duration_threshold() == 0 {
            return;
        }
        self.update(data_type, key, |stats| stats.add_duration(duration));
    }

    fn update(&self, data_type: DataType, key: &[u8], apply: impl FnOnce(&mut KeyStatistics)) {
        let small_compaction_threshold = self.small_compaction_threshold();
        let duration_threshold = self.small_compaction_duration_threshold();
        // the entry is taken out under the cache lock, so one update wins
        let due = self.cache.update(Self::lookup_key(data_type, key), |stats| {
            apply(stats);
            stats.modify_count >= small_compaction_threshold
                && stats.cumulative_duration >= duration_threshold
        });
        if let Some(stats) = due {
            self.add_compact_task(data_type, key, stats);
        }
    }

    fn add_compact_task(&self, data_type: DataType, key: &[u8], stats: KeyStatistics) {
        match self.tasks.try_send(BgTask::compact_key(data_type, key)) {
            Ok(()) => {
                self.scheduled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "scheduled small compaction for {} key ({} mutations, {}us)",
                    data_type, stats.modify_count, stats.cumulative_duration
                );
            }
            Err(TrySendError::Full(_)) => {
                warn!("background task queue full, dropping small compaction for {data_type} key");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("background task queue closed, dropping small compaction for {data_type} key");
            }
        }
    }

    /// Current statistics of a key, if tracked
    pub fn get(&self, data_type: DataType, key: &[u8]) -> Option<KeyStatistics> {
        self.cache.lookup(&Self::lookup_key(data_type, key))
    }

    pub fn small_compaction_threshold(&self) -> u64 {
        self.small_compaction_threshold.load(Ordering::Relaxed)
    }

    pub fn small_compaction_duration_threshold(&self) -> u64 {
        self.small_compaction_duration_threshold.load(Ordering::Relaxed)
    }

    pub fn set_small_compaction_threshold(&self, threshold: u64) {
        self.small_compaction_threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn set_small_compaction_duration_threshold(&self, threshold: u64) {
        self.small_compaction_duration_threshold
            .store(threshold, Ordering::Relaxed);
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.cache.set_capacity(capacity);
    }

    /// Number of small compactions successfully queued
    pub fn scheduled_tasks(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use ferrodis_common::BgOperation;

    #[test]
    fn test_schedules_once_and_rearms() {
        let (tx, rx) = bounded(16);
        let store = StatisticsStore::new(100, 10, 50, tx);

        for _ in 0..9 {
            store.record_mutation(DataType::Hashes, b"hot", 1);
        }
        store.record_duration(DataType::Hashes, b"hot", 60);
        assert!(rx.is_empty());

        // count reaches the threshold with duration already past its own
        store.record_mutation(DataType::Hashes, b"hot", 1);
        let task = rx.try_recv().unwrap();
        assert_eq!(task.data_type, DataType::Hashes);
        assert_eq!(task.operation, BgOperation::CompactRange);
        assert_eq!(task.begin, b"hot");
        assert_eq!(task.end, b"hot");
        assert!(rx.is_empty());
        assert_eq!(store.get(DataType::Hashes, b"hot"), None);

        // re-armed from zero
        store.record_mutation(DataType::Hashes, b"hot", 1);
        assert_eq!(
            store.get(DataType::Hashes, b"hot"),
            Some(KeyStatistics {
                modify_count: 1,
                cumulative_duration: 0
            })
        );
        assert!(rx.is_empty());
    }

    #[test]
    fn test_concurrent_mutations_schedule_once_per_threshold() {
        use std::sync::Arc;
        use std::thread;

        let (tx, rx) = bounded(16);
        let store = Arc::new(StatisticsStore::new(100, 1000, 0, tx));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.record_mutation(DataType::Lists, b"busy", 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // 2000 mutations, no increment lost and no threshold crossed twice
        assert_eq!(rx.len(), 2);
        assert_eq!(store.scheduled_tasks(), 2);
        assert_eq!(store.get(DataType::Lists, b"busy"), None);
    }

    #[test]
    fn test_both_thresholds_required() {
        let (tx, rx) = bounded(16);
        let store = StatisticsStore::new(100, 5, 1000, tx);
        store.record_mutation(DataType::Sets, b"k", 100);
        assert!(rx.is_empty());
        store.record_duration(DataType::Sets, b"k", 999);
        assert!(rx.is_empty());
        store.record_duration(DataType::Sets, b"k", 1);
        assert_eq!(rx.len(), 1);
        assert_eq!(store.get(DataType::Sets, b"k"), None);
    }

    #[test]
    fn test_types_tracked_separately() {
        let (tx, _rx) = bounded(16);
        let store = StatisticsStore::new(100, 100, 100, tx);
        store.record_mutation(DataType::Lists, b"k", 3);
        store.record_mutation(DataType::ZSets, b"k", 4);
        assert_eq!(store.get(DataType::Lists, b"k").unwrap().modify_count, 3);
        assert_eq!(store.get(DataType::ZSets, b"k").unwrap().modify_count, 4);
    }

    #[test]
    fn test_zero_threshold_disables_tracking() {
        let (tx, rx) = bounded(16);
        let store = StatisticsStore::new(100, 0, 0, tx);
        store.record_mutation(DataType::Hashes, b"k", 1_000_000);
        store.record_duration(DataType::Hashes, b"k", 1_000_000);
        assert_eq!(store.get(DataType::Hashes, b"k"), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_zero_duration_threshold_gates_on_count_only() {
        let (tx, rx) = bounded(16);
        let store = StatisticsStore::new(100, 3, 0, tx);
        store.record_duration(DataType::Hashes, b"k", 500);
        assert_eq!(store.get(DataType::Hashes, b"k"), None);
        store.record_mutation(DataType::Hashes, b"k", 3);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_full_queue_is_not_fatal() {
        let (tx, rx) = bounded(1);
        let store = StatisticsStore::new(100, 1, 0, tx);
        store.record_mutation(DataType::Hashes, b"a", 1);
        store.record_mutation(DataType::Hashes, b"b", 1);
        assert_eq!(rx.len(), 1);
        assert_eq!(store.scheduled_tasks(), 1);
        // the dropped key was still forgotten so it re-arms
        assert_eq!(store.get(DataType::Hashes, b"b"), None);
    }
}
