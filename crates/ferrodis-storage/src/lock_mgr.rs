//! Per-key mutual exclusion
//!
//! Keys hash onto a fixed number of mutex shards. Commands that read, modify
//! and write one logical key hold its shard for the whole sequence; unrelated
//! keys only contend when they share a shard.
//!
//! Commands touching several keys use [`LockMgr::lock_many`], which locks the
//! distinct shards in ascending index order. Every caller follows the same
//! order, so multi-key acquisition cannot deadlock.

use parking_lot::{Mutex, MutexGuard};
use xxhash_rust::xxh64::xxh64;

const SHARD_SEED: u64 = 0;

pub struct LockMgr {
    shards: Box<[Mutex<()>]>,
}

/// Guard over one key's shard
pub struct KeyLock<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Guard over the shards of several keys, released together
pub struct MultiKeyLock<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl LockMgr {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, key: &[u8]) -> usize {
        (xxh64(key, SHARD_SEED) % self.shards.len() as u64) as usize
    }

    /// Block until `key`'s shard is free and hold it until the guard drops
    pub fn lock(&self, key: &[u8]) -> KeyLock<'_> {
        KeyLock {
            _guard: self.shards[self.shard_index(key)].lock(),
        }
    }

    /// Lock every shard touched by `keys`, in ascending shard order
    pub fn lock_many<K: AsRef<[u8]>>(&self, keys: &[K]) -> MultiKeyLock<'_> {
        let mut indices: Vec<usize> = keys
            .iter()
            .map(|k| self.shard_index(k.as_ref()))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        MultiKeyLock {
            _guards: indices.into_iter().map(|i| self.shards[i].lock()).collect(),
        }
    }
}

impl Default for LockMgr {
    fn default() -> Self {
        Self::new(1000)
    }
}
