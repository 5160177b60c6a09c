//! Sets, one data record per member with an empty value

use super::{live_meta, prefix_bounds, scan_count};
use crate::cf::{META, SETS_DATA};
use crate::coding::{MetaValue, data_key, data_prefix};
use crate::compaction::as_slices;
use crate::error::Result;
use crate::instance::Engine;
use crate::util::{now_ms, string_match};
use ferrodis_common::{BgTask, DataType};
use rand::seq::SliceRandom;
use redb::ReadableTable;
use std::time::Instant;
use tracing::debug;

/// SPOP calls on one key between two compactions of that key
const SPOP_COMPACT_THRESHOLD: u64 = 500;

impl Engine {
    /// Add members, returning how many were new
    pub fn sadd(&self, key: &[u8], members: &[&[u8]]) -> Result<u64> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let added = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(SETS_DATA)?;
            let mut meta = live_meta(&meta_table, key, DataType::Sets, now)?
                .unwrap_or_else(|| MetaValue::collection(DataType::Sets, self.versions.next()));
            let mut added = 0;
            for member in members {
                let member_key = data_key(DataType::Sets, key, meta.version, member);
                if data.insert(member_key.as_slice(), b"".as_slice())?.is_none() {
                    added += 1;
                }
            }
            if added > 0 {
                meta.count += added;
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            added
        };
        self.commit(txn)?;
        Ok(added)
    }

    /// Remove members, returning how many existed
    pub fn srem(&self, key: &[u8], members: &[&[u8]]) -> Result<u64> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let removed = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(SETS_DATA)?;
            let Some(mut meta) = live_meta(&meta_table, key, DataType::Sets, now)? else {
                return Ok(0);
            };
            let mut removed = 0;
            for member in members {
                let member_key = data_key(DataType::Sets, key, meta.version, member);
                if data.remove(member_key.as_slice())?.is_some() {
                    removed += 1;
                }
            }
            meta.count = meta.count.saturating_sub(removed);
            if meta.count == 0 {
                meta_table.remove(key)?;
            } else if removed > 0 {
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            removed
        };
        self.commit(txn)?;

        self.statistics.record_mutation(DataType::Sets, key, removed);
        Ok(removed)
    }

    pub fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::Sets, now_ms())? else {
            return Ok(false);
        };
        let data = txn.open_table(SETS_DATA)?;
        let member_key = data_key(DataType::Sets, key, meta.version, member);
        Ok(data.get(member_key.as_slice())?.is_some())
    }

    pub fn scard(&self, key: &[u8]) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        Ok(live_meta(&meta_table, key, DataType::Sets, now_ms())?.map_or(0, |m| m.count))
    }

    /// Every member, in byte order
    pub fn smembers(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let started = Instant::now();
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::Sets, now_ms())? else {
            return Ok(Vec::new());
        };

        let data = txn.open_table(SETS_DATA)?;
        let prefix = data_prefix(DataType::Sets, key, meta.version);
        let bounds = prefix_bounds(&prefix, b"");
        let mut members = Vec::with_capacity(meta.count as usize);
        for entry in data.range::<&[u8]>(as_slices(&bounds))? {
            let (k, _) = entry?;
            members.push(k.value()[prefix.len()..].to_vec());
        }

        self.statistics.record_duration(
            DataType::Sets,
            key,
            started.elapsed().as_micros() as u64,
        );
        Ok(members)
    }

    /// Remove and return up to `count` random members.
    ///
    /// Calls are counted per key and every 500th call queues a small
    /// compaction of the key.
    pub fn spop(&self, key: &[u8], count: u64) -> Result<Vec<Vec<u8>>> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let popped = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(SETS_DATA)?;
            let Some(mut meta) = live_meta(&meta_table, key, DataType::Sets, now)? else {
                return Ok(Vec::new());
            };

            let prefix = data_prefix(DataType::Sets, key, meta.version);
            let bounds = prefix_bounds(&prefix, b"");
            let mut members = Vec::with_capacity(meta.count as usize);
            for entry in data.range::<&[u8]>(as_slices(&bounds))? {
                let (k, _) = entry?;
                members.push(k.value()[prefix.len()..].to_vec());
            }

            let n = (count as usize).min(members.len());
            let (chosen, _) = members.partial_shuffle(&mut rand::thread_rng(), n);
            let popped = chosen.to_vec();
            for member in &popped {
                data.remove(data_key(DataType::Sets, key, meta.version, member).as_slice())?;
            }

            meta.count = meta.count.saturating_sub(popped.len() as u64);
            if meta.count == 0 {
                meta_table.remove(key)?;
            } else if !popped.is_empty() {
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            popped
        };
        self.commit(txn)?;

        if !popped.is_empty() {
            self.count_spop(key);
        }
        Ok(popped)
    }

    fn count_spop(&self, key: &[u8]) {
        let calls = self.spop_counts.lookup(&key.to_vec()).unwrap_or(0) + 1;
        if calls < SPOP_COMPACT_THRESHOLD {
            self.spop_counts.insert(key.to_vec(), calls);
            return;
        }
        self.spop_counts.remove(&key.to_vec());
        if self.schedule(BgTask::compact_key(DataType::Sets, key)) {
            debug!("db{}: scheduled compaction after {} spop calls", self.index, calls);
        }
    }

    /// Iterate the members of a set. Returns the next cursor (0 once
    /// complete) and the matching members among `count` examined.
    pub fn sscan(
        &self,
        key: &[u8],
        cursor: u64,
        pattern: &[u8],
        count: usize,
    ) -> Result<(u64, Vec<Vec<u8>>)> {
        let count = scan_count(count);
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::Sets, now_ms())? else {
            return Ok((0, Vec::new()));
        };

        let (position, start) = self.scan_start(DataType::Sets, key, pattern, cursor);
        let data = txn.open_table(SETS_DATA)?;
        let prefix = data_prefix(DataType::Sets, key, meta.version);
        let bounds = prefix_bounds(&prefix, &start);
        let mut members = Vec::new();
        let mut next = None;
        let mut examined = 0;
        for entry in data.range::<&[u8]>(as_slices(&bounds))? {
            let (k, _) = entry?;
            let member = &k.value()[prefix.len()..];
            if examined == count {
                next = Some(member.to_vec());
                break;
            }
            examined += 1;
            if string_match(pattern, member, false) {
                members.push(member.to_vec());
            }
        }

        let cursor = self.scan_next(DataType::Sets, key, pattern, position, count, next);
        Ok((cursor, members))
    }
}
