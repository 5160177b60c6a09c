//! Lists
//!
//! Elements of one generation occupy the sequence numbers strictly between
//! the meta record's left and right indices. Pushes grow the window outward
//! and pops or trims shrink it, so the elements of a list are always
//! contiguous.

use super::{live_meta, normalize_range};
use crate::cf::{LISTS_DATA, META};
use crate::coding::{MetaValue, list_key};
use crate::error::Result;
use crate::instance::Engine;
use crate::util::now_ms;
use ferrodis_common::DataType;
use redb::ReadableTable;
use std::time::Instant;

#[derive(Clone, Copy)]
enum End {
    Left,
    Right,
}

impl Engine {
    /// Prepend values one at a time, so the last value ends up first
    pub fn lpush(&self, key: &[u8], values: &[&[u8]]) -> Result<u64> {
        self.push(key, values, End::Left)
    }

    pub fn rpush(&self, key: &[u8], values: &[&[u8]]) -> Result<u64> {
        self.push(key, values, End::Right)
    }

    fn push(&self, key: &[u8], values: &[&[u8]], end: End) -> Result<u64> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let len = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(LISTS_DATA)?;
            let mut meta = live_meta(&meta_table, key, DataType::Lists, now)?
                .unwrap_or_else(|| MetaValue::collection(DataType::Lists, self.versions.next()));
            for value in values {
                let seq = match end {
                    End::Left => {
                        let seq = meta.left_index;
                        meta.left_index -= 1;
                        seq
                    }
                    End::Right => {
                        let seq = meta.right_index;
                        meta.right_index += 1;
                        seq
                    }
                };
                data.insert(list_key(key, meta.version, seq).as_slice(), *value)?;
                meta.count += 1;
            }
            if !values.is_empty() {
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            meta.count
        };
        self.commit(txn)?;
        Ok(len)
    }

    /// Remove and return up to `count` elements from the head
    pub fn lpop(&self, key: &[u8], count: u64) -> Result<Vec<Vec<u8>>> {
        self.pop(key, count, End::Left)
    }

    /// Remove and return up to `count` elements from the tail
    pub fn rpop(&self, key: &[u8], count: u64) -> Result<Vec<Vec<u8>>> {
        self.pop(key, count, End::Right)
    }

    fn pop(&self, key: &[u8], count: u64, end: End) -> Result<Vec<Vec<u8>>> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let popped = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(LISTS_DATA)?;
            let Some(mut meta) = live_meta(&meta_table, key, DataType::Lists, now)? else {
                return Ok(Vec::new());
            };
            let n = count.min(meta.count);
            let mut popped = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let seq = match end {
                    End::Left => {
                        meta.left_index += 1;
                        meta.left_index
                    }
                    End::Right => {
                        meta.right_index -= 1;
                        meta.right_index
                    }
                };
                if let Some(v) = data.remove(list_key(key, meta.version, seq).as_slice())? {
                    popped.push(v.value().to_vec());
                }
                meta.count -= 1;
            }
            if meta.count == 0 {
                meta_table.remove(key)?;
            } else if n > 0 {
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            popped
        };
        self.commit(txn)?;

        self.statistics
            .record_mutation(DataType::Lists, key, popped.len() as u64);
        Ok(popped)
    }

    pub fn llen(&self, key: &[u8]) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        Ok(live_meta(&meta_table, key, DataType::Lists, now_ms())?.map_or(0, |m| m.count))
    }

    /// Elements between `start` and `stop` inclusive; negative indices count
    /// from the tail
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let started = Instant::now();
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::Lists, now_ms())? else {
            return Ok(Vec::new());
        };
        let Some((first, last)) = normalize_range(start, stop, meta.count) else {
            return Ok(Vec::new());
        };

        let data = txn.open_table(LISTS_DATA)?;
        let lower = list_key(key, meta.version, meta.left_index + 1 + first);
        let upper = list_key(key, meta.version, meta.left_index + 1 + last);
        let mut values = Vec::with_capacity((last - first + 1) as usize);
        for entry in data.range::<&[u8]>(lower.as_slice()..=upper.as_slice())? {
            let (_, v) = entry?;
            values.push(v.value().to_vec());
        }

        self.statistics.record_duration(
            DataType::Lists,
            key,
            started.elapsed().as_micros() as u64,
        );
        Ok(values)
    }

    /// Keep only the elements between `start` and `stop` inclusive
    pub fn ltrim(&self, key: &[u8], start: i64, stop: i64) -> Result<()> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let trimmed = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(LISTS_DATA)?;
            let Some(mut meta) = live_meta(&meta_table, key, DataType::Lists, now)? else {
                return Ok(());
            };
            let first_seq = meta.left_index + 1;
            let (keep_from, keep_to) = match normalize_range(start, stop, meta.count) {
                Some((first, last)) => (first_seq + first, first_seq + last),
                // nothing survives
                None => (meta.right_index, meta.left_index),
            };
            let mut trimmed = 0;
            for seq in (first_seq..meta.right_index).filter(|s| *s < keep_from || *s > keep_to) {
                data.remove(list_key(key, meta.version, seq).as_slice())?;
                trimmed += 1;
            }
            meta.count -= trimmed;
            if meta.count == 0 {
                meta_table.remove(key)?;
            } else if trimmed > 0 {
                meta.left_index = keep_from - 1;
                meta.right_index = keep_to + 1;
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            trimmed
        };
        self.commit(txn)?;

        self.statistics.record_mutation(DataType::Lists, key, trimmed);
        Ok(())
    }
}
