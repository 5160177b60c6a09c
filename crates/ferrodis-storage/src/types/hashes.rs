//! Hashes, one data record per field

use super::{live_meta, prefix_bounds, scan_count};
use crate::cf::{HASHES_DATA, META};
use crate::coding::{MetaValue, data_key, data_prefix};
use crate::compaction::as_slices;
use crate::error::Result;
use crate::instance::Engine;
use crate::util::{now_ms, string_match};
use ferrodis_common::DataType;
use redb::ReadableTable;
use std::time::Instant;

impl Engine {
    /// Set one field, returning true when the field is new
    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let created = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(HASHES_DATA)?;
            let mut meta = live_meta(&meta_table, key, DataType::Hashes, now)?
                .unwrap_or_else(|| MetaValue::collection(DataType::Hashes, self.versions.next()));
            let field_key = data_key(DataType::Hashes, key, meta.version, field);
            let created = data.insert(field_key.as_slice(), value)?.is_none();
            if created {
                meta.count += 1;
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            created
        };
        self.commit(txn)?;
        Ok(created)
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::Hashes, now_ms())? else {
            return Ok(None);
        };
        let data = txn.open_table(HASHES_DATA)?;
        let field_key = data_key(DataType::Hashes, key, meta.version, field);
        Ok(data.get(field_key.as_slice())?.map(|v| v.value().to_vec()))
    }

    /// Remove fields, returning how many existed
    pub fn hdel(&self, key: &[u8], fields: &[&[u8]]) -> Result<u64> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let removed = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(HASHES_DATA)?;
            let Some(mut meta) = live_meta(&meta_table, key, DataType::Hashes, now)? else {
                return Ok(0);
            };
            let mut removed = 0;
            for field in fields {
                let field_key = data_key(DataType::Hashes, key, meta.version, field);
                if data.remove(field_key.as_slice())?.is_some() {
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

        self.statistics
            .record_mutation(DataType::Hashes, key, removed);
        Ok(removed)
    }

    pub fn hlen(&self, key: &[u8]) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        Ok(live_meta(&meta_table, key, DataType::Hashes, now_ms())?.map_or(0, |m| m.count))
    }

    pub fn hgetall(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let started = Instant::now();
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::Hashes, now_ms())? else {
            return Ok(Vec::new());
        };

        let data = txn.open_table(HASHES_DATA)?;
        let prefix = data_prefix(DataType::Hashes, key, meta.version);
        let bounds = prefix_bounds(&prefix, b"");
        let mut pairs = Vec::with_capacity(meta.count as usize);
        for entry in data.range::<&[u8]>(as_slices(&bounds))? {
            let (k, v) = entry?;
            pairs.push((k.value()[prefix.len()..].to_vec(), v.value().to_vec()));
        }

        self.statistics.record_duration(
            DataType::Hashes,
            key,
            started.elapsed().as_micros() as u64,
        );
        Ok(pairs)
    }

    /// Iterate the fields of a hash. Returns the next cursor (0 once
    /// complete) and the matching pairs among `count` fields examined.
    pub fn hscan(
        &self,
        key: &[u8],
        cursor: u64,
        pattern: &[u8],
        count: usize,
    ) -> Result<(u64, Vec<(Vec<u8>, Vec<u8>)>)> {
        let count = scan_count(count);
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::Hashes, now_ms())? else {
            return Ok((0, Vec::new()));
        };

        let (position, start) = self.scan_start(DataType::Hashes, key, pattern, cursor);
        let data = txn.open_table(HASHES_DATA)?;
        let prefix = data_prefix(DataType::Hashes, key, meta.version);
        let bounds = prefix_bounds(&prefix, &start);
        let mut pairs = Vec::new();
        let mut next = None;
        let mut examined = 0;
        for entry in data.range::<&[u8]>(as_slices(&bounds))? {
            let (k, v) = entry?;
            let field = &k.value()[prefix.len()..];
            if examined == count {
                next = Some(field.to_vec());
                break;
            }
            examined += 1;
            if string_match(pattern, field, false) {
                pairs.push((field.to_vec(), v.value().to_vec()));
            }
        }

        let cursor = self.scan_next(DataType::Hashes, key, pattern, position, count, next);
        Ok((cursor, pairs))
    }
}
