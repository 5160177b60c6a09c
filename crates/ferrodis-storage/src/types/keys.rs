//! Commands that apply to a key of any type

use super::{read_meta, scan_count};
use crate::cf::META;
use crate::coding::MetaValue;
use crate::error::Result;
use crate::instance::Engine;
use crate::util::{now_ms, string_match};
use ferrodis_common::DataType;

impl Engine {
    /// Delete keys, returning how many live keys were removed.
    ///
    /// Only the meta record goes away; the elements of a composite key are
    /// reclaimed by compaction once the generation is orphaned.
    pub fn del(&self, keys: &[&[u8]]) -> Result<u64> {
        let _guard = self.lock_mgr.lock_many(keys);
        let now = now_ms();
        let mut orphaned = Vec::new();
        let mut removed = 0;

        let txn = self.begin_write()?;
        {
            let mut meta_table = txn.open_table(META)?;
            for key in keys {
                let Some(meta) = read_meta(&meta_table, key)? else {
                    continue;
                };
                meta_table.remove(*key)?;
                if meta.is_expired(now) {
                    continue;
                }
                removed += 1;
                if meta.data_type.is_composite() {
                    orphaned.push((meta.data_type, *key, meta.count));
                }
            }
        }
        self.commit(txn)?;

        for (data_type, key, count) in orphaned {
            self.statistics.record_mutation(data_type, key, count);
        }
        Ok(removed)
    }

    /// Number of the given keys that are live
    pub fn exists(&self, keys: &[&[u8]]) -> Result<u64> {
        let now = now_ms();
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let mut found = 0;
        for key in keys {
            if read_meta(&meta_table, key)?.is_some_and(|m| !m.is_expired(now)) {
                found += 1;
            }
        }
        Ok(found)
    }

    /// Type of a key, [`DataType::None`] when absent or expired
    pub fn key_type(&self, key: &[u8]) -> Result<DataType> {
        let now = now_ms();
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        Ok(match read_meta(&meta_table, key)? {
            Some(meta) if !meta.is_expired(now) => meta.data_type,
            _ => DataType::None,
        })
    }

    /// Set a key's time to live. A non-positive TTL deletes the key.
    pub fn expire(&self, key: &[u8], secs: i64) -> Result<bool> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let orphaned = {
            let mut meta_table = txn.open_table(META)?;
            let Some(mut meta) = read_meta(&meta_table, key)?.filter(|m| !m.is_expired(now)) else {
                return Ok(false);
            };
            if secs <= 0 {
                meta_table.remove(key)?;
                Some(meta)
            } else {
                meta.expire_at_ms = now.saturating_add((secs as u64).saturating_mul(1000));
                meta_table.insert(key, meta.encode().as_slice())?;
                None
            }
        };
        self.commit(txn)?;

        if let Some(meta) = orphaned.filter(|m| m.data_type.is_composite()) {
            self.statistics
                .record_mutation(meta.data_type, key, meta.count);
        }
        Ok(true)
    }

    /// Remaining lifetime in seconds: -2 when absent, -1 when persistent
    pub fn ttl(&self, key: &[u8]) -> Result<i64> {
        let now = now_ms();
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        Ok(match read_meta(&meta_table, key)? {
            Some(meta) if !meta.is_expired(now) => match meta.remaining_ttl_ms(now) {
                Some(ms) => ((ms + 500) / 1000) as i64,
                None => -1,
            },
            _ => -2,
        })
    }

    /// Remove a key's TTL, returning whether it had one
    pub fn persist(&self, key: &[u8]) -> Result<bool> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        {
            let mut meta_table = txn.open_table(META)?;
            let Some(mut meta) = read_meta(&meta_table, key)?
                .filter(|m| !m.is_expired(now) && m.expire_at_ms != 0)
            else {
                return Ok(false);
            };
            meta.expire_at_ms = 0;
            meta_table.insert(key, meta.encode().as_slice())?;
        }
        self.commit(txn)?;
        Ok(true)
    }

    /// Iterate the keyspace. Returns the next cursor (0 once complete) and
    /// the live keys matching `pattern` among the `count` records examined.
    pub fn scan(&self, cursor: u64, pattern: &[u8], count: usize) -> Result<(u64, Vec<Vec<u8>>)> {
        let count = scan_count(count);
        let (position, start) = self.scan_start(DataType::None, b"", pattern, cursor);
        let now = now_ms();

        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let mut keys = Vec::new();
        let mut next = None;
        let mut examined = 0;
        for entry in meta_table.range::<&[u8]>(start.as_slice()..)? {
            let (key, value) = entry?;
            if examined == count {
                next = Some(key.value().to_vec());
                break;
            }
            examined += 1;
            let live = MetaValue::decode(value.value())
                .is_ok_and(|m| !m.is_expired(now));
            if live && string_match(pattern, key.value(), false) {
                keys.push(key.value().to_vec());
            }
        }

        let cursor = self.scan_next(DataType::None, b"", pattern, position, count, next);
        Ok((cursor, keys))
    }
}

#[cfg(test)]
mod tests {
    use crate::instance::tests::open_engine;
    use ferrodis_common::{DataType, StorageOptions};

    #[test]
    fn test_del_and_exists() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        engine.set(b"a", b"1").unwrap();
        engine.hset(b"b", b"f", b"v").unwrap();
        assert_eq!(engine.exists(&[b"a".as_slice(), b"b", b"c"]).unwrap(), 2);
        assert_eq!(engine.del(&[b"a".as_slice(), b"b", b"c", b"a"]).unwrap(), 2);
        assert_eq!(engine.exists(&[b"a".as_slice(), b"b"]).unwrap(), 0);
        assert_eq!(engine.key_type(b"b").unwrap(), DataType::None);
    }

    #[test]
    fn test_key_type() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        engine.set(b"s", b"v").unwrap();
        engine.rpush(b"l", &[b"x".as_slice()]).unwrap();
        engine.zadd(b"z", &[(1.0, b"m".as_slice())]).unwrap();
        assert_eq!(engine.key_type(b"s").unwrap(), DataType::Strings);
        assert_eq!(engine.key_type(b"l").unwrap(), DataType::Lists);
        assert_eq!(engine.key_type(b"z").unwrap(), DataType::ZSets);
    }

    #[test]
    fn test_expire_ttl_persist() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        assert_eq!(engine.ttl(b"k").unwrap(), -2);
        assert!(!engine.expire(b"k", 10).unwrap());

        engine.set(b"k", b"v").unwrap();
        assert_eq!(engine.ttl(b"k").unwrap(), -1);
        assert!(engine.expire(b"k", 100).unwrap());
        assert_eq!(engine.ttl(b"k").unwrap(), 100);
        assert!(engine.persist(b"k").unwrap());
        assert!(!engine.persist(b"k").unwrap());
        assert_eq!(engine.ttl(b"k").unwrap(), -1);

        assert!(engine.expire(b"k", 0).unwrap());
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_del_feeds_statistics() {
        let options = StorageOptions {
            small_compaction_threshold: 3,
            small_compaction_duration_threshold: 0,
            ..StorageOptions::default()
        };
        let (_dir, engine, rx) = open_engine(options);
        engine
            .sadd(b"s", &[b"1".as_slice(), b"2".as_slice(), b"3".as_slice()])
            .unwrap();
        engine.del(&[b"s".as_slice()]).unwrap();
        let task = rx.try_recv().unwrap();
        assert_eq!(task.data_type, DataType::Sets);
        assert!(task.is_single_key());
        assert_eq!(task.begin, b"s");
    }

    #[test]
    fn test_scan_pages_and_restart() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        for i in 0..25 {
            engine.set(format!("key:{i:02}").as_bytes(), b"v").unwrap();
        }
        engine.set(b"other", b"v").unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = engine.scan(cursor, b"key:*", 10).unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            assert_eq!(next, cursor + 10);
            cursor = next;
        }
        assert_eq!(seen.len(), 25);

        // an unknown cursor starts over
        let (_, keys) = engine.scan(12345, b"*", 100).unwrap();
        assert_eq!(keys.len(), 26);
    }
}
