//! Strings, stored inline in the meta record

use super::{live_meta, read_meta};
use crate::cf::META;
use crate::coding::MetaValue;
use crate::error::{Error, Result};
use crate::instance::Engine;
use crate::util::now_ms;
use ferrodis_common::DataType;

impl Engine {
    /// Store a string, replacing any previous value of any type and its TTL
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let replaced = {
            let mut meta_table = txn.open_table(META)?;
            // an unreadable record is simply overwritten
            let previous = read_meta(&meta_table, key).ok().flatten();
            let meta = MetaValue::string(self.versions.next(), value);
            meta_table.insert(key, meta.encode().as_slice())?;
            previous.filter(|m| m.data_type.is_composite() && !m.is_expired(now))
        };
        self.commit(txn)?;

        if let Some(old) = replaced {
            self.statistics.record_mutation(old.data_type, key, old.count);
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        Ok(live_meta(&meta_table, key, DataType::Strings, now_ms())?.map(|m| m.payload))
    }

    /// Add `delta` to the integer stored at `key`, creating it at 0. The TTL
    /// of an existing key is kept.
    pub fn incrby(&self, key: &[u8], delta: i64) -> Result<i64> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let value = {
            let mut meta_table = txn.open_table(META)?;
            let (mut meta, current) = match live_meta(&meta_table, key, DataType::Strings, now)? {
                Some(meta) => {
                    let current = std::str::from_utf8(&meta.payload)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| {
                            Error::invalid_argument("value is not an integer or out of range")
                        })?;
                    (meta, current)
                }
                None => (MetaValue::string(self.versions.next(), b""), 0),
            };
            let value = current
                .checked_add(delta)
                .ok_or_else(|| Error::invalid_argument("increment or decrement would overflow"))?;
            meta.payload = value.to_string().into_bytes();
            meta_table.insert(key, meta.encode().as_slice())?;
            value
        };
        self.commit(txn)?;
        Ok(value)
    }
}
