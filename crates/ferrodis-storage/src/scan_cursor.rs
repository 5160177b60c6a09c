//! Resumable scan positions
//!
//! SCAN-family commands hand clients a numeric cursor. The engine remembers
//! which key the next page starts from, keyed by everything that identifies
//! the scan. A miss is not an error: the scan restarts from the beginning.

use crate::lru::LruCache;
use ferrodis_common::DataType;

pub struct ScanCursorStore {
    cache: LruCache<Vec<u8>, Vec<u8>>,
}

impl ScanCursorStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// `type_tag '_' key '_' pattern '_' cursor`
    fn index_key(data_type: DataType, key: &[u8], pattern: &[u8], cursor: u64) -> Vec<u8> {
        let cursor = cursor.to_string();
        let mut index = Vec::with_capacity(key.len() + pattern.len() + cursor.len() + 4);
        index.push(data_type.tag());
        index.push(b'_');
        index.extend_from_slice(key);
        index.push(b'_');
        index.extend_from_slice(pattern);
        index.push(b'_');
        index.extend_from_slice(cursor.as_bytes());
        index
    }

    /// Start key of the page identified by `cursor`, if still remembered
    pub fn get_start_point(
        &self,
        data_type: DataType,
        key: &[u8],
        pattern: &[u8],
        cursor: u64,
    ) -> Option<Vec<u8>> {
        self.cache
            .lookup(&Self::index_key(data_type, key, pattern, cursor))
    }

    /// Remember where the page identified by `cursor` starts
    pub fn store_next_point(
        &self,
        data_type: DataType,
        key: &[u8],
        pattern: &[u8],
        cursor: u64,
        next_point: &[u8],
    ) {
        self.cache.insert(
            Self::index_key(data_type, key, pattern, cursor),
            next_point.to_vec(),
        );
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.cache.set_capacity(capacity);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_then_lookup() {
        let store = ScanCursorStore::new(16);
        store.store_next_point(DataType::Hashes, b"h", b"f*", 10, b"field9");
        assert_eq!(
            store.get_start_point(DataType::Hashes, b"h", b"f*", 10),
            Some(b"field9".to_vec())
        );
        // every component of the index matters
        assert_eq!(store.get_start_point(DataType::Sets, b"h", b"f*", 10), None);
        assert_eq!(store.get_start_point(DataType::Hashes, b"h", b"*", 10), None);
        assert_eq!(store.get_start_point(DataType::Hashes, b"h", b"f*", 11), None);
    }

    #[test]
    fn test_evicted_cursor_is_a_miss() {
        let store = ScanCursorStore::new(2);
        store.store_next_point(DataType::None, b"", b"*", 1, b"a");
        store.store_next_point(DataType::None, b"", b"*", 2, b"b");
        store.store_next_point(DataType::None, b"", b"*", 3, b"c");
        assert_eq!(store.len(), 2);
        assert_eq!(store.get_start_point(DataType::None, b"", b"*", 1), None);
        assert_eq!(
            store.get_start_point(DataType::None, b"", b"*", 3),
            Some(b"c".to_vec())
        );

        store.set_capacity(0);
        assert!(store.is_empty());
        assert_eq!(store.get_start_point(DataType::None, b"", b"*", 3), None);
    }
}
