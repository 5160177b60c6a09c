//! Compaction filters
//!
//! Logical deletion only removes a meta record, and recreating a key only
//! bumps its version. The records left behind are reclaimed here: every
//! compaction pass asks a [`CompactionFilter`] whether each physical record is
//! still live.
//!
//! Construction is split in two phases. [`CompactionFilterFactory`]s are built
//! with the rest of the column family configuration, before the database
//! exists, and share one [`HandleTable`]. The engine binds the opened database
//! into that table once open succeeds; only then does the compaction driver
//! ask a factory for a filter.

use crate::cf::{ColumnFamily, META};
use crate::coding::{DataKey, MetaValue};
use crate::error::{Error, Result};
use ferrodis_common::DataType;
use redb::{Database, ReadOnlyTable, ReadTransaction, ReadableTable};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Outcome of filtering one record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Remove,
}

/// Filtering strategy, one per column family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Meta,
    HashesData,
    SetsMember,
    ListsData,
    ZSetsData,
    ZSetsScore,
}

impl FilterKind {
    pub const fn for_cf(cf: ColumnFamily) -> Self {
        match cf {
            ColumnFamily::Meta => Self::Meta,
            ColumnFamily::HashesData => Self::HashesData,
            ColumnFamily::SetsData => Self::SetsMember,
            ColumnFamily::ListsData => Self::ListsData,
            ColumnFamily::ZSetsData => Self::ZSetsData,
            ColumnFamily::ZSetsScore => Self::ZSetsScore,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Meta => "MetaFilter",
            Self::HashesData => "HashesDataFilter",
            Self::SetsMember => "SetsMemberFilter",
            Self::ListsData => "ListsDataFilter",
            Self::ZSetsData => "ZSetsDataFilter",
            Self::ZSetsScore => "ZSetsScoreFilter",
        }
    }

    /// Type whose meta records govern this filter's data records
    pub const fn data_type(self) -> DataType {
        match self {
            Self::Meta => DataType::None,
            Self::HashesData => DataType::Hashes,
            Self::SetsMember => DataType::Sets,
            Self::ListsData => DataType::Lists,
            Self::ZSetsData | Self::ZSetsScore => DataType::ZSets,
        }
    }
}

/// Database handle shared by every filter factory, bound after open
#[derive(Default)]
pub struct HandleTable {
    db: OnceLock<Arc<Database>>,
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the opened database. Binding twice is an error.
    pub fn bind(&self, db: Arc<Database>) -> Result<()> {
        self.db
            .set(db)
            .map_err(|_| Error::invalid_argument("handle table already bound"))
    }

    pub fn database(&self) -> Option<&Arc<Database>> {
        self.db.get()
    }

    pub fn is_bound(&self) -> bool {
        self.db.get().is_some()
    }
}

/// State of a meta record as seen by a filter
#[derive(Clone, Debug, PartialEq)]
pub enum MetaState {
    Absent,
    /// Present but could not be read or decoded
    Unreadable,
    Present(MetaValue),
}

/// Read access to meta records
pub trait MetaLookup {
    fn lookup_meta(&self, user_key: &[u8]) -> MetaState;
}

impl MetaLookup for ReadOnlyTable<&'static [u8], &'static [u8]> {
    fn lookup_meta(&self, user_key: &[u8]) -> MetaState {
        match self.get(user_key) {
            Ok(Some(raw)) => match MetaValue::decode(raw.value()) {
                Ok(meta) => MetaState::Present(meta),
                Err(_) => MetaState::Unreadable,
            },
            Ok(None) => MetaState::Absent,
            Err(_) => MetaState::Unreadable,
        }
    }
}

/// Decide the fate of a meta record. Expired metas go; anything else,
/// including values that fail to decode, stays.
pub fn decide_meta(value: &[u8], now_ms: u64) -> Decision {
    match MetaValue::decode(value) {
        Ok(meta) if meta.is_expired(now_ms) => Decision::Remove,
        _ => Decision::Keep,
    }
}

/// Decide the fate of a data record of `data_type`.
///
/// The record is removed when its meta record is absent or belongs to another
/// type, when the versions differ, or when the meta record has expired. A meta
/// record that cannot be read counts as absent: a failing meta read reclaims
/// space instead of keeping possibly dead data around. Data keys that do not
/// decode are kept.
pub fn decide_data(
    data_type: DataType,
    raw_key: &[u8],
    metas: &impl MetaLookup,
    now_ms: u64,
) -> Decision {
    let Some(key) = DataKey::decode(raw_key) else {
        return Decision::Keep;
    };
    if key.data_type != data_type {
        return Decision::Keep;
    }
    match metas.lookup_meta(key.user_key) {
        MetaState::Present(meta) if meta.data_type == data_type => {
            if meta.version != key.version || meta.is_expired(now_ms) {
                Decision::Remove
            } else {
                Decision::Keep
            }
        }
        MetaState::Present(_) | MetaState::Absent | MetaState::Unreadable => Decision::Remove,
    }
}

/// Builds one [`CompactionFilter`] per compaction pass
#[derive(Debug, Clone)]
pub struct CompactionFilterFactory {
    kind: FilterKind,
    handles: Arc<HandleTable>,
}

impl CompactionFilterFactory {
    pub fn new(kind: FilterKind, handles: Arc<HandleTable>) -> Self {
        Self { kind, handles }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Create a filter evaluating expiration against `now_ms`.
    ///
    /// Data filters open a read snapshot of the meta column family. Callers
    /// that want the snapshot to match what they will write must begin their
    /// write transaction first.
    pub fn create_filter(&self, now_ms: u64) -> Result<CompactionFilter> {
        let snapshot = match self.kind {
            FilterKind::Meta => None,
            _ => {
                let db = self
                    .handles
                    .database()
                    .ok_or_else(|| Error::busy("compaction filter used before open"))?;
                let txn = db.begin_read()?;
                let table = txn.open_table(META)?;
                Some(MetaSnapshot { table, _txn: txn })
            }
        };
        Ok(CompactionFilter {
            kind: self.kind,
            now_ms,
            snapshot,
            examined: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }
}

struct MetaSnapshot {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    _txn: ReadTransaction,
}

/// Keep/remove predicate for one compaction pass over one column family
pub struct CompactionFilter {
    kind: FilterKind,
    now_ms: u64,
    snapshot: Option<MetaSnapshot>,
    examined: AtomicU64,
    dropped: AtomicU64,
}

impl CompactionFilter {
    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn filter(&self, key: &[u8], value: &[u8]) -> Decision {
        self.examined.fetch_add(1, Ordering::Relaxed);
        let decision = match (&self.snapshot, self.kind) {
            (_, FilterKind::Meta) => decide_meta(value, self.now_ms),
            (Some(snapshot), kind) => {
                decide_data(kind.data_type(), key, &snapshot.table, self.now_ms)
            }
            (None, _) => Decision::Keep,
        };
        if decision == Decision::Remove {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    /// True when the record should stay, in the shape `Table::retain` wants
    pub fn keep(&self, key: &[u8], value: &[u8]) -> bool {
        self.filter(key, value) == Decision::Keep
    }

    pub fn examined(&self) -> u64 {
        self.examined.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{data_key, list_key, score_key};
    use redb::ReadableTableMetadata;
    use std::collections::HashMap;
    use tempfile::tempdir;

    impl MetaLookup for HashMap<Vec<u8>, Vec<u8>> {
        fn lookup_meta(&self, user_key: &[u8]) -> MetaState {
            match self.get(user_key) {
                Some(raw) => {
                    MetaValue::decode(raw).map_or(MetaState::Unreadable, MetaState::Present)
                }
                None => MetaState::Absent,
            }
        }
    }

    const NOW: u64 = 1_700_000_000_000;

    fn metas(entries: &[(&[u8], MetaValue)]) -> HashMap<Vec<u8>, Vec<u8>> {
        entries
            .iter()
            .map(|(k, m)| (k.to_vec(), m.encode()))
            .collect()
    }

    #[test]
    fn test_data_filter_drop_conditions() {
        let mut expired = MetaValue::collection(DataType::Hashes, 5);
        expired.expire_at_ms = NOW - 1;
        let mut future = MetaValue::collection(DataType::Hashes, 5);
        future.expire_at_ms = NOW + 60_000;
        let mut table = metas(&[
            (b"live", MetaValue::collection(DataType::Hashes, 5)),
            (b"expired", expired),
            (b"ttl", future),
            (b"set", MetaValue::collection(DataType::Sets, 5)),
        ]);
        table.insert(b"garbled".to_vec(), b"h\x01".to_vec());

        let cases: [(&[u8], u64, Decision); 7] = [
            (b"live", 5, Decision::Keep),
            (b"ttl", 5, Decision::Keep),
            (b"live", 4, Decision::Remove),
            (b"missing", 5, Decision::Remove),
            (b"expired", 5, Decision::Remove),
            (b"set", 5, Decision::Remove),
            (b"garbled", 5, Decision::Remove),
        ];
        for (key, version, expected) in cases {
            let raw = data_key(DataType::Hashes, key, version, b"field");
            assert_eq!(
                decide_data(DataType::Hashes, &raw, &table, NOW),
                expected,
                "key {:?} version {version}",
                String::from_utf8_lossy(key)
            );
        }
    }

    #[test]
    fn test_data_filter_keeps_malformed_keys() {
        let table = metas(&[]);
        assert_eq!(
            decide_data(DataType::Hashes, b"\x00junk", &table, NOW),
            Decision::Keep
        );
    }

    #[test]
    fn test_list_and_score_records() {
        let table = metas(&[
            (b"q", MetaValue::collection(DataType::Lists, 2)),
            (b"z", MetaValue::collection(DataType::ZSets, 3)),
        ]);
        assert_eq!(
            decide_data(DataType::Lists, &list_key(b"q", 2, 10), &table, NOW),
            Decision::Keep
        );
        assert_eq!(
            decide_data(DataType::Lists, &list_key(b"q", 1, 10), &table, NOW),
            Decision::Remove
        );
        assert_eq!(
            decide_data(DataType::ZSets, &score_key(b"z", 3, 1.5, b"m"), &table, NOW),
            Decision::Keep
        );
        assert_eq!(
            decide_data(DataType::ZSets, &score_key(b"z", 9, 1.5, b"m"), &table, NOW),
            Decision::Remove
        );
    }

    #[test]
    fn test_meta_filter() {
        let mut meta = MetaValue::string(1, b"v");
        assert_eq!(decide_meta(&meta.encode(), NOW), Decision::Keep);
        meta.expire_at_ms = NOW;
        assert_eq!(decide_meta(&meta.encode(), NOW), Decision::Remove);
        assert_eq!(decide_meta(b"?", NOW), Decision::Keep);
    }

    #[test]
    fn test_factory_requires_bound_handles() {
        let handles = Arc::new(HandleTable::new());
        let factory = CompactionFilterFactory::new(FilterKind::HashesData, handles.clone());
        assert!(factory.create_filter(NOW).is_err());

        // the meta filter never reads the handle table
        let meta_factory = CompactionFilterFactory::new(FilterKind::Meta, handles);
        assert!(meta_factory.create_filter(NOW).is_ok());
    }

    #[test]
    fn test_filter_reads_bound_database() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::create(dir.path().join("filter.redb")).unwrap());
        let txn = db.begin_write().unwrap();
        {
            let mut meta = txn.open_table(META).unwrap();
            let value = MetaValue::collection(DataType::Sets, 7).encode();
            meta.insert(&b"s"[..], value.as_slice()).unwrap();
            assert_eq!(meta.len().unwrap(), 1);
        }
        txn.commit().unwrap();

        let handles = Arc::new(HandleTable::new());
        handles.bind(db.clone()).unwrap();
        assert!(handles.bind(db).is_err());

        let factory = CompactionFilterFactory::new(FilterKind::SetsMember, handles);
        let filter = factory.create_filter(NOW).unwrap();
        assert!(filter.keep(&data_key(DataType::Sets, b"s", 7, b"m"), b""));
        assert!(!filter.keep(&data_key(DataType::Sets, b"s", 6, b"m"), b""));
        assert!(!filter.keep(&data_key(DataType::Sets, b"gone", 7, b"m"), b""));
        assert_eq!(filter.examined(), 3);
        assert_eq!(filter.dropped(), 2);
    }
}
