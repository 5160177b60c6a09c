//! Introspection: properties, the INFO block, key counts and database scans

use crate::cf::{
    ColumnFamily, HASHES_DATA, LISTS_DATA, META, SETS_DATA, ZSETS_DATA, ZSETS_SCORE,
};
use crate::coding::MetaValue;
use crate::error::{Error, Result};
use crate::instance::{DATA_FILE, Engine, Snapshot};
use crate::util::now_ms;
use ferrodis_common::{DataType, KeyInfo};
use redb::{ReadableTable, ReadableTableMetadata, TableStats};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Metrics of the INFO block, in output order: (property, metric name)
pub const INFO_METRICS: [(&str, &str); 26] = [
    ("rocksdb.num-immutable-mem-table", "num_immutable_mem_table"),
    ("rocksdb.num-immutable-mem-table-flushed", "num_immutable_mem_table_flushed"),
    ("rocksdb.mem-table-flush-pending", "mem_table_flush_pending"),
    ("rocksdb.num-running-flushes", "num_running_flushes"),
    ("rocksdb.compaction-pending", "compaction_pending"),
    ("rocksdb.num-running-compactions", "num_running_compactions"),
    ("rocksdb.background-errors", "background_errors"),
    ("rocksdb.cur-size-active-mem-table", "cur_size_active_mem_table"),
    ("rocksdb.cur-size-all-mem-tables", "cur_size_all_mem_tables"),
    ("rocksdb.size-all-mem-tables", "size_all_mem_tables"),
    ("rocksdb.estimate-num-keys", "estimate_num_keys"),
    ("rocksdb.estimate-table-readers-mem", "estimate_table_readers_mem"),
    ("rocksdb.num-snapshots", "num_snapshots"),
    ("rocksdb.num-live-versions", "num_live_versions"),
    ("rocksdb.current-super-version-number", "current_super_version_number"),
    ("rocksdb.estimate-live-data-size", "estimate_live_data_size"),
    ("rocksdb.total-sst-files-size", "total_sst_files_size"),
    ("rocksdb.live-sst-files-size", "live_sst_files_size"),
    ("rocksdb.estimate-pending-compaction-bytes", "estimate_pending_compaction_bytes"),
    ("rocksdb.block-cache-capacity", "block_cache_capacity"),
    ("rocksdb.block-cache-usage", "block_cache_usage"),
    ("rocksdb.block-cache-pinned-usage", "block_cache_pinned_usage"),
    ("rocksdb.num-blob-files", "num_blob_files"),
    ("rocksdb.blob-stats", "blob_stats"),
    ("rocksdb.total-blob-file-size", "total_blob_file_size"),
    ("rocksdb.live-blob-file-size", "live_blob_file_size"),
];

/// Size and shape of one column family
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CfUsage {
    pub entries: u64,
    pub stored_bytes: u64,
    pub metadata_bytes: u64,
    pub fragmented_bytes: u64,
    pub tree_height: u32,
    pub leaf_pages: u64,
    pub branch_pages: u64,
}

impl From<(u64, TableStats)> for CfUsage {
    fn from((entries, stats): (u64, TableStats)) -> Self {
        Self {
            entries,
            stored_bytes: stats.stored_bytes(),
            metadata_bytes: stats.metadata_bytes(),
            fragmented_bytes: stats.fragmented_bytes(),
            tree_height: stats.tree_height(),
            leaf_pages: stats.leaf_pages(),
            branch_pages: stats.branch_pages(),
        }
    }
}

/// Usage of the whole database, gathered once per property read
struct DbUsage {
    column_families: Vec<CfUsage>,
    file_size: u64,
}

impl DbUsage {
    fn sum(&self, f: impl Fn(&CfUsage) -> u64) -> u64 {
        self.column_families.iter().map(f).sum()
    }
}

/// One logical key seen by [`Engine::scan_database`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedKey {
    pub key: Vec<u8>,
    pub version: u64,
    /// Remaining lifetime in milliseconds, `None` when persistent
    pub ttl_ms: Option<u64>,
    pub expired: bool,
    /// Element count, or value length for strings
    pub size: u64,
}

/// Result of a full logical scan, grouped by type in `ScanKeyNum` order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatabaseScanReport {
    pub types: Vec<(DataType, Vec<ScannedKey>)>,
    /// Meta records that failed to decode
    pub corrupted: u64,
}

impl DatabaseScanReport {
    pub fn keys(&self, data_type: DataType) -> &[ScannedKey] {
        self.types
            .iter()
            .find(|(t, _)| *t == data_type)
            .map_or(&[], |(_, keys)| keys.as_slice())
    }
}

fn slot(data_type: DataType) -> Option<usize> {
    DataType::SCAN_ORDER.iter().position(|t| *t == data_type)
}

impl Engine {
    fn cf_usage(&self, snap: &Snapshot, cf: ColumnFamily) -> Result<CfUsage> {
        let usage = match cf {
            ColumnFamily::Meta => {
                let t = snap.open_table(META)?;
                (t.len()?, t.stats()?)
            }
            ColumnFamily::HashesData => {
                let t = snap.open_table(HASHES_DATA)?;
                (t.len()?, t.stats()?)
            }
            ColumnFamily::SetsData => {
                let t = snap.open_table(SETS_DATA)?;
                (t.len()?, t.stats()?)
            }
            ColumnFamily::ListsData => {
                let t = snap.open_table(LISTS_DATA)?;
                (t.len()?, t.stats()?)
            }
            ColumnFamily::ZSetsData => {
                let t = snap.open_table(ZSETS_DATA)?;
                (t.len()?, t.stats()?)
            }
            ColumnFamily::ZSetsScore => {
                let t = snap.open_table(ZSETS_SCORE)?;
                (t.len()?, t.stats()?)
            }
        };
        Ok(usage.into())
    }

    fn db_usage(&self) -> Result<DbUsage> {
        let snap = self.snapshot()?;
        let column_families = ColumnFamily::ALL
            .iter()
            .map(|cf| self.cf_usage(&snap, *cf))
            .collect::<Result<Vec<_>>>()?;
        let file_size = std::fs::metadata(self.path.join(DATA_FILE))?.len();
        Ok(DbUsage {
            column_families,
            file_size,
        })
    }

    fn property_with(&self, name: &str, usage: &DbUsage) -> Result<u64> {
        let value = match name {
            "rocksdb.num-immutable-mem-table"
            | "rocksdb.num-immutable-mem-table-flushed"
            | "rocksdb.mem-table-flush-pending"
            | "rocksdb.num-running-flushes"
            | "rocksdb.cur-size-active-mem-table"
            | "rocksdb.cur-size-all-mem-tables"
            | "rocksdb.size-all-mem-tables"
            | "rocksdb.estimate-table-readers-mem"
            | "rocksdb.block-cache-pinned-usage"
            | "rocksdb.num-blob-files"
            | "rocksdb.blob-stats"
            | "rocksdb.total-blob-file-size"
            | "rocksdb.live-blob-file-size" => 0,
            "rocksdb.compaction-pending" => u64::from(!self.bg_tasks.is_empty()),
            "rocksdb.num-running-compactions" => self.running_compactions.load(Ordering::Relaxed),
            "rocksdb.background-errors" => self.background_errors.load(Ordering::Relaxed),
            "rocksdb.estimate-num-keys" => usage.sum(|u| u.entries),
            // the snapshot taken to gather `usage` is already released
            "rocksdb.num-snapshots" => self.open_snapshots.load(Ordering::Relaxed),
            "rocksdb.num-live-versions" => self.open_snapshots.load(Ordering::Relaxed) + 1,
            "rocksdb.current-super-version-number" => self.commits.load(Ordering::Relaxed),
            "rocksdb.estimate-live-data-size" => usage.sum(|u| u.stored_bytes),
            "rocksdb.total-sst-files-size" => usage.file_size,
            "rocksdb.live-sst-files-size" => {
                usage.sum(|u| u.stored_bytes + u.metadata_bytes)
            }
            "rocksdb.estimate-pending-compaction-bytes" => usage.sum(|u| u.fragmented_bytes),
            "rocksdb.block-cache-capacity" => self.block_cache_size as u64,
            "rocksdb.block-cache-usage" => usage.file_size.min(self.block_cache_size as u64),
            other => {
                return Err(Error::invalid_argument(format!("unknown property: {other}")));
            }
        };
        Ok(value)
    }

    /// Numeric property by RocksDB-style name
    pub fn get_property(&self, name: &str) -> Result<u64> {
        let usage = self.db_usage()?;
        self.property_with(name, &usage)
    }

    /// Per column family statistics, sorted by key
    pub fn cf_stats(&self) -> Result<BTreeMap<String, String>> {
        let usage = self.db_usage()?;
        Ok(self.cf_stats_with(&usage))
    }

    fn cf_stats_with(&self, usage: &DbUsage) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        for (cf, u) in ColumnFamily::ALL.iter().zip(&usage.column_families) {
            let state = &self.cf_state[cf.index()];
            let values = [
                ("num-entries", u.entries),
                ("stored-bytes", u.stored_bytes),
                ("metadata-bytes", u.metadata_bytes),
                ("fragmented-bytes", u.fragmented_bytes),
                ("tree-height", u64::from(u.tree_height)),
                ("leaf-pages", u.leaf_pages),
                ("branch-pages", u.branch_pages),
                ("compactions", state.compactions.load(Ordering::Relaxed)),
                ("records-dropped", state.records_dropped.load(Ordering::Relaxed)),
            ];
            for (stat, value) in values {
                stats.insert(format!("{}.{stat}", cf.name()), value.to_string());
            }
        }
        stats
    }

    /// INFO block: a `#<prefix>RocksDB` header, one `<prefix><metric>:<value>`
    /// line per metric, then `<prefix><cf stat>: <value>` lines
    pub fn engine_info(&self, prefix: &str) -> Result<String> {
        let usage = self.db_usage()?;
        let mut out = String::new();
        let _ = write!(out, "#{prefix}RocksDB\r\n");
        for (property, metric) in INFO_METRICS {
            let value = self.property_with(property, &usage)?;
            let _ = write!(out, "{prefix}{metric}:{value}\r\n");
        }
        for (key, value) in self.cf_stats_with(&usage) {
            let _ = write!(out, "{prefix}{key}: {value}\r\n");
        }
        Ok(out)
    }

    /// Count keys per type, in the order Strings, Hashes, Lists, ZSets, Sets
    pub fn scan_key_num(&self) -> Result<[KeyInfo; 5]> {
        let now = now_ms();
        let mut infos = [KeyInfo::default(); 5];
        let mut ttl_sums = [0u64; 5];

        let snap = self.snapshot()?;
        let meta_table = snap.open_table(META)?;
        for entry in meta_table.iter()? {
            let (_, value) = entry?;
            let Ok(meta) = MetaValue::decode(value.value()) else {
                continue;
            };
            let Some(i) = slot(meta.data_type) else {
                continue;
            };
            if meta.is_expired(now) {
                infos[i].invalid_keys += 1;
                continue;
            }
            infos[i].keys += 1;
            if let Some(ttl) = meta.remaining_ttl_ms(now) {
                infos[i].expires += 1;
                ttl_sums[i] += ttl / 1000;
            }
        }

        for (info, sum) in infos.iter_mut().zip(ttl_sums) {
            if info.expires > 0 {
                info.avg_ttl = sum / info.expires;
            }
        }
        Ok(infos)
    }

    /// Walk every meta record and report each logical key.
    ///
    /// Diagnostic: every key is also logged at `info` level.
    pub fn scan_database(&self) -> Result<DatabaseScanReport> {
        let now = now_ms();
        let mut report = DatabaseScanReport {
            types: DataType::SCAN_ORDER.iter().map(|t| (*t, Vec::new())).collect(),
            corrupted: 0,
        };

        let snap = self.snapshot()?;
        let meta_table = snap.open_table(META)?;
        for entry in meta_table.iter()? {
            let (key, value) = entry?;
            let meta = match MetaValue::decode(value.value()) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(
                        "db{}: corrupted meta record for {:?}: {}",
                        self.index,
                        String::from_utf8_lossy(key.value()),
                        e
                    );
                    report.corrupted += 1;
                    continue;
                }
            };
            let Some(i) = slot(meta.data_type) else {
                continue;
            };
            let scanned = ScannedKey {
                key: key.value().to_vec(),
                version: meta.version,
                ttl_ms: meta.remaining_ttl_ms(now),
                expired: meta.is_expired(now),
                size: match meta.data_type {
                    DataType::Strings => meta.payload.len() as u64,
                    _ => meta.count,
                },
            };
            info!(
                "db{} [{}] key {:?} version {} ttl {:?} size {}{}",
                self.index,
                meta.data_type,
                String::from_utf8_lossy(&scanned.key),
                scanned.version,
                scanned.ttl_ms,
                scanned.size,
                if scanned.expired { " (expired)" } else { "" }
            );
            report.types[i].1.push(scanned);
        }
        Ok(report)
    }
}
