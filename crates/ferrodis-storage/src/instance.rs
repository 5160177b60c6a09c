//! Engine instance: one logical database on top of one redb file
//!
//! Opening happens in three phases:
//!
//! 1. build the per column family configuration (filter factories sharing an
//!    unbound [`HandleTable`], comparator-keyed table definitions);
//! 2. open the database file and create every table;
//! 3. bind the opened database into the handle table.
//!
//! A failure in any phase drops everything built so far and returns
//! [`Error::EngineOpen`].

use crate::cf::{
    CfOptions, ColumnFamily, HASHES_DATA, LISTS_DATA, META, SETS_DATA, ZSETS_DATA, ZSETS_SCORE,
    parse_bool,
};
use crate::error::{Error, Result};
use crate::filter::{CompactionFilterFactory, FilterKind, HandleTable};
use crate::lock_mgr::LockMgr;
use crate::lru::LruCache;
use crate::scan_cursor::ScanCursorStore;
use crate::statistics::StatisticsStore;
use crate::util::VersionGenerator;
use crossbeam_channel::Sender;
use ferrodis_common::{BgTask, OptionType, StorageOptions};
use parking_lot::Mutex;
use redb::{Database, Durability, ReadTransaction, WriteTransaction};
use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Name of the database file inside an engine directory
pub const DATA_FILE: &str = "data.redb";

/// Capacity of the SPOP counter cache
const SPOP_COUNTS_CAPACITY: usize = 1000;

/// Runtime state of one column family
#[derive(Debug, Default)]
pub(crate) struct CfState {
    pub(crate) options: Mutex<CfOptions>,
    pub(crate) compactions: AtomicU64,
    pub(crate) records_dropped: AtomicU64,
}

/// Read snapshot counted in `rocksdb.num-snapshots`
pub struct Snapshot {
    txn: ReadTransaction,
    open: Arc<AtomicU64>,
}

impl Deref for Snapshot {
    type Target = ReadTransaction;

    fn deref(&self) -> &ReadTransaction {
        &self.txn
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One logical database
pub struct Engine {
    pub(crate) index: usize,
    pub(crate) path: PathBuf,
    pub(crate) block_cache_size: usize,
    pub(crate) db: Arc<Database>,
    pub(crate) handles: Arc<HandleTable>,
    pub(crate) factories: Vec<CompactionFilterFactory>,
    pub(crate) cf_state: Vec<CfState>,
    pub(crate) statistics: StatisticsStore,
    pub(crate) scan_cursors: ScanCursorStore,
    pub(crate) spop_counts: LruCache<Vec<u8>, u64>,
    pub(crate) lock_mgr: LockMgr,
    pub(crate) versions: VersionGenerator,
    pub(crate) bg_tasks: Sender<BgTask>,
    sync_writes: AtomicBool,
    pub(crate) cancel: AtomicBool,
    pub(crate) running_compactions: AtomicU64,
    pub(crate) background_errors: AtomicU64,
    pub(crate) open_snapshots: Arc<AtomicU64>,
    pub(crate) commits: AtomicU64,
}

impl Engine {
    /// Open (or create) the database stored under `path`.
    ///
    /// `bg_tasks` receives the small compactions scheduled by the statistics
    /// store.
    pub fn open(
        options: &StorageOptions,
        index: usize,
        path: impl AsRef<Path>,
        bg_tasks: Sender<BgTask>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let handles = Arc::new(HandleTable::new());
        let factories: Vec<CompactionFilterFactory> = ColumnFamily::ALL
            .iter()
            .map(|cf| CompactionFilterFactory::new(FilterKind::for_cf(*cf), Arc::clone(&handles)))
            .collect();
        for cf in ColumnFamily::ALL {
            debug!(
                "db{index} cf {cf}: filter {}, comparator {}",
                factories[cf.index()].kind().name(),
                cf.comparator_name()
            );
        }

        let open_error = |message: String| Error::EngineOpen {
            path: path.display().to_string(),
            message,
        };
        let db = Arc::new(
            open_database(&path, options.block_cache_size).map_err(|e| open_error(e.to_string()))?,
        );
        handles
            .bind(Arc::clone(&db))
            .map_err(|e| open_error(e.to_string()))?;

        let statistics = StatisticsStore::new(
            options.statistics_max_size,
            options.small_compaction_threshold,
            options.small_compaction_duration_threshold,
            bg_tasks.clone(),
        );

        info!("Opened db{} at {:?}", index, path);
        Ok(Self {
            index,
            path,
            block_cache_size: options.block_cache_size,
            db,
            handles,
            factories,
            cf_state: ColumnFamily::ALL.iter().map(|_| CfState::default()).collect(),
            statistics,
            scan_cursors: ScanCursorStore::new(options.scan_cursors_max_size),
            spop_counts: LruCache::new(SPOP_COUNTS_CAPACITY),
            lock_mgr: LockMgr::new(options.lock_shards),
            versions: VersionGenerator::new(),
            bg_tasks,
            sync_writes: AtomicBool::new(options.sync_writes),
            cancel: AtomicBool::new(false),
            running_compactions: AtomicU64::new(0),
            background_errors: AtomicU64::new(0),
            open_snapshots: Arc::new(AtomicU64::new(0)),
            commits: AtomicU64::new(0),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_mgr(&self) -> &LockMgr {
        &self.lock_mgr
    }

    pub fn statistics(&self) -> &StatisticsStore {
        &self.statistics
    }

    pub fn scan_cursors(&self) -> &ScanCursorStore {
        &self.scan_cursors
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.handles.is_bound()
    }

    // ---- Runtime tunables ----

    pub fn set_small_compaction_threshold(&self, threshold: u64) {
        self.statistics.set_small_compaction_threshold(threshold);
    }

    pub fn set_small_compaction_duration_threshold(&self, threshold: u64) {
        self.statistics
            .set_small_compaction_duration_threshold(threshold);
    }

    pub fn set_max_cache_statistic_keys(&self, max_keys: usize) {
        self.statistics.set_capacity(max_keys);
    }

    pub fn set_write_sync(&self, sync: bool) {
        self.sync_writes.store(sync, Ordering::Relaxed);
    }

    pub fn write_sync(&self) -> bool {
        self.sync_writes.load(Ordering::Relaxed)
    }

    /// Options of one column family
    pub fn cf_options(&self, cf: ColumnFamily) -> CfOptions {
        self.cf_state[cf.index()].options.lock().clone()
    }

    /// Apply runtime options.
    ///
    /// Database options are validated as a whole before any is applied.
    /// Column family options are applied to each family in turn; the first
    /// failure stops the remaining families and is returned.
    pub fn set_options(&self, scope: OptionType, options: &HashMap<String, String>) -> Result<()> {
        match scope {
            OptionType::Db => self.set_db_options(options),
            OptionType::ColumnFamily => {
                for cf in ColumnFamily::ALL {
                    self.cf_state[cf.index()].options.lock().apply(options)?;
                }
                debug!("db{} column family options updated: {:?}", self.index, options);
                Ok(())
            }
        }
    }

    fn set_db_options(&self, options: &HashMap<String, String>) -> Result<()> {
        enum DbOption {
            Threshold(u64),
            DurationThreshold(u64),
            MaxStatisticKeys(usize),
            SyncWrites(bool),
        }

        let parse_u64 = |name: &str, value: &str| {
            value
                .parse::<u64>()
                .map_err(|_| Error::invalid_argument(format!("invalid value for {name}: {value}")))
        };

        let mut parsed = Vec::with_capacity(options.len());
        for (name, value) in options {
            let option = match name.as_str() {
                "small-compaction-threshold" => DbOption::Threshold(parse_u64(name, value)?),
                "small-compaction-duration-threshold" => {
                    DbOption::DurationThreshold(parse_u64(name, value)?)
                }
                "max-cache-statistic-keys" => {
                    DbOption::MaxStatisticKeys(parse_u64(name, value)? as usize)
                }
                "sync-writes" => DbOption::SyncWrites(parse_bool(name, value)?),
                other => {
                    return Err(Error::invalid_argument(format!(
                        "unsupported db option: {other}"
                    )));
                }
            };
            parsed.push(option);
        }

        for option in parsed {
            match option {
                DbOption::Threshold(v) => self.set_small_compaction_threshold(v),
                DbOption::DurationThreshold(v) => self.set_small_compaction_duration_threshold(v),
                DbOption::MaxStatisticKeys(v) => self.set_max_cache_statistic_keys(v),
                DbOption::SyncWrites(v) => self.set_write_sync(v),
            }
        }
        debug!("db{} options updated: {:?}", self.index, options);
        Ok(())
    }

    /// Ask in-flight compaction passes to stop at the next column family
    pub fn cancel_background_work(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    // ---- Transactions ----

    /// Begin a write transaction with the configured durability
    pub(crate) fn begin_write(&self) -> Result<WriteTransaction> {
        let mut txn = self.db.begin_write()?;
        txn.set_durability(if self.write_sync() {
            Durability::Immediate
        } else {
            Durability::Eventual
        });
        Ok(txn)
    }

    pub(crate) fn commit(&self, txn: WriteTransaction) -> Result<()> {
        txn.commit()?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Begin a consistent read view over every column family
    pub fn snapshot(&self) -> Result<Snapshot> {
        let txn = self.db.begin_read()?;
        self.open_snapshots.fetch_add(1, Ordering::Relaxed);
        Ok(Snapshot {
            txn,
            open: Arc::clone(&self.open_snapshots),
        })
    }

    /// Queue a background task without blocking
    pub(crate) fn schedule(&self, task: BgTask) -> bool {
        match self.bg_tasks.try_send(task) {
            Ok(()) => true,
            Err(e) => {
                warn!("db{}: dropping background task: {}", self.index, e);
                false
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        info!("Closed db{} at {:?}", self.index, self.path);
    }
}

/// Open the database file under `path` and create every column family table
pub(crate) fn open_database(path: &Path, cache_size: usize) -> Result<Database> {
    std::fs::create_dir_all(path)?;
    let db = Database::builder()
        .set_cache_size(cache_size)
        .create(path.join(DATA_FILE))?;
    let txn = db.begin_write()?;
    txn.open_table(META)?;
    txn.open_table(HASHES_DATA)?;
    txn.open_table(SETS_DATA)?;
    txn.open_table(LISTS_DATA)?;
    txn.open_table(ZSETS_DATA)?;
    txn.open_table(ZSETS_SCORE)?;
    txn.commit()?;
    Ok(db)
}
