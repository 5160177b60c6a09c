//! Ferrodis Storage - Redis data types on an embedded key-value store
//!
//! This crate implements the storage engine adapter for ferrodis including:
//! - Column family layout with a shared meta family and per-type data families
//! - Version-tagged records reclaimed by per-family compaction filters
//! - Custom key orderings for list sequences and sorted-set scores
//! - Statistics-driven small compactions run by a background worker
//! - Scan cursor cache and sharded per-key locks
//! - Checkpoint and restore of a whole logical database
//! - Engine info, key counts and diagnostic database scans

pub mod cf;
pub mod checkpoint;
pub mod coding;
pub mod compaction;
pub mod comparator;
pub mod db;
pub mod error;
pub mod filter;
pub mod info;
pub mod instance;
pub mod lock_mgr;
pub mod lru;
pub mod scan_cursor;
pub mod statistics;
mod types;
pub mod util;

// Re-exports
pub use cf::{CfOptions, ColumnFamily};
pub use checkpoint::{CHECKPOINT_MANIFEST, CheckpointManifest};
pub use coding::MetaValue;
pub use compaction::{CfCompaction, CompactionReport};
pub use db::Db;
pub use error::{Error, Result, StatusKind};
pub use info::{DatabaseScanReport, INFO_METRICS, ScannedKey};
pub use instance::{DATA_FILE, Engine, Snapshot};
pub use lock_mgr::LockMgr;
pub use statistics::{KeyStatistics, StatisticsStore};
