//! Checkpoints
//!
//! A checkpoint is a directory holding a standalone copy of the database file
//! taken from one read snapshot, plus a JSON manifest:
//!
//! ```text
//! <dir>/data.redb
//! <dir>/CHECKPOINT
//! ```
//!
//! Restoring is done by [`crate::Db::load_from_checkpoint`], which swaps the
//! engine under the database lock.

use crate::cf::{
    ColumnFamily, HASHES_DATA, LISTS_DATA, META, SETS_DATA, ZSETS_DATA, ZSETS_SCORE,
};
use crate::error::{Error, Result};
use crate::instance::{DATA_FILE, Engine, open_database};
use crate::util::now_ms;
use redb::{Durability, ReadTransaction, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// File name of the checkpoint manifest
pub const CHECKPOINT_MANIFEST: &str = "CHECKPOINT";

const MANIFEST_FORMAT: u32 = 1;

/// Cache size used when writing a checkpoint copy
const COPY_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// Description of a checkpoint directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format: u32,
    pub db_index: usize,
    pub created_at_ms: u64,
    /// Entry count of every column family at checkpoint time
    pub column_families: BTreeMap<String, u64>,
}

impl CheckpointManifest {
    /// Read and validate the manifest of a checkpoint directory
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CHECKPOINT_MANIFEST);
        if !path.exists() || !dir.join(DATA_FILE).exists() {
            return Err(Error::NotFound(format!("no checkpoint at {}", dir.display())));
        }
        let manifest: Self = serde_json::from_slice(&std::fs::read(&path)?)?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(Error::corruption(format!(
                "unsupported checkpoint format {}",
                manifest.format
            )));
        }
        for cf in ColumnFamily::ALL {
            if !manifest.column_families.contains_key(cf.name()) {
                return Err(Error::corruption(format!(
                    "checkpoint manifest lacks column family {cf}"
                )));
            }
        }
        Ok(manifest)
    }
}

macro_rules! copy_table {
    ($src:expr, $dst:expr, $def:expr) => {{
        let source = $src.open_table($def)?;
        let mut target = $dst.open_table($def)?;
        let mut copied = 0u64;
        for entry in source.iter()? {
            let (key, value) = entry?;
            target.insert(key.value(), value.value())?;
            copied += 1;
        }
        copied
    }};
}

/// Copy every column family visible in `src` into `dst`
fn copy_column_families(
    src: &ReadTransaction,
    dst: &WriteTransaction,
) -> Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    for cf in ColumnFamily::ALL {
        let copied = match cf {
            ColumnFamily::Meta => copy_table!(src, dst, META),
            ColumnFamily::HashesData => copy_table!(src, dst, HASHES_DATA),
            ColumnFamily::SetsData => copy_table!(src, dst, SETS_DATA),
            ColumnFamily::ListsData => copy_table!(src, dst, LISTS_DATA),
            ColumnFamily::ZSetsData => copy_table!(src, dst, ZSETS_DATA),
            ColumnFamily::ZSetsScore => copy_table!(src, dst, ZSETS_SCORE),
        };
        counts.insert(cf.name().to_string(), copied);
    }
    Ok(counts)
}

/// fsync a directory so renames and creations inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

impl Engine {
    /// Write a point-in-time copy of every column family into `dir`.
    ///
    /// With `sync` the copy is committed with immediate durability and the
    /// manifest and directory are fsynced before returning.
    pub fn create_checkpoint(&self, dir: impl AsRef<Path>, sync: bool) -> Result<CheckpointManifest> {
        let dir = dir.as_ref();
        if dir.join(DATA_FILE).exists() || dir.join(CHECKPOINT_MANIFEST).exists() {
            return Err(Error::invalid_argument(format!(
                "checkpoint already exists at {}",
                dir.display()
            )));
        }
        let started = Instant::now();

        let snap = self.snapshot()?;
        let target = open_database(dir, COPY_CACHE_SIZE)?;
        let mut txn = target.begin_write()?;
        txn.set_durability(if sync {
            Durability::Immediate
        } else {
            Durability::Eventual
        });
        let column_families = copy_column_families(&snap, &txn)?;
        txn.commit()?;
        drop(target);
        drop(snap);

        let manifest = CheckpointManifest {
            format: MANIFEST_FORMAT,
            db_index: self.index,
            created_at_ms: now_ms(),
            column_families,
        };
        let manifest_path = dir.join(CHECKPOINT_MANIFEST);
        std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;
        if sync {
            File::open(&manifest_path)?.sync_all()?;
            sync_dir(dir)?;
        }

        info!(
            "Created checkpoint of db{} at {:?} in {:?}",
            self.index,
            dir,
            started.elapsed()
        );
        Ok(manifest)
    }
}
