//! Compaction passes
//!
//! redb never rewrites records on its own, so the engine drives compaction:
//! one pass opens a write transaction, asks each column family's filter
//! factory for a filter and removes every record the filter rejects. The
//! write transaction is opened before the filters so their meta snapshot is
//! exactly the state the pass commits against.
//!
//! Passes cover the meta column family first, then the data families.

use crate::cf::{
    ColumnFamily, HASHES_DATA, LISTS_DATA, META, SETS_DATA, ZSETS_DATA, ZSETS_SCORE,
};
use crate::coding::{DataKey, data_prefix, key_prefix, key_successor, prefix_successor};
use crate::error::{Error, Result};
use crate::filter::CompactionFilter;
use crate::instance::Engine;
use crate::util::now_ms;
use ferrodis_common::{BgOperation, BgTask, DataType};
use redb::{Table, WriteTransaction};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// Logical key range of a compaction pass
#[derive(Clone, Copy, Debug)]
enum KeyRange<'a> {
    All,
    Single(&'a [u8]),
    /// Inclusive on both ends; `None` is unbounded
    Between(Option<&'a [u8]>, Option<&'a [u8]>),
}

impl KeyRange<'_> {
    fn contains(&self, user_key: &[u8]) -> bool {
        match *self {
            KeyRange::All => true,
            KeyRange::Single(key) => user_key == key,
            KeyRange::Between(begin, end) => {
                begin.is_none_or(|b| user_key >= b) && end.is_none_or(|e| user_key <= e)
            }
        }
    }
}

/// Outcome of one pass over one column family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CfCompaction {
    pub cf: ColumnFamily,
    pub examined: u64,
    pub dropped: u64,
}

/// Outcome of one compaction pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub column_families: Vec<CfCompaction>,
}

impl CompactionReport {
    pub fn dropped(&self) -> u64 {
        self.column_families.iter().map(|c| c.dropped).sum()
    }

    pub fn examined(&self) -> u64 {
        self.column_families.iter().map(|c| c.examined).sum()
    }
}

struct RunningGuard<'a>(&'a AtomicU64);

impl<'a> RunningGuard<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) type Bounds = (Bound<Vec<u8>>, Bound<Vec<u8>>);

pub(crate) fn as_slices(bounds: &Bounds) -> (Bound<&[u8]>, Bound<&[u8]>) {
    (
        bounds.0.as_ref().map(Vec::as_slice),
        bounds.1.as_ref().map(Vec::as_slice),
    )
}

/// Physical bounds of a single key in a comparator-ordered family. An empty
/// suffix at version 0 sorts before every record of a user key.
fn ordered_bounds(data_type: DataType, range: KeyRange<'_>) -> Option<Bounds> {
    let lower = |key: &[u8]| data_prefix(data_type, key, 0);
    let upper = |key: &[u8]| data_prefix(data_type, &key_successor(key), 0);
    match range {
        KeyRange::All => None,
        KeyRange::Single(key) => Some((Bound::Included(lower(key)), Bound::Excluded(upper(key)))),
        KeyRange::Between(begin, end) => Some((
            begin.map_or(Bound::Unbounded, |b| Bound::Included(lower(b))),
            end.map_or(Bound::Unbounded, |e| Bound::Excluded(upper(e))),
        )),
    }
}

/// Physical bounds of a single key in a bytewise family. Other ranges are
/// not contiguous there because of the length prefix.
fn bytewise_bounds(data_type: DataType, key: &[u8]) -> Bounds {
    let prefix = key_prefix(data_type, key);
    let upper = prefix_successor(&prefix).map_or(Bound::Unbounded, Bound::Excluded);
    (Bound::Included(prefix), upper)
}

fn retain_bytewise(
    table: &mut Table<'_, &'static [u8], &'static [u8]>,
    cf: ColumnFamily,
    filter: &CompactionFilter,
    range: KeyRange<'_>,
) -> Result<()> {
    match (cf, range) {
        (_, KeyRange::All) => table.retain(|k, v| filter.keep(k, v))?,
        (ColumnFamily::Meta, KeyRange::Single(key)) => {
            table.retain_in::<&[u8], _>(key..=key, |k, v| filter.keep(k, v))?
        }
        (ColumnFamily::Meta, KeyRange::Between(begin, end)) => {
            let bounds = (
                begin.map_or(Bound::Unbounded, Bound::Included),
                end.map_or(Bound::Unbounded, Bound::Included),
            );
            table.retain_in::<&[u8], _>(bounds, |k, v| filter.keep(k, v))?
        }
        (_, KeyRange::Single(key)) => {
            let bounds = bytewise_bounds(cf.data_type(), key);
            table.retain_in::<&[u8], _>(as_slices(&bounds), |k, v| filter.keep(k, v))?
        }
        (_, KeyRange::Between(..)) => table.retain(|k, v| {
            DataKey::decode(k).is_none_or(|d| !range.contains(d.user_key)) || filter.keep(k, v)
        })?,
    }
    Ok(())
}

macro_rules! retain_ordered {
    ($txn:expr, $def:expr, $cf:expr, $filter:expr, $range:expr) => {{
        let mut table = $txn.open_table($def)?;
        match ordered_bounds($cf.data_type(), $range) {
            None => table.retain(|k, v| $filter.keep(k, v))?,
            Some(bounds) => {
                table.retain_in::<&[u8], _>(as_slices(&bounds), |k, v| $filter.keep(k, v))?
            }
        }
    }};
}

impl Engine {
    /// Compact the meta family and every data family, restricted to logical
    /// keys in `[begin, end]`
    pub fn compact_range(
        &self,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<CompactionReport> {
        let range = match (begin, end) {
            (None, None) => KeyRange::All,
            _ => KeyRange::Between(begin, end),
        };
        self.compact(&ColumnFamily::ALL, range)
    }

    /// Compact only the records of one logical key
    pub fn compact_key(&self, data_type: DataType, key: &[u8]) -> Result<CompactionReport> {
        self.compact(&Self::families_of(data_type), KeyRange::Single(key))
    }

    /// Compact the families of one type, restricted to `[begin, end]`
    pub fn compact_type(
        &self,
        data_type: DataType,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<CompactionReport> {
        let range = match (begin, end) {
            (None, None) => KeyRange::All,
            _ => KeyRange::Between(begin, end),
        };
        self.compact(&Self::families_of(data_type), range)
    }

    /// Full pass over every family that has not disabled auto compaction
    pub fn auto_compact(&self) -> Result<CompactionReport> {
        let families: Vec<ColumnFamily> = ColumnFamily::ALL
            .into_iter()
            .filter(|cf| !self.cf_options(*cf).disable_auto_compactions)
            .collect();
        if families.is_empty() {
            return Ok(CompactionReport::default());
        }
        self.compact(&families, KeyRange::All)
    }

    /// Run one background task
    pub fn run_bg_task(&self, task: &BgTask) -> Result<CompactionReport> {
        match task.operation {
            BgOperation::CompactRange if task.is_single_key() => {
                self.compact_key(task.data_type, &task.begin)
            }
            BgOperation::CompactRange => {
                self.compact_type(task.data_type, Some(&task.begin), Some(&task.end))
            }
            BgOperation::CleanAll => self.compact_type(task.data_type, None, None),
        }
    }

    fn families_of(data_type: DataType) -> Vec<ColumnFamily> {
        let mut families = vec![ColumnFamily::Meta];
        families.extend_from_slice(ColumnFamily::for_type(data_type));
        families
    }

    fn compact(&self, families: &[ColumnFamily], range: KeyRange<'_>) -> Result<CompactionReport> {
        let _running = RunningGuard::new(&self.running_compactions);
        let started = Instant::now();
        let now = now_ms();

        let txn = self.begin_write()?;
        let mut report = CompactionReport::default();
        for &cf in families {
            if self.canceled() {
                txn.abort()?;
                return Err(Error::busy("compaction canceled"));
            }
            let filter = self.factories[cf.index()].create_filter(now)?;
            self.compact_cf(&txn, cf, &filter, range)?;
            report.column_families.push(CfCompaction {
                cf,
                examined: filter.examined(),
                dropped: filter.dropped(),
            });
        }
        self.commit(txn)?;

        for outcome in &report.column_families {
            let state = &self.cf_state[outcome.cf.index()];
            state.compactions.fetch_add(1, Ordering::Relaxed);
            state
                .records_dropped
                .fetch_add(outcome.dropped, Ordering::Relaxed);
        }
        debug!(
            "db{} compaction over {:?}: examined {}, dropped {} in {:?}",
            self.index,
            range,
            report.examined(),
            report.dropped(),
            started.elapsed()
        );
        Ok(report)
    }

    fn compact_cf(
        &self,
        txn: &WriteTransaction,
        cf: ColumnFamily,
        filter: &CompactionFilter,
        range: KeyRange<'_>,
    ) -> Result<()> {
        match cf {
            ColumnFamily::Meta => retain_bytewise(&mut txn.open_table(META)?, cf, filter, range),
            ColumnFamily::HashesData => {
                retain_bytewise(&mut txn.open_table(HASHES_DATA)?, cf, filter, range)
            }
            ColumnFamily::SetsData => {
                retain_bytewise(&mut txn.open_table(SETS_DATA)?, cf, filter, range)
            }
            ColumnFamily::ZSetsData => {
                retain_bytewise(&mut txn.open_table(ZSETS_DATA)?, cf, filter, range)
            }
            ColumnFamily::ListsData => {
                retain_ordered!(txn, LISTS_DATA, cf, filter, range);
                Ok(())
            }
            ColumnFamily::ZSetsScore => {
                retain_ordered!(txn, ZSETS_SCORE, cf, filter, range);
                Ok(())
            }
        }
    }
}
