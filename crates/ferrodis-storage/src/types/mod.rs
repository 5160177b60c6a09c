//! Redis data type primitives
//!
//! Every primitive is an inherent method on [`Engine`]. Mutations take the
//! per-key lock, run in one write transaction and report to the statistics
//! store after the commit, so a scheduled compaction always sees the result.
//! Reads run in their own read transaction.

mod hashes;
mod keys;
mod lists;
mod sets;
mod strings;
mod zsets;

use crate::coding::{MetaValue, prefix_successor};
use crate::compaction::Bounds;
use crate::error::{Error, Result};
use crate::instance::Engine;
use ferrodis_common::DataType;
use redb::ReadableTable;
use std::ops::Bound;

/// Scan page size used when a caller passes a count of zero
const DEFAULT_SCAN_COUNT: usize = 10;

/// Decode the meta record stored for `key`, whatever its state
pub(crate) fn read_meta(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<MetaValue>> {
    match table.get(key)? {
        Some(raw) => MetaValue::decode(raw.value()).map(Some),
        None => Ok(None),
    }
}

/// Meta record of a live `data_type` key. Expired records read as absent; a
/// live key of another type is a WRONGTYPE error.
pub(crate) fn live_meta(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
    data_type: DataType,
    now_ms: u64,
) -> Result<Option<MetaValue>> {
    match read_meta(table, key)? {
        Some(meta) if meta.is_expired(now_ms) => Ok(None),
        Some(meta) if meta.data_type != data_type => Err(Error::wrong_type()),
        other => Ok(other),
    }
}

/// Bounds of every record sharing `prefix` in a bytewise family, starting at
/// `prefix | start`
pub(crate) fn prefix_bounds(prefix: &[u8], start: &[u8]) -> Bounds {
    let mut lower = prefix.to_vec();
    lower.extend_from_slice(start);
    let upper = prefix_successor(prefix).map_or(Bound::Unbounded, Bound::Excluded);
    (Bound::Included(lower), upper)
}

/// Resolve `[start, stop]` with negative indices against `len` elements.
/// `None` when the range is empty.
pub(crate) fn normalize_range(start: i64, stop: i64, len: u64) -> Option<(u64, u64)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    (start <= stop && start < len).then_some((start as u64, stop as u64))
}

impl Engine {
    /// Cursor position and start point of a scan page. An unknown cursor
    /// restarts from the beginning.
    pub(crate) fn scan_start(
        &self,
        data_type: DataType,
        key: &[u8],
        pattern: &[u8],
        cursor: u64,
    ) -> (u64, Vec<u8>) {
        if cursor == 0 {
            return (0, Vec::new());
        }
        match self
            .scan_cursors
            .get_start_point(data_type, key, pattern, cursor)
        {
            Some(start) => (cursor, start),
            None => (0, Vec::new()),
        }
    }

    /// Cursor handed back to the client: 0 when the scan is complete,
    /// otherwise a new cursor remembering `next`
    pub(crate) fn scan_next(
        &self,
        data_type: DataType,
        key: &[u8],
        pattern: &[u8],
        position: u64,
        count: usize,
        next: Option<Vec<u8>>,
    ) -> u64 {
        match next {
            Some(point) => {
                let cursor = position + count as u64;
                self.scan_cursors
                    .store_next_point(data_type, key, pattern, cursor, &point);
                cursor
            }
            None => 0,
        }
    }
}

pub(crate) fn scan_count(count: usize) -> usize {
    if count == 0 { DEFAULT_SCAN_COUNT } else { count }
}
