//! Column family layout
//!
//! Every logical database is one redb file holding six tables. The meta
//! table ("default") holds one record per logical key; the other five hold
//! the elements of composite keys.

use crate::comparator::{ListsDataKeyComparator, ZSetsScoreKeyComparator};
use crate::error::{Error, Result};
use ferrodis_common::DataType;
use redb::TableDefinition;
use std::collections::HashMap;
use std::fmt;

pub const META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("default");
pub const HASHES_DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hash_data_cf");
pub const SETS_DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("set_data_cf");
pub const LISTS_DATA: TableDefinition<ListsDataKeyComparator, &[u8]> =
    TableDefinition::new("list_data_cf");
pub const ZSETS_DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("zset_data_cf");
pub const ZSETS_SCORE: TableDefinition<ZSetsScoreKeyComparator, &[u8]> =
    TableDefinition::new("zset_score_cf");

/// One independently compacted keyspace partition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    Meta,
    HashesData,
    SetsData,
    ListsData,
    ZSetsData,
    ZSetsScore,
}

impl ColumnFamily {
    /// Open order; the meta column family always comes first
    pub const ALL: [ColumnFamily; 6] = [
        ColumnFamily::Meta,
        ColumnFamily::HashesData,
        ColumnFamily::SetsData,
        ColumnFamily::ListsData,
        ColumnFamily::ZSetsData,
        ColumnFamily::ZSetsScore,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Meta => "default",
            Self::HashesData => "hash_data_cf",
            Self::SetsData => "set_data_cf",
            Self::ListsData => "list_data_cf",
            Self::ZSetsData => "zset_data_cf",
            Self::ZSetsScore => "zset_score_cf",
        }
    }

    /// Position in [`ColumnFamily::ALL`]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Type whose records live here (`None` for the shared meta family)
    #[must_use]
    pub const fn data_type(self) -> DataType {
        match self {
            Self::Meta => DataType::None,
            Self::HashesData => DataType::Hashes,
            Self::SetsData => DataType::Sets,
            Self::ListsData => DataType::Lists,
            Self::ZSetsData | Self::ZSetsScore => DataType::ZSets,
        }
    }

    /// Data column families owned by `data_type`
    #[must_use]
    pub fn for_type(data_type: DataType) -> &'static [ColumnFamily] {
        match data_type {
            DataType::Hashes => &[Self::HashesData],
            DataType::Sets => &[Self::SetsData],
            DataType::Lists => &[Self::ListsData],
            DataType::ZSets => &[Self::ZSetsData, Self::ZSetsScore],
            DataType::Strings | DataType::None => &[],
        }
    }

    /// Name of the key ordering used by this family
    #[must_use]
    pub const fn comparator_name(self) -> &'static str {
        match self {
            Self::ListsData => "ferrodis.ListsDataKeyComparator",
            Self::ZSetsScore => "ferrodis.ZSetsScoreKeyComparator",
            _ => "leveldb.BytewiseComparator",
        }
    }
}

impl fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime-tunable options of one column family
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfOptions {
    /// Exclude this family from periodic background compaction
    pub disable_auto_compactions: bool,
}

impl CfOptions {
    /// Apply a `SetOptions` map. Parsing happens before any field changes so a
    /// bad entry leaves the options untouched.
    pub fn apply(&mut self, options: &HashMap<String, String>) -> Result<()> {
        let mut next = self.clone();
        for (name, value) in options {
            match name.as_str() {
                "disable_auto_compactions" => {
                    next.disable_auto_compactions = parse_bool(name, value)?;
                }
                other => {
                    return Err(Error::invalid_argument(format!(
                        "unsupported column family option: {other}"
                    )));
                }
            }
        }
        *self = next;
        Ok(())
    }
}

pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::invalid_argument(format!(
            "invalid value for {name}: {value}"
        ))),
    }
}
