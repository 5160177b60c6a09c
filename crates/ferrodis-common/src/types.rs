//! Core type definitions for ferrodis
//!
//! This module defines the data type tags stored on disk, the key statistics
//! reported to operators and the background task descriptions exchanged
//! between the engine and its compaction worker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Redis data type of a logical key.
///
/// The tag byte is written as the first byte of every meta value and every
/// data key, so it must never change for an existing variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Strings,
    Hashes,
    Sets,
    ZSets,
    Lists,
    None,
}

impl DataType {
    /// The five concrete types in `ScanKeyNum` order.
    pub const SCAN_ORDER: [DataType; 5] = [
        DataType::Strings,
        DataType::Hashes,
        DataType::Lists,
        DataType::ZSets,
        DataType::Sets,
    ];

    /// On-disk tag byte
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Strings => b'k',
            Self::Hashes => b'h',
            Self::Sets => b's',
            Self::ZSets => b'z',
            Self::Lists => b'l',
            Self::None => b'n',
        }
    }

    /// Decode a tag byte. Unknown tags yield `None`.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'k' => Some(Self::Strings),
            b'h' => Some(Self::Hashes),
            b's' => Some(Self::Sets),
            b'z' => Some(Self::ZSets),
            b'l' => Some(Self::Lists),
            b'n' => Some(Self::None),
            _ => None,
        }
    }

    /// Name as reported by the `TYPE` command
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strings => "string",
            Self::Hashes => "hash",
            Self::Sets => "set",
            Self::ZSets => "zset",
            Self::Lists => "list",
            Self::None => "none",
        }
    }

    /// True for the types whose elements live in data column families
    #[must_use]
    pub const fn is_composite(self) -> bool {
        matches!(self, Self::Hashes | Self::Sets | Self::ZSets | Self::Lists)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown data type name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data type: {0}")]
pub struct ParseDataTypeError(pub String);

impl FromStr for DataType {
    type Err = ParseDataTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "strings" => Ok(Self::Strings),
            "hash" | "hashes" => Ok(Self::Hashes),
            "set" | "sets" => Ok(Self::Sets),
            "zset" | "zsets" => Ok(Self::ZSets),
            "list" | "lists" => Ok(Self::Lists),
            "none" => Ok(Self::None),
            other => Err(ParseDataTypeError(other.to_string())),
        }
    }
}

/// Per-type key counts produced by `ScanKeyNum`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Live keys of this type
    pub keys: u64,
    /// Live keys carrying a TTL
    pub expires: u64,
    /// Average remaining TTL of `expires` keys, in seconds
    pub avg_ttl: u64,
    /// Keys whose TTL has elapsed but whose meta record is still on disk
    pub invalid_keys: u64,
}

/// Scope of a runtime `SetOptions` call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    /// Options applying to the whole database
    Db,
    /// Options applied to every column family in turn
    ColumnFamily,
}

/// Operation requested from the background worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BgOperation {
    /// Compact the records of the logical keys in `[begin, end]`
    CompactRange,
    /// Compact every record of the task's data type
    CleanAll,
}

/// A unit of background work for one logical database
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgTask {
    pub data_type: DataType,
    pub operation: BgOperation,
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl BgTask {
    /// Narrow compaction of a single logical key
    #[must_use]
    pub fn compact_key(data_type: DataType, key: &[u8]) -> Self {
        Self {
            data_type,
            operation: BgOperation::CompactRange,
            begin: key.to_vec(),
            end: key.to_vec(),
        }
    }

    /// Full compaction of every column family owned by `data_type`
    #[must_use]
    pub fn clean_all(data_type: DataType) -> Self {
        Self {
            data_type,
            operation: BgOperation::CleanAll,
            begin: Vec::new(),
            end: Vec::new(),
        }
    }

    /// True when the task targets exactly one logical key
    #[must_use]
    pub fn is_single_key(&self) -> bool {
        self.operation == BgOperation::CompactRange && self.begin == self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_tag_roundtrip() {
        for dt in [
            DataType::Strings,
            DataType::Hashes,
            DataType::Sets,
            DataType::ZSets,
            DataType::Lists,
            DataType::None,
        ] {
            assert_eq!(DataType::from_tag(dt.tag()), Some(dt));
        }
        assert_eq!(DataType::from_tag(b'x'), None);
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!("HASH".parse::<DataType>().unwrap(), DataType::Hashes);
        assert_eq!("zsets".parse::<DataType>().unwrap(), DataType::ZSets);
        assert!("stream".parse::<DataType>().is_err());
    }

    #[test]
    fn test_scan_order() {
        assert_eq!(
            DataType::SCAN_ORDER,
            [
                DataType::Strings,
                DataType::Hashes,
                DataType::Lists,
                DataType::ZSets,
                DataType::Sets
            ]
        );
    }

    #[test]
    fn test_bg_task_single_key() {
        let task = BgTask::compact_key(DataType::Hashes, b"user:1");
        assert!(task.is_single_key());
        assert!(!BgTask::clean_all(DataType::Sets).is_single_key());
    }
}
