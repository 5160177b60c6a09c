//! Physical record formats
//!
//! Meta records are keyed by the bare user key:
//!
//! ```text
//! value = type_tag:u8 | version:u64 | expire_at_ms:u64 | count:u64
//!         [ left_index:u64 | right_index:u64 ]   lists only
//!         [ payload ]                             strings only
//! ```
//!
//! Data records of composite types share one prefix:
//!
//! ```text
//! prefix     = type_tag:u8 | key_len:u32 | user_key | version:u64
//! hash data  = prefix | field
//! set data   = prefix | member
//! list data  = prefix | seq:u64
//! zset data  = prefix | member            -> score
//! zset score = prefix | score:f64 | member
//! ```
//!
//! Integers are fixed-width little-endian, so byte order is not numeric
//! order. The list and score column families rely on the comparators in
//! [`crate::comparator`] for that reason.

use crate::error::{Error, Result};
use ferrodis_common::DataType;

const FIXED64: usize = 8;
const KEY_LEN: usize = 4;
const META_HEADER: usize = 1 + 3 * FIXED64;
const LIST_META_HEADER: usize = META_HEADER + 2 * FIXED64;

/// Sequence number just left of the first element of a new list
pub const INITIAL_LEFT_INDEX: u64 = i64::MAX as u64;
/// Sequence number just right of the last element of a new list
pub const INITIAL_RIGHT_INDEX: u64 = INITIAL_LEFT_INDEX + 1;

#[inline]
pub fn put_fixed64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn get_fixed64(data: &[u8]) -> Option<u64> {
    let bytes: [u8; FIXED64] = data.get(..FIXED64)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Encode a score, folding `-0.0` into `0.0`
#[inline]
pub fn encode_score(score: f64) -> [u8; 8] {
    let score = if score == 0.0 { 0.0 } else { score };
    score.to_bits().to_le_bytes()
}

#[inline]
pub fn decode_score(data: &[u8]) -> Option<f64> {
    get_fixed64(data).map(f64::from_bits)
}

// ---- Meta records ----

/// Decoded meta record
#[derive(Clone, Debug, PartialEq)]
pub struct MetaValue {
    pub data_type: DataType,
    pub version: u64,
    /// Absolute expiration in unix milliseconds, 0 when persistent
    pub expire_at_ms: u64,
    /// Element count for composite types
    pub count: u64,
    pub left_index: u64,
    pub right_index: u64,
    /// String value
    pub payload: Vec<u8>,
}

impl MetaValue {
    /// Meta record of a string key
    pub fn string(version: u64, value: &[u8]) -> Self {
        Self {
            data_type: DataType::Strings,
            version,
            expire_at_ms: 0,
            count: 0,
            left_index: INITIAL_LEFT_INDEX,
            right_index: INITIAL_RIGHT_INDEX,
            payload: value.to_vec(),
        }
    }

    /// Empty meta record of a composite key
    pub fn collection(data_type: DataType, version: u64) -> Self {
        Self {
            data_type,
            version,
            expire_at_ms: 0,
            count: 0,
            left_index: INITIAL_LEFT_INDEX,
            right_index: INITIAL_RIGHT_INDEX,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LIST_META_HEADER + self.payload.len());
        buf.push(self.data_type.tag());
        put_fixed64(&mut buf, self.version);
        put_fixed64(&mut buf, self.expire_at_ms);
        put_fixed64(&mut buf, self.count);
        match self.data_type {
            DataType::Lists => {
                put_fixed64(&mut buf, self.left_index);
                put_fixed64(&mut buf, self.right_index);
            }
            DataType::Strings => buf.extend_from_slice(&self.payload),
            _ => {}
        }
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < META_HEADER {
            return Err(Error::corruption(format!(
                "meta value too short: {} bytes",
                raw.len()
            )));
        }
        let data_type = DataType::from_tag(raw[0])
            .ok_or_else(|| Error::corruption(format!("unknown type tag {:#04x}", raw[0])))?;
        let field = |i: usize| get_fixed64(&raw[1 + i * FIXED64..]).unwrap_or_default();
        let mut meta = Self {
            data_type,
            version: field(0),
            expire_at_ms: field(1),
            count: field(2),
            left_index: INITIAL_LEFT_INDEX,
            right_index: INITIAL_RIGHT_INDEX,
            payload: Vec::new(),
        };
        match data_type {
            DataType::Lists => {
                if raw.len() < LIST_META_HEADER {
                    return Err(Error::corruption("list meta value too short"));
                }
                meta.left_index = field(3);
                meta.right_index = field(4);
            }
            DataType::Strings => meta.payload = raw[META_HEADER..].to_vec(),
            _ => {}
        }
        Ok(meta)
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_at_ms != 0 && self.expire_at_ms <= now_ms
    }

    /// Remaining lifetime in milliseconds, `None` for persistent keys
    pub fn remaining_ttl_ms(&self, now_ms: u64) -> Option<u64> {
        (self.expire_at_ms != 0).then(|| self.expire_at_ms.saturating_sub(now_ms))
    }
}

// ---- Data keys ----

/// Borrowed view of a decoded data key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataKey<'a> {
    pub data_type: DataType,
    pub user_key: &'a [u8],
    pub version: u64,
    /// Bytes after the version: field, member, seq or score+member
    pub suffix: &'a [u8],
}

impl<'a> DataKey<'a> {
    pub fn decode(raw: &'a [u8]) -> Option<Self> {
        let data_type = DataType::from_tag(*raw.first()?)?;
        let len_bytes: [u8; KEY_LEN] = raw.get(1..1 + KEY_LEN)?.try_into().ok()?;
        let key_len = u32::from_le_bytes(len_bytes) as usize;
        let key_start = 1 + KEY_LEN;
        let user_key = raw.get(key_start..key_start + key_len)?;
        let version_start = key_start + key_len;
        let version = get_fixed64(raw.get(version_start..)?)?;
        Some(Self {
            data_type,
            user_key,
            version,
            suffix: &raw[version_start + FIXED64..],
        })
    }

    /// Sequence number of a list data key
    pub fn list_seq(&self) -> Option<u64> {
        (self.suffix.len() == FIXED64)
            .then(|| get_fixed64(self.suffix))
            .flatten()
    }

    /// Score and member of a zset score key
    pub fn score_member(&self) -> Option<(f64, &'a [u8])> {
        let score = decode_score(self.suffix)?;
        Some((score, &self.suffix[FIXED64..]))
    }
}

/// `type_tag | key_len | user_key`: common to every version of `key`
pub fn key_prefix(data_type: DataType, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + KEY_LEN + key.len() + FIXED64);
    buf.push(data_type.tag());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf
}

/// Prefix of every data record of one generation of `key`
pub fn data_prefix(data_type: DataType, key: &[u8], version: u64) -> Vec<u8> {
    let mut buf = key_prefix(data_type, key);
    put_fixed64(&mut buf, version);
    buf
}

pub fn data_key(data_type: DataType, key: &[u8], version: u64, suffix: &[u8]) -> Vec<u8> {
    let mut buf = data_prefix(data_type, key, version);
    buf.extend_from_slice(suffix);
    buf
}

pub fn list_key(key: &[u8], version: u64, seq: u64) -> Vec<u8> {
    let mut buf = data_prefix(DataType::Lists, key, version);
    put_fixed64(&mut buf, seq);
    buf
}

pub fn score_key(key: &[u8], version: u64, score: f64, member: &[u8]) -> Vec<u8> {
    let mut buf = data_prefix(DataType::ZSets, key, version);
    buf.extend_from_slice(&encode_score(score));
    buf.extend_from_slice(member);
    buf
}

/// Smallest byte string greater than every string starting with `prefix`
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last != u8::MAX {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

/// Immediate lexicographic successor of a user key
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_string() {
        let mut meta = MetaValue::string(42, b"hello");
        meta.expire_at_ms = 1000;
        let decoded = MetaValue::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
        assert!(decoded.is_expired(1000));
        assert!(!decoded.is_expired(999));
    }

    #[test]
    fn test_meta_list_indices() {
        let mut meta = MetaValue::collection(DataType::Lists, 7);
        meta.left_index -= 3;
        meta.right_index += 2;
        meta.count = 5;
        let decoded = MetaValue::decode(&meta.encode()).unwrap();
        assert_eq!(decoded.left_index, INITIAL_LEFT_INDEX - 3);
        assert_eq!(decoded.right_index, INITIAL_RIGHT_INDEX + 2);
        assert_eq!(decoded.count, 5);
    }

    #[test]
    fn test_meta_corruption() {
        assert!(MetaValue::decode(b"h123").is_err());
        let mut raw = MetaValue::collection(DataType::Hashes, 1).encode();
        raw[0] = b'?';
        assert!(MetaValue::decode(&raw).is_err());
    }

    #[test]
    fn test_data_key_decode() {
        let raw = data_key(DataType::Hashes, b"user:1", 9, b"name");
        let key = DataKey::decode(&raw).unwrap();
        assert_eq!(key.data_type, DataType::Hashes);
        assert_eq!(key.user_key, b"user:1");
        assert_eq!(key.version, 9);
        assert_eq!(key.suffix, b"name");
        assert!(raw.starts_with(&key_prefix(DataType::Hashes, b"user:1")));
    }

    #[test]
    fn test_list_and_score_suffix() {
        let raw = list_key(b"q", 3, INITIAL_RIGHT_INDEX);
        assert_eq!(DataKey::decode(&raw).unwrap().list_seq(), Some(INITIAL_RIGHT_INDEX));

        let raw = score_key(b"z", 3, -1.5, b"m");
        let (score, member) = DataKey::decode(&raw).unwrap().score_member().unwrap();
        assert_eq!(score, -1.5);
        assert_eq!(member, b"m");

        assert_eq!(encode_score(-0.0), encode_score(0.0));
    }

    #[test]
    fn test_truncated_data_key() {
        let raw = data_key(DataType::Sets, b"abc", 1, b"");
        assert!(DataKey::decode(&raw[..raw.len() - 1]).is_none());
        assert!(DataKey::decode(b"").is_none());
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }
}
