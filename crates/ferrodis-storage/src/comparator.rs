//! Custom key orderings for the list and sorted-set score column families
//!
//! redb orders table keys with [`redb::Key::compare`]. The two key types
//! below decode the physical key and compare it field by field so that a
//! plain ordered range over the table yields logical order:
//!
//! - [`ListsDataKeyComparator`]: (user key, version, sequence)
//! - [`ZSetsScoreKeyComparator`]: (user key, version, score, member)
//!
//! Keys that fail to decode compare bytewise against each other and sort
//! after every well-formed key, which keeps the order total.

use crate::coding::DataKey;
use redb::{Key, TypeName, Value};
use std::cmp::Ordering;

/// Compare a list data key: user key, then version, then sequence number.
pub fn compare_list_keys(a: &[u8], b: &[u8]) -> Ordering {
    match (DataKey::decode(a), DataKey::decode(b)) {
        (Some(ka), Some(kb)) => ka
            .user_key
            .cmp(kb.user_key)
            .then(ka.version.cmp(&kb.version))
            .then_with(|| match (ka.list_seq(), kb.list_seq()) {
                (Some(sa), Some(sb)) => sa.cmp(&sb),
                _ => ka.suffix.cmp(kb.suffix),
            }),
        (a_key, b_key) => fallback(a, a_key.is_some(), b, b_key.is_some()),
    }
}

/// Compare a sorted-set score key: user key, version, score, then member.
pub fn compare_score_keys(a: &[u8], b: &[u8]) -> Ordering {
    match (DataKey::decode(a), DataKey::decode(b)) {
        (Some(ka), Some(kb)) => ka
            .user_key
            .cmp(kb.user_key)
            .then(ka.version.cmp(&kb.version))
            .then_with(|| match (ka.score_member(), kb.score_member()) {
                (Some((sa, ma)), Some((sb, mb))) => sa.total_cmp(&sb).then_with(|| ma.cmp(mb)),
                _ => ka.suffix.cmp(kb.suffix),
            }),
        (a_key, b_key) => fallback(a, a_key.is_some(), b, b_key.is_some()),
    }
}

fn fallback(a: &[u8], a_ok: bool, b: &[u8], b_ok: bool) -> Ordering {
    match (a_ok, b_ok) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.cmp(b),
    }
}

/// Key type of the `list_data_cf` table
#[derive(Debug)]
pub struct ListsDataKeyComparator;

impl Value for ListsDataKeyComparator {
    type SelfType<'a> = &'a [u8];
    type AsBytes<'a> = &'a [u8];

    fn fixed_width() -> Option<usize> {
        None
    }

    fn from_bytes<'a>(data: &'a [u8]) -> &'a [u8]
    where
        Self: 'a,
    {
        data
    }

    fn as_bytes<'a, 'b: 'a>(value: &'a &'b [u8]) -> &'a [u8]
    where
        Self: 'b,
    {
        value
    }

    fn type_name() -> TypeName {
        TypeName::new("ferrodis::ListsDataKey")
    }
}

impl Key for ListsDataKeyComparator {
    fn compare(data1: &[u8], data2: &[u8]) -> Ordering {
        compare_list_keys(data1, data2)
    }
}

/// Key type of the `zset_score_cf` table
#[derive(Debug)]
pub struct ZSetsScoreKeyComparator;

impl Value for ZSetsScoreKeyComparator {
    type SelfType<'a> = &'a [u8];
    type AsBytes<'a> = &'a [u8];

    fn fixed_width() -> Option<usize> {
        None
    }

    fn from_bytes<'a>(data: &'a [u8]) -> &'a [u8]
    where
        Self: 'a,
    {
        data
    }

    fn as_bytes<'a, 'b: 'a>(value: &'a &'b [u8]) -> &'a [u8]
    where
        Self: 'b,
    {
        value
    }

    fn type_name() -> TypeName {
        TypeName::new("ferrodis::ZSetsScoreKey")
    }
}

impl Key for ZSetsScoreKeyComparator {
    fn compare(data1: &[u8], data2: &[u8]) -> Ordering {
        compare_score_keys(data1, data2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{list_key, score_key, INITIAL_LEFT_INDEX, INITIAL_RIGHT_INDEX};
    use rand::seq::SliceRandom;

    #[test]
    fn test_list_order_is_numeric() {
        // 256 and 1 differ in their first little-endian byte the "wrong" way
        let a = list_key(b"q", 1, 1);
        let b = list_key(b"q", 1, 256);
        assert_eq!(a.cmp(&b), Ordering::Greater);
        assert_eq!(compare_list_keys(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_list_iteration_yields_increasing_sequence() {
        let mut seqs: Vec<u64> = (0..200)
            .map(|i| INITIAL_LEFT_INDEX - 100 + i * 3)
            .collect();
        seqs.shuffle(&mut rand::thread_rng());

        let mut keys: Vec<Vec<u8>> = seqs.iter().map(|s| list_key(b"mylist", 5, *s)).collect();
        keys.sort_by(|a, b| compare_list_keys(a, b));

        let ordered: Vec<u64> = keys
            .iter()
            .map(|k| DataKey::decode(k).unwrap().list_seq().unwrap())
            .collect();
        assert!(ordered.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_list_groups_by_key_then_version() {
        let mut keys = vec![
            list_key(b"b", 1, INITIAL_RIGHT_INDEX),
            list_key(b"a", 2, INITIAL_LEFT_INDEX),
            list_key(b"a", 1, INITIAL_RIGHT_INDEX),
            list_key(b"ab", 1, 0),
        ];
        keys.sort_by(|a, b| compare_list_keys(a, b));
        let order: Vec<(&[u8], u64)> = keys
            .iter()
            .map(|k| {
                let d = DataKey::decode(k).unwrap();
                (d.user_key, d.version)
            })
            .collect();
        assert_eq!(
            order,
            vec![(&b"a"[..], 1), (&b"a"[..], 2), (&b"ab"[..], 1), (&b"b"[..], 1)]
        );
    }

    #[test]
    fn test_score_iteration_non_decreasing_with_member_tiebreak() {
        let entries: Vec<(f64, &[u8])> = vec![
            (3.0, b"c"),
            (-2.5, b"x"),
            (1.0, b"b"),
            (1.0, b"a"),
            (100.0, b"z"),
            (f64::NEG_INFINITY, b"low"),
            (0.5, b"m"),
            (1.0, b"aa"),
        ];
        let mut keys: Vec<Vec<u8>> = entries
            .iter()
            .map(|(s, m)| score_key(b"board", 1, *s, m))
            .collect();
        keys.shuffle(&mut rand::thread_rng());
        keys.sort_by(|a, b| compare_score_keys(a, b));

        let decoded: Vec<(f64, Vec<u8>)> = keys
            .iter()
            .map(|k| {
                let (s, m) = DataKey::decode(k).unwrap().score_member().unwrap();
                (s, m.to_vec())
            })
            .collect();
        for w in decoded.windows(2) {
            assert!(w[0].0 <= w[1].0);
            if w[0].0 == w[1].0 {
                assert!(w[0].1 < w[1].1);
            }
        }
        assert_eq!(decoded[0].1, b"low");
        let ones: Vec<&[u8]> = decoded
            .iter()
            .filter(|(s, _)| *s == 1.0)
            .map(|(_, m)| m.as_slice())
            .collect();
        assert_eq!(ones, vec![&b"a"[..], &b"aa"[..], &b"b"[..]]);
    }

    #[test]
    fn test_negative_scores_order_numerically() {
        let a = score_key(b"z", 1, -10.0, b"m");
        let b = score_key(b"z", 1, -1.0, b"m");
        assert_eq!(compare_score_keys(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_malformed_keys_sort_last() {
        let good = list_key(b"q", 1, 1);
        assert_eq!(compare_list_keys(&good, b"\xff"), Ordering::Less);
        assert_eq!(compare_score_keys(b"\xff", b"\xfe"), Ordering::Greater);
    }
}
