//! Sorted sets
//!
//! Each member is stored twice in one transaction: member -> score in
//! `zset_data_cf` for point lookups, and score|member in `zset_score_cf`
//! whose comparator keeps a generation in score order.

use super::{live_meta, normalize_range};
use crate::cf::{META, ZSETS_DATA, ZSETS_SCORE};
use crate::coding::{DataKey, MetaValue, data_key, data_prefix, decode_score, encode_score, score_key};
use crate::error::{Error, Result};
use crate::instance::Engine;
use crate::util::now_ms;
use ferrodis_common::DataType;
use redb::ReadableTable;
use std::time::Instant;

/// Lowest and highest score key of one generation in `zset_score_cf`
fn generation_bounds(key: &[u8], version: u64) -> (Vec<u8>, Vec<u8>) {
    (
        data_prefix(DataType::ZSets, key, version),
        data_prefix(DataType::ZSets, key, version.saturating_add(1)),
    )
}

fn decode_member(raw: &[u8]) -> Result<(Vec<u8>, f64)> {
    DataKey::decode(raw)
        .and_then(|k| k.score_member())
        .map(|(score, member)| (member.to_vec(), score))
        .ok_or_else(|| Error::corruption("malformed zset score key"))
}

impl Engine {
    /// Add members or update their scores, returning how many were new
    pub fn zadd(&self, key: &[u8], members: &[(f64, &[u8])]) -> Result<u64> {
        if members.iter().any(|(score, _)| score.is_nan()) {
            return Err(Error::invalid_argument("score is not a valid float"));
        }
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let (added, rescored) = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(ZSETS_DATA)?;
            let mut scores = txn.open_table(ZSETS_SCORE)?;
            let mut meta = live_meta(&meta_table, key, DataType::ZSets, now)?
                .unwrap_or_else(|| MetaValue::collection(DataType::ZSets, self.versions.next()));

            let (mut added, mut rescored) = (0, 0);
            for (score, member) in members {
                let member_key = data_key(DataType::ZSets, key, meta.version, member);
                let old = data
                    .get(member_key.as_slice())?
                    .and_then(|v| decode_score(v.value()));
                match old {
                    Some(old) if old == *score => continue,
                    Some(old) => {
                        scores.remove(score_key(key, meta.version, old, member).as_slice())?;
                        rescored += 1;
                    }
                    None => added += 1,
                }
                data.insert(member_key.as_slice(), encode_score(*score).as_slice())?;
                scores.insert(
                    score_key(key, meta.version, *score, member).as_slice(),
                    b"".as_slice(),
                )?;
            }
            if added > 0 {
                meta.count += added;
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            (added, rescored)
        };
        self.commit(txn)?;

        self.statistics.record_mutation(DataType::ZSets, key, rescored);
        Ok(added)
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::ZSets, now_ms())? else {
            return Ok(None);
        };
        let data = txn.open_table(ZSETS_DATA)?;
        let member_key = data_key(DataType::ZSets, key, meta.version, member);
        Ok(data
            .get(member_key.as_slice())?
            .and_then(|v| decode_score(v.value())))
    }

    /// Remove members, returning how many existed
    pub fn zrem(&self, key: &[u8], members: &[&[u8]]) -> Result<u64> {
        let _guard = self.lock_mgr.lock(key);
        let now = now_ms();

        let txn = self.begin_write()?;
        let removed = {
            let mut meta_table = txn.open_table(META)?;
            let mut data = txn.open_table(ZSETS_DATA)?;
            let mut scores = txn.open_table(ZSETS_SCORE)?;
            let Some(mut meta) = live_meta(&meta_table, key, DataType::ZSets, now)? else {
                return Ok(0);
            };
            let mut removed = 0;
            for member in members {
                let member_key = data_key(DataType::ZSets, key, meta.version, member);
                let Some(score) = data
                    .remove(member_key.as_slice())?
                    .and_then(|v| decode_score(v.value()))
                else {
                    continue;
                };
                scores.remove(score_key(key, meta.version, score, member).as_slice())?;
                removed += 1;
            }
            meta.count = meta.count.saturating_sub(removed);
            if meta.count == 0 {
                meta_table.remove(key)?;
            } else if removed > 0 {
                meta_table.insert(key, meta.encode().as_slice())?;
            }
            removed
        };
        self.commit(txn)?;

        self.statistics.record_mutation(DataType::ZSets, key, removed);
        Ok(removed)
    }

    pub fn zcard(&self, key: &[u8]) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        Ok(live_meta(&meta_table, key, DataType::ZSets, now_ms())?.map_or(0, |m| m.count))
    }

    /// Members with ranks between `start` and `stop` inclusive, by ascending
    /// score
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<(Vec<u8>, f64)>> {
        let started = Instant::now();
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::ZSets, now_ms())? else {
            return Ok(Vec::new());
        };
        let Some((first, last)) = normalize_range(start, stop, meta.count) else {
            return Ok(Vec::new());
        };

        let scores = txn.open_table(ZSETS_SCORE)?;
        let (lower, upper) = generation_bounds(key, meta.version);
        let mut members = Vec::with_capacity((last - first + 1) as usize);
        for entry in scores
            .range::<&[u8]>(lower.as_slice()..upper.as_slice())?
            .skip(first as usize)
            .take((last - first + 1) as usize)
        {
            let (k, _) = entry?;
            members.push(decode_member(k.value())?);
        }

        self.statistics.record_duration(
            DataType::ZSets,
            key,
            started.elapsed().as_micros() as u64,
        );
        Ok(members)
    }

    /// Members with `min <= score <= max`, by ascending score
    pub fn zrange_by_score(&self, key: &[u8], min: f64, max: f64) -> Result<Vec<(Vec<u8>, f64)>> {
        if min.is_nan() || max.is_nan() {
            return Err(Error::invalid_argument("min or max is not a float"));
        }
        let txn = self.db.begin_read()?;
        let meta_table = txn.open_table(META)?;
        let Some(meta) = live_meta(&meta_table, key, DataType::ZSets, now_ms())? else {
            return Ok(Vec::new());
        };
        if min > max {
            return Ok(Vec::new());
        }

        let scores = txn.open_table(ZSETS_SCORE)?;
        let lower = score_key(key, meta.version, min, b"");
        let (_, upper) = generation_bounds(key, meta.version);
        let mut members = Vec::new();
        for entry in scores.range::<&[u8]>(lower.as_slice()..upper.as_slice())? {
            let (k, _) = entry?;
            let (member, score) = decode_member(k.value())?;
            if score > max {
                break;
            }
            members.push((member, score));
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use crate::StatusKind;
    use crate::instance::tests::open_engine;
    use ferrodis_common::{DataType, StorageOptions};

    fn names(members: Vec<(Vec<u8>, f64)>) -> Vec<String> {
        members
            .into_iter()
            .map(|(m, _)| String::from_utf8(m).unwrap())
            .collect()
    }

    #[test]
    fn test_zadd_zscore() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        let added = engine
            .zadd(b"z", &[(2.0, b"b".as_slice()), (1.0, b"a"), (3.0, b"c")])
            .unwrap();
        assert_eq!(added, 3);
        assert_eq!(engine.zadd(b"z", &[(5.0, b"a".as_slice())]).unwrap(), 0);
        assert_eq!(engine.zscore(b"z", b"a").unwrap(), Some(5.0));
        assert_eq!(engine.zscore(b"z", b"x").unwrap(), None);
        assert_eq!(engine.zcard(b"z").unwrap(), 3);
        // the rescore left no stale entry in score order
        assert_eq!(names(engine.zrange(b"z", 0, -1).unwrap()), ["b", "c", "a"]);
        let stats = engine.statistics().get(DataType::ZSets, b"z").unwrap();
        assert_eq!(stats.modify_count, 1);
    }

    #[test]
    fn test_zadd_rejects_nan() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        let err = engine.zadd(b"z", &[(f64::NAN, b"a".as_slice())]).unwrap_err();
        assert_eq!(err.kind(), StatusKind::InvalidArgument);
        assert_eq!(engine.zcard(b"z").unwrap(), 0);
    }

    #[test]
    fn test_zrange_by_rank() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        engine
            .zadd(
                b"z",
                &[(-1.5, b"neg".as_slice()), (0.0, b"zero"), (10.0, b"ten"), (2.0, b"two")],
            )
            .unwrap();
        let all = engine.zrange(b"z", 0, -1).unwrap();
        assert_eq!(all[0], (b"neg".to_vec(), -1.5));
        assert_eq!(names(all), ["neg", "zero", "two", "ten"]);
        assert_eq!(names(engine.zrange(b"z", 1, 2).unwrap()), ["zero", "two"]);
        assert_eq!(names(engine.zrange(b"z", -1, -1).unwrap()), ["ten"]);
        assert!(engine.zrange(b"z", 5, 10).unwrap().is_empty());
    }

    #[test]
    fn test_zrange_by_score() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        engine
            .zadd(
                b"z",
                &[(1.0, b"a".as_slice()), (2.0, b"b"), (2.0, b"c"), (3.0, b"d")],
            )
            .unwrap();
        // another key sorting right after must not leak in
        engine.zadd(b"z2", &[(2.5, b"x".as_slice())]).unwrap();

        assert_eq!(names(engine.zrange_by_score(b"z", 2.0, 2.9).unwrap()), ["b", "c"]);
        assert_eq!(
            names(engine.zrange_by_score(b"z", f64::NEG_INFINITY, f64::INFINITY).unwrap()),
            ["a", "b", "c", "d"]
        );
        assert!(engine.zrange_by_score(b"z", 4.0, 1.0).unwrap().is_empty());
    }

    #[test]
    fn test_zrem() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        engine
            .zadd(b"z", &[(1.0, b"a".as_slice()), (2.0, b"b")])
            .unwrap();
        assert_eq!(engine.zrem(b"z", &[b"a".as_slice(), b"x"]).unwrap(), 1);
        assert_eq!(names(engine.zrange(b"z", 0, -1).unwrap()), ["b"]);
        assert_eq!(engine.zrem(b"z", &[b"b".as_slice()]).unwrap(), 1);
        assert_eq!(engine.key_type(b"z").unwrap(), DataType::None);
        assert!(engine.zrange(b"z", 0, -1).unwrap().is_empty());
    }

    #[test]
    fn test_recreated_zset_hides_old_generation() {
        let (_dir, engine, _rx) = open_engine(StorageOptions::default());
        engine.zadd(b"z", &[(1.0, b"old".as_slice())]).unwrap();
        engine.del(&[b"z".as_slice()]).unwrap();
        engine.zadd(b"z", &[(2.0, b"new".as_slice())]).unwrap();
        assert_eq!(names(engine.zrange(b"z", 0, -1).unwrap()), ["new"]);
        assert_eq!(names(engine.zrange_by_score(b"z", 0.0, 10.0).unwrap()), ["new"]);
        assert_eq!(engine.zscore(b"z", b"old").unwrap(), None);
    }
}
