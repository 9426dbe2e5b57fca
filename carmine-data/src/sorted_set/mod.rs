//! The sorted set engine: a member → score dictionary paired with a
//! span-maintaining skip list ordered by (score, member).
//!
//! The dictionary answers point lookups (`ZSCORE`) in O(1); the skip list
//! answers rank and range queries in O(log n). Every mutation keeps the two
//! in lockstep.

mod skiplist;

use bytes::Bytes;
use carmine_errors::{CarmineError, CarmineResult};

use crate::clamp_range;
use skiplist::SkipList;

type ScoreMap = std::collections::HashMap<Bytes, f64, ahash::RandomState>;

/// One endpoint of a score interval, as written on the wire: `5`, `(5`,
/// `+inf`, `-inf`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBound {
    pub fn parse(input: &[u8]) -> CarmineResult<Self> {
        let (raw, exclusive) = match input.first() {
            Some(b'(') => (&input[1..], true),
            _ => (input, false),
        };
        let text = std::str::from_utf8(raw).map_err(|_| CarmineError::NotAFloat)?;
        let value = match text.to_ascii_lowercase().as_str() {
            "inf" | "+inf" => f64::INFINITY,
            "-inf" => f64::NEG_INFINITY,
            other => other.parse::<f64>().map_err(|_| CarmineError::NotAFloat)?,
        };
        if value.is_nan() {
            return Err(CarmineError::NotAFloat);
        }
        Ok(ScoreBound { value, exclusive })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    map: ScoreMap,
    list: SkipList,
}

impl SortedSet {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.map.get(member).copied()
    }

    /// Add or update. Returns `true` when the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        match self.map.get(&member).copied() {
            Some(old) => {
                if old != score {
                    self.list.remove(old, &member);
                    self.list.insert(score, member.clone());
                    self.map.insert(member, score);
                }
                false
            }
            None => {
                self.list.insert(score, member.clone());
                self.map.insert(member, score);
                true
            }
        }
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.map.remove(member) {
            Some(score) => {
                self.list.remove(score, member);
                true
            }
            None => false,
        }
    }

    /// `ZINCRBY`. NaN results (inf + -inf) are rejected without mutating.
    pub fn incr(&mut self, member: Bytes, delta: f64) -> CarmineResult<f64> {
        let next = match self.map.get(&member).copied() {
            Some(current) => {
                let next = current + delta;
                if next.is_nan() {
                    return Err(CarmineError::NotAFloat);
                }
                next
            }
            None => delta,
        };
        self.insert(member, next);
        Ok(next)
    }

    /// 0-based ascending rank.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = self.score(member)?;
        self.list.rank(score, member)
    }

    /// 0-based descending rank.
    pub fn rev_rank(&self, member: &[u8]) -> Option<usize> {
        self.rank(member).map(|r| self.len() - 1 - r)
    }

    /// `ZRANGE`/`ZREVRANGE`: rank interval with negative-index clamping.
    pub fn range_by_rank(&self, start: i64, stop: i64, rev: bool) -> Vec<(Bytes, f64)> {
        let Some((start, stop)) = clamp_range(start, stop, self.len()) else {
            return Vec::new();
        };
        if rev {
            // Descending rank r maps to ascending rank len-1-r.
            let len = self.len();
            let mut out = self.list.range_by_rank(len - 1 - stop, len - 1 - start);
            out.reverse();
            out
        } else {
            self.list.range_by_rank(start, stop)
        }
    }

    /// `ZRANGEBYSCORE` and (reversed) `ZREVRANGEBYSCORE`.
    pub fn range_by_score(&self, min: ScoreBound, max: ScoreBound, rev: bool) -> Vec<(Bytes, f64)> {
        let mut out = self
            .list
            .range_by_score(min.value, min.exclusive, max.value, max.exclusive);
        if rev {
            out.reverse();
        }
        out
    }

    pub fn count(&self, min: ScoreBound, max: ScoreBound) -> usize {
        self.list
            .range_by_score(min.value, min.exclusive, max.value, max.exclusive)
            .len()
    }

    /// Pop up to `count` lowest-ranked entries.
    pub fn pop_min(&mut self, count: usize) -> Vec<(Bytes, f64)> {
        let mut out = Vec::with_capacity(count.min(self.len()));
        for _ in 0..count {
            let Some((member, score)) = self.list.first() else {
                break;
            };
            self.remove(&member);
            out.push((member, score));
        }
        out
    }

    /// Pop up to `count` highest-ranked entries.
    pub fn pop_max(&mut self, count: usize) -> Vec<(Bytes, f64)> {
        let mut out = Vec::with_capacity(count.min(self.len()));
        for _ in 0..count {
            let Some((member, score)) = self.list.last() else {
                break;
            };
            self.remove(&member);
            out.push((member, score));
        }
        out
    }

    /// `ZREMRANGEBYRANK`. Returns the number removed.
    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> usize {
        let victims = self.range_by_rank(start, stop, false);
        for (member, _) in &victims {
            self.remove(member);
        }
        victims.len()
    }

    /// `ZREMRANGEBYSCORE`. Returns the number removed.
    pub fn remove_range_by_score(&mut self, min: ScoreBound, max: ScoreBound) -> usize {
        let victims = self.range_by_score(min, max, false);
        for (member, _) in &victims {
            self.remove(member);
        }
        victims.len()
    }

    /// All entries in ascending rank order; the snapshot serializers walk
    /// this.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn zset(entries: &[(f64, &str)]) -> SortedSet {
        let mut z = SortedSet::default();
        for (score, member) in entries {
            z.insert(b(member), *score);
        }
        z
    }

    fn members(entries: &[(Bytes, f64)]) -> Vec<&[u8]> {
        entries.iter().map(|(m, _)| m.as_ref()).collect()
    }

    #[test]
    fn insert_update_and_rank() {
        let mut z = zset(&[(1.0, "a"), (2.0, "b"), (2.0, "c"), (3.0, "d")]);
        assert_eq!(z.rank(b"b"), Some(1));
        assert_eq!(z.rank(b"c"), Some(2));
        assert_eq!(z.rev_rank(b"b"), Some(2));

        // Updating a score re-slots the member.
        assert!(!z.insert(b("b"), 9.0));
        assert_eq!(z.rank(b"b"), Some(3));
        assert_eq!(z.score(b"b"), Some(9.0));
        assert_eq!(z.len(), 4);
    }

    #[test]
    fn range_by_rank_directions() {
        let z = zset(&[(1.0, "a"), (2.0, "b"), (2.0, "c"), (3.0, "d")]);
        assert_eq!(
            members(&z.range_by_rank(0, -1, false)),
            vec![&b"a"[..], b"b", b"c", b"d"]
        );
        assert_eq!(
            members(&z.range_by_rank(0, 1, true)),
            vec![&b"d"[..], b"c"]
        );
        assert!(z.range_by_rank(2, 1, false).is_empty());
    }

    #[test]
    fn score_bound_parsing() {
        assert_eq!(
            ScoreBound::parse(b"5").unwrap(),
            ScoreBound { value: 5.0, exclusive: false }
        );
        assert_eq!(
            ScoreBound::parse(b"(5.5").unwrap(),
            ScoreBound { value: 5.5, exclusive: true }
        );
        assert_eq!(ScoreBound::parse(b"+inf").unwrap().value, f64::INFINITY);
        assert_eq!(ScoreBound::parse(b"-inf").unwrap().value, f64::NEG_INFINITY);
        assert!(ScoreBound::parse(b"five").is_err());
    }

    #[test]
    fn score_ranges_and_count() {
        let z = zset(&[(1.0, "a"), (2.0, "b"), (2.0, "c"), (3.0, "d")]);
        let min = ScoreBound::parse(b"2").unwrap();
        let max = ScoreBound::parse(b"+inf").unwrap();
        assert_eq!(members(&z.range_by_score(min, max, false)), vec![&b"b"[..], b"c", b"d"]);
        assert_eq!(members(&z.range_by_score(min, max, true)), vec![&b"d"[..], b"c", b"b"]);
        assert_eq!(z.count(ScoreBound::parse(b"(2").unwrap(), max), 1);
    }

    #[test]
    fn pops() {
        let mut z = zset(&[(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        assert_eq!(members(&z.pop_min(2)), vec![&b"a"[..], b"b"]);
        assert_eq!(members(&z.pop_max(5)), vec![&b"c"[..]]);
        assert!(z.is_empty());
    }

    #[test]
    fn remove_ranges() {
        let mut z = zset(&[(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")]);
        assert_eq!(z.remove_range_by_rank(0, 1), 2);
        assert_eq!(members(&z.range_by_rank(0, -1, false)), vec![&b"c"[..], b"d"]);

        let mut z = zset(&[(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        assert_eq!(
            z.remove_range_by_score(
                ScoreBound::parse(b"2").unwrap(),
                ScoreBound::parse(b"+inf").unwrap()
            ),
            2
        );
        assert_eq!(members(&z.range_by_rank(0, -1, false)), vec![&b"a"[..]]);
    }

    #[test]
    fn incr() {
        let mut z = SortedSet::default();
        assert_eq!(z.incr(b("m"), 2.5).unwrap(), 2.5);
        assert_eq!(z.incr(b("m"), -1.0).unwrap(), 1.5);
        z.insert(b("inf"), f64::INFINITY);
        assert!(z.incr(b("inf"), f64::NEG_INFINITY).is_err());
        assert_eq!(z.score(b"inf"), Some(f64::INFINITY));
    }
}

#[cfg(test)]
mod props {
    use super::*;
    use test_strategy::proptest;

    /// Insert / update / remove against a plain map-and-sort model: order,
    /// ranks, and scores must always agree.
    #[proptest]
    fn agrees_with_a_sorted_model(
        #[strategy(proptest::collection::vec((0u8..16, -8i8..8, proptest::bool::ANY), 1..100))]
        ops: Vec<(u8, i8, bool)>,
    ) {
        let mut zset = SortedSet::default();
        let mut model: std::collections::BTreeMap<Vec<u8>, f64> = Default::default();

        for (id, score, remove) in ops {
            let member = format!("m{id:02}").into_bytes();
            if remove {
                assert_eq!(zset.remove(&member), model.remove(&member).is_some());
            } else {
                let fresh = zset.insert(Bytes::from(member.clone()), f64::from(score));
                assert_eq!(fresh, model.insert(member, f64::from(score)).is_none());
            }
        }

        assert_eq!(zset.len(), model.len());
        let mut expected: Vec<(Vec<u8>, f64)> =
            model.iter().map(|(m, s)| (m.clone(), *s)).collect();
        expected.sort_by(|(m1, s1), (m2, s2)| {
            s1.partial_cmp(s2).unwrap().then_with(|| m1.cmp(m2))
        });

        let got = zset.range_by_rank(0, -1, false);
        assert_eq!(got.len(), expected.len());
        for (rank, ((member, score), (exp_member, exp_score))) in
            got.iter().zip(&expected).enumerate()
        {
            assert_eq!(member.as_ref(), exp_member.as_slice());
            assert_eq!(score, exp_score);
            assert_eq!(zset.rank(member), Some(rank));
            assert_eq!(zset.rev_rank(member), Some(expected.len() - 1 - rank));
            assert_eq!(zset.score(member), Some(*score));
        }
    }
}
