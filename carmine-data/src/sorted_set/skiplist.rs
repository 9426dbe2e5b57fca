//! The probabilistic skip list under the sorted set.
//!
//! Nodes are kept in a [`Slab`] arena and refer to each other by key. Each
//! level link carries a span: the number of rank positions the link jumps
//! over. Summing spans along a search path therefore recovers the rank of
//! the landing node in O(log n), and rank-indexed lookups walk the same way.
//!
//! Ordering is by (score, member): scores compare numerically, ties break by
//! member bytes ascending. Scores are validated non-NaN before they reach
//! this module.

use std::cmp::Ordering;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use slab::Slab;

pub(crate) const MAX_LEVEL: usize = 32;

#[derive(Debug, Clone)]
struct Link {
    next: Option<usize>,
    span: usize,
}

#[derive(Debug, Clone)]
struct Node {
    member: Bytes,
    score: f64,
    links: Vec<Link>,
    backward: Option<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct SkipList {
    nodes: Slab<Node>,
    /// Header links, one per active level.
    head: Vec<Link>,
    tail: Option<usize>,
    len: usize,
    rng: SmallRng,
}

pub(crate) fn entry_cmp(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> Ordering {
    a_score
        .partial_cmp(&b_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a_member.cmp(b_member))
}

impl Default for SkipList {
    fn default() -> Self {
        SkipList {
            nodes: Slab::new(),
            head: vec![Link { next: None, span: 0 }],
            tail: None,
            len: 0,
            rng: SmallRng::from_os_rng(),
        }
    }
}

impl SkipList {
    pub fn len(&self) -> usize {
        self.len
    }

    fn level(&self) -> usize {
        self.head.len()
    }

    fn link(&self, from: Option<usize>, level: usize) -> &Link {
        match from {
            None => &self.head[level],
            Some(key) => &self.nodes[key].links[level],
        }
    }

    fn link_mut(&mut self, from: Option<usize>, level: usize) -> &mut Link {
        match from {
            None => &mut self.head[level],
            Some(key) => &mut self.nodes[key].links[level],
        }
    }

    /// Level of a new node: promotion probability 1/4, capped at
    /// [`MAX_LEVEL`].
    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.random::<u32>() < u32::MAX / 4 {
            level += 1;
        }
        level
    }

    /// Insert a (score, member) pair the caller knows to be absent.
    pub fn insert(&mut self, score: f64, member: Bytes) {
        let mut update: Vec<Option<usize>> = vec![None; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];

        let mut x: Option<usize> = None;
        for i in (0..self.level()).rev() {
            rank[i] = if i + 1 == self.level() { 0 } else { rank[i + 1] };
            loop {
                let link = self.link(x, i);
                match link.next {
                    Some(next)
                        if entry_cmp(
                            self.nodes[next].score,
                            &self.nodes[next].member,
                            score,
                            &member,
                        ) == Ordering::Less =>
                    {
                        rank[i] += link.span;
                        x = Some(next);
                    }
                    _ => break,
                }
            }
            update[i] = x;
        }

        let node_level = self.random_level();
        if node_level > self.level() {
            for i in self.level()..node_level {
                rank[i] = 0;
                update[i] = None;
                self.head.push(Link { next: None, span: self.len });
            }
        }

        let key = self.nodes.insert(Node {
            member,
            score,
            links: Vec::with_capacity(node_level),
            backward: update[0],
        });
        for i in 0..node_level {
            let upstream = self.link(update[i], i).clone();
            let stepped = rank[0] - rank[i];
            self.nodes[key].links.push(Link {
                next: upstream.next,
                span: upstream.span - stepped,
            });
            let up = self.link_mut(update[i], i);
            up.next = Some(key);
            up.span = stepped + 1;
        }
        for i in node_level..self.level() {
            self.link_mut(update[i], i).span += 1;
        }

        match self.nodes[key].links[0].next {
            Some(next) => self.nodes[next].backward = Some(key),
            None => self.tail = Some(key),
        }
        self.len += 1;
    }

    /// Remove a (score, member) pair. Returns whether it was present.
    pub fn remove(&mut self, score: f64, member: &[u8]) -> bool {
        let mut update: Vec<Option<usize>> = vec![None; self.level()];
        let mut x: Option<usize> = None;
        for i in (0..self.level()).rev() {
            loop {
                match self.link(x, i).next {
                    Some(next)
                        if entry_cmp(
                            self.nodes[next].score,
                            &self.nodes[next].member,
                            score,
                            member,
                        ) == Ordering::Less =>
                    {
                        x = Some(next);
                    }
                    _ => break,
                }
            }
            update[i] = x;
        }

        let target = match self.link(update[0], 0).next {
            Some(key)
                if self.nodes[key].score == score && self.nodes[key].member.as_ref() == member =>
            {
                key
            }
            _ => return false,
        };
        self.unlink(target, &update);
        true
    }

    fn unlink(&mut self, target: usize, update: &[Option<usize>]) {
        for i in 0..self.level() {
            let (target_next, target_span) = {
                let node = &self.nodes[target];
                if i < node.links.len() {
                    (Some(node.links[i].next), node.links[i].span)
                } else {
                    (None, 0)
                }
            };
            let link = self.link_mut(update[i], i);
            if link.next == Some(target) {
                link.span += target_span - 1;
                link.next = target_next.flatten();
            } else {
                link.span -= 1;
            }
        }

        let removed = self.nodes.remove(target);
        match removed.links[0].next {
            Some(next) => self.nodes[next].backward = removed.backward,
            None => self.tail = removed.backward,
        }
        while self.level() > 1 && self.head.last().map(|l| l.next.is_none()).unwrap_or(false) {
            self.head.pop();
        }
        self.len -= 1;
    }

    /// 0-based rank of `member` (whose score the caller already resolved).
    pub fn rank(&self, score: f64, member: &[u8]) -> Option<usize> {
        let mut rank = 0usize;
        let mut x: Option<usize> = None;
        for i in (0..self.level()).rev() {
            loop {
                let link = self.link(x, i);
                match link.next {
                    Some(next)
                        if entry_cmp(
                            self.nodes[next].score,
                            &self.nodes[next].member,
                            score,
                            member,
                        ) != Ordering::Greater =>
                    {
                        rank += link.span;
                        x = Some(next);
                    }
                    _ => break,
                }
            }
            if let Some(key) = x {
                if self.nodes[key].member.as_ref() == member {
                    return Some(rank - 1);
                }
            }
        }
        None
    }

    /// Node at 0-based `rank`, found by descending the span counts.
    fn key_by_rank(&self, rank: usize) -> Option<usize> {
        if rank >= self.len {
            return None;
        }
        let target = rank + 1;
        let mut traversed = 0usize;
        let mut x: Option<usize> = None;
        for i in (0..self.level()).rev() {
            loop {
                let link = self.link(x, i);
                match link.next {
                    Some(next) if traversed + link.span <= target => {
                        traversed += link.span;
                        x = Some(next);
                    }
                    _ => break,
                }
            }
            if traversed == target {
                return x;
            }
        }
        None
    }

    /// Entries in `[start, stop]` by 0-based rank, ascending. Visits
    /// O(log n + k) nodes: one rank descent, then level-0 hops.
    pub fn range_by_rank(&self, start: usize, stop: usize) -> Vec<(Bytes, f64)> {
        let mut out = Vec::with_capacity(stop.saturating_sub(start) + 1);
        let mut cursor = self.key_by_rank(start);
        for _ in start..=stop {
            let Some(key) = cursor else { break };
            let node = &self.nodes[key];
            out.push((node.member.clone(), node.score));
            cursor = node.links[0].next;
        }
        out
    }

    /// First node (by rank) whose score satisfies `min`, where `min` is
    /// `(bound, exclusive)`.
    fn first_in_range(&self, min: f64, min_exclusive: bool) -> Option<usize> {
        let mut x: Option<usize> = None;
        for i in (0..self.level()).rev() {
            loop {
                match self.link(x, i).next {
                    Some(next) => {
                        let s = self.nodes[next].score;
                        let below = if min_exclusive { s <= min } else { s < min };
                        if below {
                            x = Some(next);
                        } else {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        self.link(x, 0).next
    }

    /// Entries with score inside the given bounds, ascending.
    pub fn range_by_score(
        &self,
        min: f64,
        min_exclusive: bool,
        max: f64,
        max_exclusive: bool,
    ) -> Vec<(Bytes, f64)> {
        let mut out = Vec::new();
        let mut cursor = self.first_in_range(min, min_exclusive);
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            let beyond = if max_exclusive {
                node.score >= max
            } else {
                node.score > max
            };
            if beyond {
                break;
            }
            out.push((node.member.clone(), node.score));
            cursor = node.links[0].next;
        }
        out
    }

    pub fn first(&self) -> Option<(Bytes, f64)> {
        self.head[0]
            .next
            .map(|key| (self.nodes[key].member.clone(), self.nodes[key].score))
    }

    pub fn last(&self) -> Option<(Bytes, f64)> {
        self.tail
            .map(|key| (self.nodes[key].member.clone(), self.nodes[key].score))
    }

    /// Iterate every entry in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        SkipIter { list: self, cursor: self.head[0].next }
    }
}

struct SkipIter<'a> {
    list: &'a SkipList,
    cursor: Option<usize>,
}

impl<'a> Iterator for SkipIter<'a> {
    type Item = (&'a Bytes, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let node = &self.list.nodes[key];
        self.cursor = node.links[0].next;
        Some((&node.member, node.score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn members(entries: &[(Bytes, f64)]) -> Vec<&[u8]> {
        entries.iter().map(|(m, _)| m.as_ref()).collect()
    }

    #[test]
    fn keeps_rank_order_with_ties_by_member() {
        let mut list = SkipList::default();
        list.insert(2.0, b("c"));
        list.insert(1.0, b("a"));
        list.insert(2.0, b("b"));
        list.insert(3.0, b("d"));
        let all = list.range_by_rank(0, 3);
        assert_eq!(members(&all), vec![&b"a"[..], b"b", b"c", b"d"]);

        assert_eq!(list.rank(1.0, b"a"), Some(0));
        assert_eq!(list.rank(2.0, b"b"), Some(1));
        assert_eq!(list.rank(2.0, b"c"), Some(2));
        assert_eq!(list.rank(3.0, b"d"), Some(3));
        assert_eq!(list.rank(2.0, b"zz"), None);
    }

    #[test]
    fn remove_maintains_spans() {
        let mut list = SkipList::default();
        for (i, m) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            list.insert(i as f64, b(m));
        }
        assert!(list.remove(2.0, b"c"));
        assert!(!list.remove(2.0, b"c"));
        assert_eq!(list.len(), 4);
        assert_eq!(list.rank(3.0, b"d"), Some(2));
        assert_eq!(list.rank(4.0, b"e"), Some(3));
        assert_eq!(
            members(&list.range_by_rank(1, 2)),
            vec![&b"b"[..], b"d"]
        );
        assert_eq!(list.last().unwrap().0, b("e"));
    }

    #[test]
    fn range_by_score_bounds() {
        let mut list = SkipList::default();
        for (score, m) in [(1.0, "a"), (2.0, "b"), (2.0, "c"), (3.0, "d")] {
            list.insert(score, b(m));
        }
        assert_eq!(
            members(&list.range_by_score(2.0, false, 3.0, false)),
            vec![&b"b"[..], b"c", b"d"]
        );
        assert_eq!(
            members(&list.range_by_score(2.0, true, 3.0, false)),
            vec![&b"d"[..]]
        );
        assert_eq!(
            members(&list.range_by_score(f64::NEG_INFINITY, false, 2.0, true)),
            vec![&b"a"[..]]
        );
        assert!(list.range_by_score(5.0, false, 9.0, false).is_empty());
    }

    #[test]
    fn rank_survives_heavy_churn() {
        let mut list = SkipList::default();
        for i in 0..500 {
            list.insert((i % 50) as f64, Bytes::from(format!("m{i:03}")));
        }
        assert_eq!(list.len(), 500);
        // Delete every other entry.
        for i in (0..500).step_by(2) {
            assert!(list.remove((i % 50) as f64, format!("m{i:03}").as_bytes()));
        }
        assert_eq!(list.len(), 250);
        // Surviving entries still report consistent ranks.
        let all = list.range_by_rank(0, 249);
        assert_eq!(all.len(), 250);
        for (rank, (member, score)) in all.iter().enumerate() {
            assert_eq!(list.rank(*score, member), Some(rank));
        }
        // And the order matches a straight sort of the survivors.
        let mut expected: Vec<(f64, Bytes)> =
            all.iter().map(|(m, s)| (*s, m.clone())).collect();
        expected.sort_by(|(s1, m1), (s2, m2)| entry_cmp(*s1, m1, *s2, m2));
        for (i, (score, member)) in expected.iter().enumerate() {
            assert_eq!(&all[i].0, member);
            assert_eq!(all[i].1, *score);
        }
    }
}
