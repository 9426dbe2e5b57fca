//! Typed in-memory containers backing the Carmine keyspace.
//!
//! Every payload lives behind an [`Arc`]; the keyspace mutates through
//! [`Value::make_mut`]-style accessors which clone the container iff a
//! snapshot still holds the previous generation. That is the whole
//! copy-on-write discipline: snapshots keep `Arc` handles alive, writers
//! clone on first touch, and readers of a snapshot observe the keyspace
//! exactly as it stood when the snapshot was taken.

pub mod bloom;
pub mod geo;
pub mod hll;
pub mod list;
pub mod sorted_set;
pub mod string;

mod fmt;

pub use fmt::fmt_f64;

use std::sync::Arc;

use bytes::Bytes;
use carmine_errors::{CarmineError, CarmineResult};
use indexmap::{IndexMap, IndexSet};

pub use bloom::BloomFilter;
pub use hll::HyperLogLog;
pub use list::List;
pub use sorted_set::SortedSet;
pub use string::StringValue;

/// Field → value map for the hash type. Insertion order is not part of the
/// observable contract but the deterministic iteration keeps replies stable
/// under test.
pub type Hash = IndexMap<Bytes, Bytes, ahash::RandomState>;

/// Distinct-member collection for the set type. Index-addressable so random
/// member sampling is O(1).
pub type Set = IndexSet<Bytes, ahash::RandomState>;

/// The kind tag of a [`Value`], used for type checks and the `TYPE` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    List,
    Hash,
    Set,
    SortedSet,
    Bloom,
    HyperLogLog,
}

impl ValueKind {
    /// The name rendered by the `TYPE` command. Probabilistic containers
    /// report as strings, matching how clients discover them.
    pub fn type_name(self) -> &'static str {
        match self {
            ValueKind::String | ValueKind::Bloom | ValueKind::HyperLogLog => "string",
            ValueKind::List => "list",
            ValueKind::Hash => "hash",
            ValueKind::Set => "set",
            ValueKind::SortedSet => "zset",
        }
    }
}

/// One keyspace payload: a tagged union over the supported container types.
///
/// Bitmaps are not a separate kind; bit operations address the string
/// payload as a left-to-right bit array.
#[derive(Debug, Clone)]
pub enum Value {
    String(Arc<StringValue>),
    List(Arc<List>),
    Hash(Arc<Hash>),
    Set(Arc<Set>),
    SortedSet(Arc<SortedSet>),
    Bloom(Arc<BloomFilter>),
    HyperLogLog(Arc<HyperLogLog>),
}

impl Value {
    pub fn string(bytes: impl Into<Bytes>) -> Self {
        Value::String(Arc::new(StringValue::from_bytes(bytes.into())))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Hash(_) => ValueKind::Hash,
            Value::Set(_) => ValueKind::Set,
            Value::SortedSet(_) => ValueKind::SortedSet,
            Value::Bloom(_) => ValueKind::Bloom,
            Value::HyperLogLog(_) => ValueKind::HyperLogLog,
        }
    }

    /// Whether the aggregate is empty and the key should be reaped.
    /// Strings and probabilistic values persist at length zero.
    pub fn is_empty_aggregate(&self) -> bool {
        match self {
            Value::List(l) => l.len() == 0,
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::SortedSet(z) => z.len() == 0,
            Value::String(_) | Value::Bloom(_) | Value::HyperLogLog(_) => false,
        }
    }
}

// Typed accessors. The immutable getters perform the kind check that
// precedes every payload access; the `_mut` getters additionally run the
// clone-on-write step via `Arc::make_mut`, which copies the container only
// when a snapshot still references it.
macro_rules! accessors {
    ($as_ref:ident, $as_mut:ident, $variant:ident, $ty:ty) => {
        impl Value {
            pub fn $as_ref(&self) -> CarmineResult<&$ty> {
                match self {
                    Value::$variant(inner) => Ok(inner),
                    _ => Err(CarmineError::WrongType),
                }
            }

            pub fn $as_mut(&mut self) -> CarmineResult<&mut $ty> {
                match self {
                    Value::$variant(inner) => Ok(Arc::make_mut(inner)),
                    _ => Err(CarmineError::WrongType),
                }
            }
        }
    };
}

accessors!(as_string, as_string_mut, String, StringValue);
accessors!(as_list, as_list_mut, List, List);
accessors!(as_hash, as_hash_mut, Hash, Hash);
accessors!(as_set, as_set_mut, Set, Set);
accessors!(as_sorted_set, as_sorted_set_mut, SortedSet, SortedSet);
accessors!(as_bloom, as_bloom_mut, Bloom, BloomFilter);
accessors!(as_hll, as_hll_mut, HyperLogLog, HyperLogLog);

/// Resolve a possibly-negative index against a collection of `len` items,
/// clamping to the valid range. Returns `None` when the whole range falls
/// outside the collection.
pub fn clamp_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wrong_kind_access_is_an_error() {
        let mut value = Value::string("x");
        assert!(matches!(value.as_list(), Err(CarmineError::WrongType)));
        assert!(matches!(value.as_hash_mut(), Err(CarmineError::WrongType)));
        assert!(value.as_string().is_ok());
    }

    #[test]
    fn make_mut_clones_only_when_shared() {
        let mut value = Value::List(Arc::new(List::default()));
        // Simulate an outstanding snapshot holding the payload.
        let snapshot = match &value {
            Value::List(l) => Arc::clone(l),
            _ => unreachable!(),
        };
        value.as_list_mut().unwrap().push_back(Bytes::from("a"));
        assert_eq!(snapshot.len(), 0);
        assert_eq!(value.as_list().unwrap().len(), 1);
    }

    #[test]
    fn range_clamping() {
        assert_eq!(clamp_range(0, -1, 3), Some((0, 2)));
        assert_eq!(clamp_range(-2, -1, 3), Some((1, 2)));
        assert_eq!(clamp_range(1, 0, 3), None);
        assert_eq!(clamp_range(5, 9, 3), None);
        assert_eq!(clamp_range(-100, 100, 3), Some((0, 2)));
        assert_eq!(clamp_range(0, 0, 0), None);
    }

    #[test]
    fn type_names() {
        assert_eq!(ValueKind::SortedSet.type_name(), "zset");
        assert_eq!(ValueKind::HyperLogLog.type_name(), "string");
    }
}
