//! The keyspace: key → typed value with a parallel expiry index and the
//! copy-on-write snapshot machinery.
//!
//! Ownership is exclusive: only the processor task ever holds a `&mut
//! Keyspace`. Snapshots are shallow map copies whose `Value` handles share
//! payloads with live storage; while any snapshot is outstanding
//! (`snapshot_refs > 0`, equivalently: a payload `Arc` is shared), the write
//! path clones the container before mutating, so consumers see an immutable
//! point-in-time image without ever pausing writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use carmine_data::{Value, ValueKind};
use carmine_errors::{CarmineError, CarmineResult};
use tracing::debug;

use crate::glob::glob_match;

type Map<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    pub expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now)
    }
}

#[derive(Debug, Default)]
pub struct Keyspace {
    entries: Map<Bytes, Entry>,
    /// Keys carrying a TTL, with the same deadline as the main map. The
    /// expiry sampler draws from this so it never scans TTL-less keys.
    expiries: Map<Bytes, u64>,
    snapshot_refs: Arc<AtomicUsize>,
}

/// A point-in-time view of the keyspace. Shares payloads with live storage;
/// dropping it is the release (decrements the snapshot counter exactly
/// once).
#[derive(Debug)]
pub struct Snapshot {
    entries: Map<Bytes, Entry>,
    taken_at_ms: u64,
    refs: Arc<AtomicUsize>,
}

impl Snapshot {
    /// Entries that were live when the snapshot was taken. Keys already past
    /// their deadline at snapshot time are filtered here rather than at
    /// capture time, keeping the processor's pause to a shallow map copy.
    pub fn live_entries(&self) -> impl Iterator<Item = (&Bytes, &Entry)> {
        let now = self.taken_at_ms;
        self.entries
            .iter()
            .filter(move |(_, entry)| !entry.is_expired(now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of one expiry sampler tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sampled: usize,
    pub expired: usize,
}

impl Keyspace {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot_refs(&self) -> usize {
        self.snapshot_refs.load(Ordering::Acquire)
    }

    /// Look up a key for reading, lazily deleting it if its deadline has
    /// passed. Expired keys behave as if they never existed.
    pub fn get(&mut self, key: &[u8]) -> Option<&Entry> {
        self.evict_if_expired(key);
        self.entries.get(key)
    }

    /// Look up a key for mutation, with the same lazy-expiry discipline.
    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Entry> {
        self.evict_if_expired(key);
        self.entries.get_mut(key)
    }

    fn evict_if_expired(&mut self, key: &[u8]) {
        let now = now_ms();
        if matches!(self.entries.get(key), Some(entry) if entry.is_expired(now)) {
            debug!(key = %String::from_utf8_lossy(key), "lazily expiring key");
            self.entries.remove(key);
            self.expiries.remove(key);
        }
    }

    /// Bind `key` to a fresh value, dropping any previous expiry.
    pub fn set(&mut self, key: Bytes, value: Value) {
        self.expiries.remove(&key);
        self.entries.insert(key, Entry { value, expires_at_ms: None });
    }

    /// Bind `key` with an absolute deadline.
    pub fn set_with_expiry(&mut self, key: Bytes, value: Value, expires_at_ms: u64) {
        self.expiries.insert(key.clone(), expires_at_ms);
        self.entries
            .insert(key, Entry { value, expires_at_ms: Some(expires_at_ms) });
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Entry> {
        self.evict_if_expired(key);
        self.expiries.remove(key);
        self.entries.remove(key)
    }

    /// Set a deadline on an existing key. Returns false when the key is
    /// absent.
    pub fn expire_at(&mut self, key: &[u8], at_ms: u64) -> bool {
        self.evict_if_expired(key);
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.expires_at_ms = Some(at_ms);
        self.expiries.insert(Bytes::copy_from_slice(key), at_ms);
        true
    }

    /// Remove the deadline from a key. Returns true when a deadline existed.
    pub fn persist(&mut self, key: &[u8]) -> bool {
        self.evict_if_expired(key);
        match self.entries.get_mut(key) {
            Some(entry) if entry.expires_at_ms.is_some() => {
                entry.expires_at_ms = None;
                self.expiries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// `TTL`-style probe: `None` for missing, `Some(None)` for no expiry,
    /// `Some(Some(ms))` for the remaining time.
    pub fn ttl_ms(&mut self, key: &[u8]) -> Option<Option<u64>> {
        let entry = self.get(key)?;
        Some(entry.expires_at_ms.map(|at| at.saturating_sub(now_ms())))
    }

    /// Typed read access: kind check after expiry check.
    pub fn read(&mut self, key: &[u8], kind: ValueKind) -> CarmineResult<Option<&Value>> {
        match self.get(key) {
            None => Ok(None),
            Some(entry) if entry.value.kind() == kind => Ok(Some(&entry.value)),
            Some(_) => Err(CarmineError::WrongType),
        }
    }

    /// Typed write access, creating the container with `default` when the
    /// key is absent. The kind check happens before any mutation.
    pub fn write(
        &mut self,
        key: &Bytes,
        kind: ValueKind,
        default: impl FnOnce() -> Value,
    ) -> CarmineResult<&mut Value> {
        self.evict_if_expired(key);
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry { value: default(), expires_at_ms: None });
        if entry.value.kind() != kind {
            return Err(CarmineError::WrongType);
        }
        Ok(&mut entry.value)
    }

    /// Typed write access to an existing key only.
    pub fn write_existing(
        &mut self,
        key: &[u8],
        kind: ValueKind,
    ) -> CarmineResult<Option<&mut Value>> {
        match self.get_mut(key) {
            None => Ok(None),
            Some(entry) if entry.value.kind() == kind => Ok(Some(&mut entry.value)),
            Some(_) => Err(CarmineError::WrongType),
        }
    }

    /// Delete `key` if its aggregate emptied out. Called after removal-type
    /// mutations so no empty list/set/hash/zset is ever observable.
    pub fn reap_if_empty(&mut self, key: &[u8]) {
        if matches!(self.entries.get(key), Some(entry) if entry.value.is_empty_aggregate()) {
            self.entries.remove(key);
            self.expiries.remove(key);
        }
    }

    /// All live keys matching a glob pattern.
    pub fn keys_matching(&mut self, pattern: &[u8]) -> Vec<Bytes> {
        let now = now_ms();
        // Collect-then-filter: lazy deletion mutates, so do it in two
        // passes rather than while iterating.
        let mut expired = Vec::new();
        let mut matched = Vec::new();
        for (key, entry) in &self.entries {
            if entry.is_expired(now) {
                expired.push(key.clone());
            } else if glob_match(pattern, key) {
                matched.push(key.clone());
            }
        }
        for key in expired {
            self.entries.remove(&key);
            self.expiries.remove(&key);
        }
        matched
    }

    pub fn flush(&mut self) {
        self.entries.clear();
        self.expiries.clear();
    }

    /// Take a COW snapshot: shallow map copy, counter increment. The
    /// returned guard releases on drop.
    pub fn snapshot(&mut self) -> Snapshot {
        self.snapshot_refs.fetch_add(1, Ordering::AcqRel);
        Snapshot {
            entries: self.entries.clone(),
            taken_at_ms: now_ms(),
            refs: Arc::clone(&self.snapshot_refs),
        }
    }

    /// One expiry sampler tick: sample up to `sample_size` TTL-bearing
    /// keys, delete the expired ones, and repeat while the expired fraction
    /// stays at or above `repeat_threshold`, bounded by `budget` wall time.
    pub fn sweep_expired(
        &mut self,
        sample_size: usize,
        repeat_threshold: f64,
        budget: Duration,
    ) -> SweepStats {
        let started = Instant::now();
        let mut stats = SweepStats::default();
        loop {
            let now = now_ms();
            let batch: Vec<Bytes> = self.expiries.keys().take(sample_size).cloned().collect();
            if batch.is_empty() {
                break;
            }
            let mut expired_here = 0usize;
            for key in &batch {
                let deadline = self.expiries.get(key).copied();
                match deadline {
                    Some(at) if at <= now => {
                        self.entries.remove(key);
                        self.expiries.remove(key);
                        expired_here += 1;
                    }
                    Some(_) => {
                        // Repair drift: the index must mirror the main map.
                        if !self.entries.contains_key(key) {
                            self.expiries.remove(key);
                        }
                    }
                    None => {}
                }
            }
            stats.sampled += batch.len();
            stats.expired += expired_here;
            let ratio = expired_here as f64 / batch.len() as f64;
            if ratio < repeat_threshold || started.elapsed() >= budget {
                break;
            }
        }
        if stats.expired > 0 {
            debug!(expired = stats.expired, sampled = stats.sampled, "expiry sweep");
        }
        stats
    }
}
