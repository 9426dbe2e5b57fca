//! The persistence shim: the contracts between the server core and the
//! external AOF / RDB file writers, plus the snapshot → bytes conversions
//! that run off the processor.
//!
//! The core never opens a file. It appends normalized commands to an
//! [`AofSink`] after each successful write, and on `BGSAVE` /
//! `BGREWRITEAOF` hands a fully converted snapshot to a [`SnapshotSink`].
//! Filtering and conversion happen in a background task, so the processor
//! is paused only for the shallow map copy the snapshot itself takes.

use std::io;

use bytes::Bytes;
use carmine_data::Value;
use carmine_rdb::{RdbEntry, RdbValue};
use tracing::debug;

use crate::keyspace::{now_ms, Snapshot};

/// Receives one normalized write command after each successful write.
pub trait AofSink: Send + Sync + 'static {
    fn append(&self, command: &[Bytes]);
}

/// Discards appends; the default when AOF is off.
#[derive(Debug, Default)]
pub struct NoopAof;

impl AofSink for NoopAof {
    fn append(&self, _command: &[Bytes]) {}
}

/// Receives converted snapshots from background persistence tasks.
pub trait SnapshotSink: Send + Sync + 'static {
    /// `BGSAVE`: the serialized RDB image.
    fn write_rdb(&self, bytes: Bytes) -> io::Result<()>;

    /// `BGREWRITEAOF`: the command stream that rebuilds the keyspace.
    fn write_aof_rewrite(&self, commands: &[Vec<Bytes>]) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopSnapshotSink;

impl SnapshotSink for NoopSnapshotSink {
    fn write_rdb(&self, _bytes: Bytes) -> io::Result<()> {
        Ok(())
    }

    fn write_aof_rewrite(&self, _commands: &[Vec<Bytes>]) -> io::Result<()> {
        Ok(())
    }
}

/// The RDB payload of a value, or `None` for kinds the RDB format does not
/// carry (Bloom filters and HyperLogLogs survive only through the AOF).
fn rdb_value_of(value: &Value) -> Option<RdbValue> {
    match value {
        Value::String(s) => Some(RdbValue::String(s.to_bytes())),
        Value::List(l) => Some(RdbValue::List(l.iter().cloned().collect())),
        Value::Set(s) => Some(RdbValue::Set(s.iter().cloned().collect())),
        Value::SortedSet(z) => Some(RdbValue::ZSet(
            z.iter().map(|(m, s)| (m.clone(), s)).collect(),
        )),
        Value::Hash(h) => Some(RdbValue::Hash(
            h.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
        )),
        Value::Bloom(_) | Value::HyperLogLog(_) => None,
    }
}

/// Serialize a snapshot to the RDB wire format, filtering expired keys.
pub fn snapshot_to_rdb(snapshot: &Snapshot) -> Bytes {
    let mut entries = Vec::with_capacity(snapshot.len());
    let mut skipped = 0usize;
    for (key, entry) in snapshot.live_entries() {
        match rdb_value_of(&entry.value) {
            Some(value) => entries.push(RdbEntry {
                key: key.clone(),
                value,
                expires_at_ms: entry.expires_at_ms,
            }),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "keys without an RDB representation were omitted");
    }
    carmine_rdb::encode(&entries)
}

/// Convert a snapshot to the write commands that rebuild it, for AOF
/// rewrite. Expired keys are filtered; TTLs become relative `EXPIRE`s.
pub fn snapshot_to_commands(snapshot: &Snapshot) -> Vec<Vec<Bytes>> {
    let mut out = Vec::new();
    for (key, entry) in snapshot.live_entries() {
        out.extend(value_to_commands(key, &entry.value));
        if let Some(at) = entry.expires_at_ms {
            push_expire(&mut out, key, at);
        }
    }
    out
}

/// Replay commands for one RDB entry, used by the replica's full-resync
/// ingest. Entries already past their deadline produce nothing.
pub fn rdb_entry_to_commands(entry: &RdbEntry) -> Vec<Vec<Bytes>> {
    if matches!(entry.expires_at_ms, Some(at) if at <= now_ms()) {
        return Vec::new();
    }
    let mut out = match &entry.value {
        RdbValue::String(bytes) => vec![vec![
            Bytes::from_static(b"SET"),
            entry.key.clone(),
            bytes.clone(),
        ]],
        RdbValue::List(items) => {
            let mut cmd = vec![Bytes::from_static(b"RPUSH"), entry.key.clone()];
            cmd.extend(items.iter().cloned());
            vec![cmd]
        }
        RdbValue::Set(members) => {
            let mut cmd = vec![Bytes::from_static(b"SADD"), entry.key.clone()];
            cmd.extend(members.iter().cloned());
            vec![cmd]
        }
        RdbValue::ZSet(pairs) => {
            let mut cmd = vec![Bytes::from_static(b"ZADD"), entry.key.clone()];
            for (member, score) in pairs {
                cmd.push(Bytes::from(carmine_data::fmt_f64(*score)));
                cmd.push(member.clone());
            }
            vec![cmd]
        }
        RdbValue::Hash(fields) => {
            let mut cmd = vec![Bytes::from_static(b"HSET"), entry.key.clone()];
            for (field, value) in fields {
                cmd.push(field.clone());
                cmd.push(value.clone());
            }
            vec![cmd]
        }
    };
    if let Some(at) = entry.expires_at_ms {
        push_expire(&mut out, &entry.key, at);
    }
    out
}

fn value_to_commands(key: &Bytes, value: &Value) -> Vec<Vec<Bytes>> {
    match value {
        Value::String(s) => vec![vec![
            Bytes::from_static(b"SET"),
            key.clone(),
            s.to_bytes(),
        ]],
        Value::List(list) => {
            let mut cmd = vec![Bytes::from_static(b"RPUSH"), key.clone()];
            cmd.extend(list.iter().cloned());
            vec![cmd]
        }
        Value::Set(set) => {
            let mut cmd = vec![Bytes::from_static(b"SADD"), key.clone()];
            cmd.extend(set.iter().cloned());
            vec![cmd]
        }
        Value::SortedSet(zset) => {
            let mut cmd = vec![Bytes::from_static(b"ZADD"), key.clone()];
            for (member, score) in zset.iter() {
                cmd.push(Bytes::from(carmine_data::fmt_f64(score)));
                cmd.push(member.clone());
            }
            vec![cmd]
        }
        Value::Hash(hash) => {
            let mut cmd = vec![Bytes::from_static(b"HSET"), key.clone()];
            for (field, value) in hash.iter() {
                cmd.push(field.clone());
                cmd.push(value.clone());
            }
            vec![cmd]
        }
        Value::Bloom(bloom) => {
            // No enumerable items; re-reserving at least restores the
            // filter's shape for future adds.
            vec![vec![
                Bytes::from_static(b"BF.RESERVE"),
                key.clone(),
                Bytes::from(bloom.error_rate().to_string()),
                Bytes::from(bloom.capacity().to_string()),
            ]]
        }
        Value::HyperLogLog(_) => Vec::new(),
    }
}

fn push_expire(out: &mut Vec<Vec<Bytes>>, key: &Bytes, at_ms: u64) {
    let remaining_s = at_ms.saturating_sub(now_ms()).div_ceil(1000);
    if remaining_s > 0 {
        out.push(vec![
            Bytes::from_static(b"EXPIRE"),
            key.clone(),
            Bytes::from(remaining_s.to_string()),
        ]);
    }
}
