//! Execution of hash commands.

use std::sync::Arc;

use bytes::Bytes;
use carmine_data::{fmt_f64, Hash, Value, ValueKind};
use carmine_errors::{CarmineError, CarmineResult};
use rand::Rng;
use resp_srv::RespValue;

use super::{Command, ExecOutcome, WriteEffect};
use crate::keyspace::Keyspace;

fn hash_default() -> Value {
    Value::Hash(Arc::new(Hash::default()))
}

fn parse_field_i64(value: &[u8]) -> CarmineResult<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CarmineError::NotAnInteger)
}

fn parse_field_f64(value: &[u8]) -> CarmineResult<f64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or(CarmineError::NotAFloat)
}

pub(super) fn execute(cmd: Command, ks: &mut Keyspace, raw: Vec<Bytes>) -> CarmineResult<ExecOutcome> {
    match cmd {
        Command::HSet { key, pairs } => {
            let hash = ks.write(&key, ValueKind::Hash, hash_default)?.as_hash_mut()?;
            let mut added = 0;
            for (field, value) in pairs {
                if hash.insert(field, value).is_none() {
                    added += 1;
                }
            }
            Ok(ExecOutcome::wrote(
                RespValue::Integer(added),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::HSetNx { key, field, value } => {
            let hash = ks.write(&key, ValueKind::Hash, hash_default)?.as_hash_mut()?;
            if hash.contains_key(&field) {
                // The key may have just been created empty; reap it.
                ks.reap_if_empty(&key);
                return Ok(ExecOutcome::read(RespValue::Integer(0)));
            }
            hash.insert(field, value);
            Ok(ExecOutcome::wrote(
                RespValue::Integer(1),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::HGet { key, field } => {
            let value = match ks.read(&key, ValueKind::Hash)? {
                Some(v) => v.as_hash()?.get(&field).cloned(),
                None => None,
            };
            Ok(ExecOutcome::read(match value {
                Some(v) => RespValue::Bulk(v),
                None => RespValue::NullBulk,
            }))
        }
        Command::HMGet { key, fields } => {
            let hash = ks.read(&key, ValueKind::Hash)?.map(|v| v.as_hash()).transpose()?;
            let out = fields
                .iter()
                .map(|field| match hash.and_then(|h| h.get(field)) {
                    Some(v) => RespValue::Bulk(v.clone()),
                    None => RespValue::NullBulk,
                })
                .collect();
            Ok(ExecOutcome::read(RespValue::Array(out)))
        }
        Command::HDel { key, fields } => {
            let removed = match ks.write_existing(&key, ValueKind::Hash)? {
                Some(v) => {
                    let hash = v.as_hash_mut()?;
                    fields.iter().filter(|f| hash.swap_remove(*f).is_some()).count()
                }
                None => 0,
            };
            ks.reap_if_empty(&key);
            let reply = RespValue::Integer(removed as i64);
            if removed > 0 {
                Ok(ExecOutcome::wrote(reply, WriteEffect::new(raw, vec![key])))
            } else {
                Ok(ExecOutcome::read(reply))
            }
        }
        Command::HExists { key, field } => {
            let exists = ks
                .read(&key, ValueKind::Hash)?
                .map(|v| v.as_hash().map(|h| h.contains_key(&field)))
                .transpose()?
                .unwrap_or(false);
            Ok(ExecOutcome::read(RespValue::Integer(i64::from(exists))))
        }
        Command::HLen { key } => {
            let len = ks
                .read(&key, ValueKind::Hash)?
                .map(|v| v.as_hash().map(|h| h.len()))
                .transpose()?
                .unwrap_or(0);
            Ok(ExecOutcome::read(RespValue::Integer(len as i64)))
        }
        Command::HKeys { key } => {
            let out = match ks.read(&key, ValueKind::Hash)? {
                Some(v) => v.as_hash()?.keys().cloned().map(RespValue::Bulk).collect(),
                None => Vec::new(),
            };
            Ok(ExecOutcome::read(RespValue::Array(out)))
        }
        Command::HVals { key } => {
            let out = match ks.read(&key, ValueKind::Hash)? {
                Some(v) => v.as_hash()?.values().cloned().map(RespValue::Bulk).collect(),
                None => Vec::new(),
            };
            Ok(ExecOutcome::read(RespValue::Array(out)))
        }
        Command::HGetAll { key } => {
            let out = match ks.read(&key, ValueKind::Hash)? {
                Some(v) => v
                    .as_hash()?
                    .iter()
                    .flat_map(|(f, v)| [RespValue::Bulk(f.clone()), RespValue::Bulk(v.clone())])
                    .collect(),
                None => Vec::new(),
            };
            Ok(ExecOutcome::read(RespValue::Array(out)))
        }
        Command::HIncrBy { key, field, delta } => {
            let hash = ks.write(&key, ValueKind::Hash, hash_default)?.as_hash_mut()?;
            let current = match hash.get(&field) {
                Some(v) => parse_field_i64(v)?,
                None => 0,
            };
            let next = current.checked_add(delta).ok_or(CarmineError::IntegerOverflow)?;
            hash.insert(field, Bytes::from(next.to_string()));
            Ok(ExecOutcome::wrote(
                RespValue::Integer(next),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::HIncrByFloat { key, field, delta } => {
            let hash = ks.write(&key, ValueKind::Hash, hash_default)?.as_hash_mut()?;
            let current = match hash.get(&field) {
                Some(v) => parse_field_f64(v)?,
                None => 0.0,
            };
            let next = current + delta;
            if !next.is_finite() {
                return Err(CarmineError::NotAFloat);
            }
            let rendered = fmt_f64(next);
            hash.insert(field, Bytes::from(rendered.clone()));
            Ok(ExecOutcome::wrote(
                RespValue::bulk(rendered),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::HRandField { key, count } => {
            let Some(hash) = ks.read(&key, ValueKind::Hash)?.map(|v| v.as_hash()).transpose()?
            else {
                return Ok(ExecOutcome::read(match count {
                    None => RespValue::NullBulk,
                    Some(_) => RespValue::Array(Vec::new()),
                }));
            };
            let mut rng = rand::rng();
            let len = hash.len();
            let field_at = |i: usize| hash.get_index(i).map(|(f, _)| f.clone());
            let reply = match count {
                None => match field_at(rng.random_range(0..len)) {
                    Some(field) => RespValue::Bulk(field),
                    None => RespValue::NullBulk,
                },
                Some(n) if n >= 0 => {
                    // Distinct fields, at most the hash size.
                    let take = (n as usize).min(len);
                    let mut indices: Vec<usize> = (0..len).collect();
                    for i in 0..take {
                        let j = rng.random_range(i..len);
                        indices.swap(i, j);
                    }
                    RespValue::Array(
                        indices[..take]
                            .iter()
                            .filter_map(|&i| field_at(i).map(RespValue::Bulk))
                            .collect(),
                    )
                }
                Some(n) => {
                    // Negative count: repeats allowed.
                    RespValue::Array(
                        (0..n.unsigned_abs())
                            .filter_map(|_| field_at(rng.random_range(0..len)))
                            .map(RespValue::Bulk)
                            .collect(),
                    )
                }
            };
            Ok(ExecOutcome::read(reply))
        }

        other => Err(carmine_errors::internal_err!(
            "command routed to the wrong executor: {other:?}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn run(ks: &mut Keyspace, name: &str, args: &[&str]) -> CarmineResult<ExecOutcome> {
        let args: Vec<Bytes> = args.iter().map(|a| b(a)).collect();
        let cmd = Command::parse(name, &args)?;
        let mut raw = vec![b(name)];
        raw.extend(args);
        cmd.execute(ks, raw)
    }

    fn reply(ks: &mut Keyspace, name: &str, args: &[&str]) -> RespValue {
        run(ks, name, args).unwrap().reply
    }

    #[test]
    fn hset_hget() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "HSET", &["h", "a", "1", "b", "2"]), RespValue::Integer(2));
        assert_eq!(reply(&mut ks, "HSET", &["h", "a", "9", "c", "3"]), RespValue::Integer(1));
        assert_eq!(reply(&mut ks, "HGET", &["h", "a"]), RespValue::bulk("9"));
        assert_eq!(reply(&mut ks, "HGET", &["h", "zz"]), RespValue::NullBulk);
        assert_eq!(reply(&mut ks, "HLEN", &["h"]), RespValue::Integer(3));
    }

    #[test]
    fn hdel_reaps_empty() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "HSET", &["h", "a", "1"]);
        assert_eq!(reply(&mut ks, "HDEL", &["h", "a", "zz"]), RespValue::Integer(1));
        assert!(ks.get(b"h").is_none());
    }

    #[test]
    fn hsetnx() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "HSETNX", &["h", "f", "1"]), RespValue::Integer(1));
        assert_eq!(reply(&mut ks, "HSETNX", &["h", "f", "2"]), RespValue::Integer(0));
        assert_eq!(reply(&mut ks, "HGET", &["h", "f"]), RespValue::bulk("1"));
    }

    #[test]
    fn hmget_hgetall() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "HSET", &["h", "a", "1", "b", "2"]);
        assert_eq!(
            reply(&mut ks, "HMGET", &["h", "a", "zz", "b"]),
            RespValue::Array(vec![
                RespValue::bulk("1"),
                RespValue::NullBulk,
                RespValue::bulk("2"),
            ])
        );
        assert_eq!(
            reply(&mut ks, "HGETALL", &["h"]),
            RespValue::Array(vec![
                RespValue::bulk("a"),
                RespValue::bulk("1"),
                RespValue::bulk("b"),
                RespValue::bulk("2"),
            ])
        );
        assert_eq!(reply(&mut ks, "HGETALL", &["none"]), RespValue::Array(Vec::new()));
    }

    #[test]
    fn hincrby() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "HINCRBY", &["h", "n", "5"]), RespValue::Integer(5));
        assert_eq!(reply(&mut ks, "HINCRBY", &["h", "n", "-2"]), RespValue::Integer(3));
        reply(&mut ks, "HSET", &["h", "s", "abc"]);
        assert!(matches!(
            run(&mut ks, "HINCRBY", &["h", "s", "1"]),
            Err(CarmineError::NotAnInteger)
        ));
        assert_eq!(reply(&mut ks, "HINCRBYFLOAT", &["h", "f", "1.5"]), RespValue::bulk("1.5"));
        assert_eq!(reply(&mut ks, "HINCRBYFLOAT", &["h", "f", "1.5"]), RespValue::bulk("3"));
    }

    #[test]
    fn hrandfield_counts() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "HRANDFIELD", &["none"]), RespValue::NullBulk);
        reply(&mut ks, "HSET", &["h", "a", "1", "b", "2", "c", "3"]);
        match reply(&mut ks, "HRANDFIELD", &["h", "2"]) {
            RespValue::Array(items) => {
                assert_eq!(items.len(), 2);
                let mut seen: Vec<Bytes> = items
                    .iter()
                    .map(|item| match item {
                        RespValue::Bulk(f) => f.clone(),
                        other => panic!("{other:?}"),
                    })
                    .collect();
                seen.sort();
                seen.dedup();
                assert_eq!(seen.len(), 2, "positive count must be distinct");
            }
            other => panic!("{other:?}"),
        }
        match reply(&mut ks, "HRANDFIELD", &["h", "-10"]) {
            RespValue::Array(items) => assert_eq!(items.len(), 10),
            other => panic!("{other:?}"),
        }
    }
}
