//! Execution of string, generic-key, and bitmap commands.

use std::sync::Arc;

use bytes::Bytes;
use carmine_data::string::bitop;
use carmine_data::{StringValue, Value, ValueKind};
use carmine_errors::{CarmineError, CarmineResult};
use resp_srv::RespValue;

use super::{Command, ExecOutcome, WriteEffect};
use crate::keyspace::{now_ms, Keyspace};

fn bulk_or_null(value: Option<Bytes>) -> RespValue {
    match value {
        Some(bytes) => RespValue::Bulk(bytes),
        None => RespValue::NullBulk,
    }
}

fn read_string(ks: &mut Keyspace, key: &[u8]) -> CarmineResult<Option<Bytes>> {
    Ok(ks
        .read(key, ValueKind::String)?
        .map(|v| v.as_string().map(|s| s.to_bytes()))
        .transpose()?)
}

fn string_mut<'a>(ks: &'a mut Keyspace, key: &Bytes) -> CarmineResult<&'a mut StringValue> {
    ks.write(key, ValueKind::String, || {
        Value::String(Arc::new(StringValue::default()))
    })?
    .as_string_mut()
}

pub(super) fn execute(cmd: Command, ks: &mut Keyspace, raw: Vec<Bytes>) -> CarmineResult<ExecOutcome> {
    match cmd {
        Command::Set { key, value, expire_ms, nx, xx } => {
            let exists = ks.get(&key).is_some();
            if (nx && exists) || (xx && !exists) {
                return Ok(ExecOutcome::read(RespValue::NullBulk));
            }
            match expire_ms {
                Some(ms) => ks.set_with_expiry(key.clone(), Value::string(value), now_ms() + ms),
                None => ks.set(key.clone(), Value::string(value)),
            }
            Ok(ExecOutcome::wrote(
                RespValue::ok(),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::SetEx { key, seconds, value } => {
            ks.set_with_expiry(
                key.clone(),
                Value::string(value),
                now_ms() + seconds as u64 * 1000,
            );
            Ok(ExecOutcome::wrote(
                RespValue::ok(),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::SetNx { key, value } => {
            if ks.get(&key).is_some() {
                return Ok(ExecOutcome::read(RespValue::Integer(0)));
            }
            ks.set(key.clone(), Value::string(value));
            Ok(ExecOutcome::wrote(
                RespValue::Integer(1),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::Get { key } => Ok(ExecOutcome::read(bulk_or_null(read_string(ks, &key)?))),
        Command::GetSet { key, value } => {
            let old = read_string(ks, &key)?;
            ks.set(key.clone(), Value::string(value));
            Ok(ExecOutcome::wrote(
                bulk_or_null(old),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::Del { keys } => {
            let mut removed = Vec::new();
            for key in &keys {
                if ks.remove(key).is_some() {
                    removed.push(key.clone());
                }
            }
            let reply = RespValue::Integer(removed.len() as i64);
            if removed.is_empty() {
                Ok(ExecOutcome::read(reply))
            } else {
                Ok(ExecOutcome::wrote(reply, WriteEffect::new(raw, removed)))
            }
        }
        Command::Exists { keys } => {
            let count = keys.iter().filter(|k| ks.get(k).is_some()).count();
            Ok(ExecOutcome::read(RespValue::Integer(count as i64)))
        }
        Command::Keys { pattern } => {
            let keys = ks.keys_matching(&pattern);
            Ok(ExecOutcome::read(RespValue::Array(
                keys.into_iter().map(RespValue::Bulk).collect(),
            )))
        }
        Command::Expire { key, seconds } => {
            if ks.get(&key).is_none() {
                return Ok(ExecOutcome::read(RespValue::Integer(0)));
            }
            if seconds <= 0 {
                ks.remove(&key);
            } else {
                ks.expire_at(&key, now_ms() + seconds as u64 * 1000);
            }
            Ok(ExecOutcome::wrote(
                RespValue::Integer(1),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::Ttl { key } => {
            let reply = match ks.ttl_ms(&key) {
                None => -2,
                Some(None) => -1,
                Some(Some(ms)) => ms.div_ceil(1000) as i64,
            };
            Ok(ExecOutcome::read(RespValue::Integer(reply)))
        }
        Command::Pttl { key } => {
            let reply = match ks.ttl_ms(&key) {
                None => -2,
                Some(None) => -1,
                Some(Some(ms)) => ms as i64,
            };
            Ok(ExecOutcome::read(RespValue::Integer(reply)))
        }
        Command::Persist { key } => {
            if ks.persist(&key) {
                Ok(ExecOutcome::wrote(
                    RespValue::Integer(1),
                    WriteEffect::new(raw, vec![key]),
                ))
            } else {
                Ok(ExecOutcome::read(RespValue::Integer(0)))
            }
        }
        Command::Rename { from, to } => {
            let Some(entry) = ks.remove(&from) else {
                return Err(CarmineError::NoSuchKey);
            };
            match entry.expires_at_ms {
                Some(at) => ks.set_with_expiry(to.clone(), entry.value, at),
                None => ks.set(to.clone(), entry.value),
            }
            Ok(ExecOutcome::wrote(
                RespValue::ok(),
                WriteEffect::new(raw, vec![from, to]),
            ))
        }
        Command::TypeOf { key } => {
            let name = match ks.get(&key) {
                Some(entry) => entry.value.kind().type_name(),
                None => "none",
            };
            Ok(ExecOutcome::read(RespValue::Simple(name.into())))
        }
        Command::IncrBy { key, delta } => {
            let next = string_mut(ks, &key)?.incr_by(delta)?;
            Ok(ExecOutcome::wrote(
                RespValue::Integer(next),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::IncrByFloat { key, delta } => {
            let next = string_mut(ks, &key)?.incr_by_float(delta)?;
            Ok(ExecOutcome::wrote(
                RespValue::bulk_from_display(carmine_data::fmt_f64(next)),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::Append { key, value } => {
            let len = string_mut(ks, &key)?.append(&value);
            Ok(ExecOutcome::wrote(
                RespValue::Integer(len as i64),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::Strlen { key } => {
            let len = ks
                .read(&key, ValueKind::String)?
                .map(|v| v.as_string().map(|s| s.len()))
                .transpose()?
                .unwrap_or(0);
            Ok(ExecOutcome::read(RespValue::Integer(len as i64)))
        }
        Command::GetRange { key, start, end } => {
            let out = match ks.read(&key, ValueKind::String)? {
                Some(v) => v.as_string()?.getrange(start, end),
                None => Bytes::new(),
            };
            Ok(ExecOutcome::read(RespValue::Bulk(out)))
        }
        Command::SetRange { key, offset, value } => {
            if value.is_empty() {
                let len = ks
                    .read(&key, ValueKind::String)?
                    .map(|v| v.as_string().map(|s| s.len()))
                    .transpose()?
                    .unwrap_or(0);
                return Ok(ExecOutcome::read(RespValue::Integer(len as i64)));
            }
            let len = string_mut(ks, &key)?.setrange(offset as usize, &value);
            Ok(ExecOutcome::wrote(
                RespValue::Integer(len as i64),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::MGet { keys } => {
            let mut out = Vec::with_capacity(keys.len());
            for key in &keys {
                // Wrong-typed keys read as null here, not as an error.
                let value = match ks.get(key) {
                    Some(entry) => match entry.value.as_string() {
                        Ok(s) => RespValue::Bulk(s.to_bytes()),
                        Err(_) => RespValue::NullBulk,
                    },
                    None => RespValue::NullBulk,
                };
                out.push(value);
            }
            Ok(ExecOutcome::read(RespValue::Array(out)))
        }
        Command::MSet { pairs } => {
            let touched: Vec<Bytes> = pairs.iter().map(|(k, _)| k.clone()).collect();
            for (key, value) in pairs {
                ks.set(key, Value::string(value));
            }
            Ok(ExecOutcome::wrote(RespValue::ok(), WriteEffect::new(raw, touched)))
        }
        Command::FlushAll => {
            let touched = ks.keys_matching(b"*");
            ks.flush();
            Ok(ExecOutcome::wrote(RespValue::ok(), WriteEffect::new(raw, touched)))
        }
        Command::DbSize => Ok(ExecOutcome::read(RespValue::Integer(ks.len() as i64))),

        Command::SetBit { key, offset, value } => {
            let old = string_mut(ks, &key)?.setbit(offset, value);
            Ok(ExecOutcome::wrote(
                RespValue::Integer(i64::from(old)),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::GetBit { key, offset } => {
            let bit = ks
                .read(&key, ValueKind::String)?
                .map(|v| v.as_string().map(|s| s.getbit(offset)))
                .transpose()?
                .unwrap_or(false);
            Ok(ExecOutcome::read(RespValue::Integer(i64::from(bit))))
        }
        Command::BitCount { key, range } => {
            let count = ks
                .read(&key, ValueKind::String)?
                .map(|v| v.as_string().map(|s| s.bitcount(range)))
                .transpose()?
                .unwrap_or(0);
            Ok(ExecOutcome::read(RespValue::Integer(count as i64)))
        }
        Command::BitPos { key, bit, start, end } => {
            let pos = match ks.read(&key, ValueKind::String)? {
                Some(v) => v.as_string()?.bitpos(bit, start, end),
                // A missing key is an all-zeroes string: the first clear
                // bit is position 0, a set bit is never found.
                None => {
                    if bit {
                        -1
                    } else {
                        0
                    }
                }
            };
            Ok(ExecOutcome::read(RespValue::Integer(pos)))
        }
        Command::BitOpCmd { op, dest, sources } => {
            let mut inputs = Vec::with_capacity(sources.len());
            for key in &sources {
                inputs.push(read_string(ks, key)?.unwrap_or_default());
            }
            let slices: Vec<&[u8]> = inputs.iter().map(|b| b.as_ref()).collect();
            let result = bitop(op, &slices)?;
            let len = result.len();
            if result.is_empty() {
                ks.remove(&dest);
            } else {
                ks.set(dest.clone(), Value::string(result));
            }
            Ok(ExecOutcome::wrote(
                RespValue::Integer(len as i64),
                WriteEffect::new(raw, vec![dest]),
            ))
        }

        other => Err(carmine_errors::internal_err!(
            "command routed to the wrong executor: {other:?}"
        )),
    }
}
