//! Execution of set commands and the union/intersect/diff algebra.

use std::sync::Arc;

use bytes::Bytes;
use carmine_data::{Set, Value, ValueKind};
use carmine_errors::CarmineResult;
use rand::Rng;
use resp_srv::RespValue;

use super::{Command, ExecOutcome, SetAlgebraOp, WriteEffect};
use crate::keyspace::Keyspace;

fn set_default() -> Value {
    Value::Set(Arc::new(Set::default()))
}

/// Evaluate the algebra over the source sets. Missing keys read as empty.
fn evaluate(ks: &mut Keyspace, op: SetAlgebraOp, keys: &[Bytes]) -> CarmineResult<Set> {
    let mut sources: Vec<Set> = Vec::with_capacity(keys.len());
    for key in keys {
        let set = match ks.read(key, ValueKind::Set)? {
            Some(v) => v.as_set()?.clone(),
            None => Set::default(),
        };
        sources.push(set);
    }
    Ok(match op {
        SetAlgebraOp::Union => {
            let mut out = Set::default();
            for set in sources {
                out.extend(set);
            }
            out
        }
        SetAlgebraOp::Inter => {
            // Iterate the smallest set and probe the rest.
            let Some(smallest_idx) = (0..sources.len()).min_by_key(|&i| sources[i].len()) else {
                return Ok(Set::default());
            };
            let smallest = sources[smallest_idx].clone();
            smallest
                .into_iter()
                .filter(|member| {
                    sources
                        .iter()
                        .enumerate()
                        .all(|(i, set)| i == smallest_idx || set.contains(member))
                })
                .collect()
        }
        SetAlgebraOp::Diff => {
            let Some((first, rest)) = sources.split_first() else {
                return Ok(Set::default());
            };
            first
                .iter()
                .filter(|member| !rest.iter().any(|set| set.contains(*member)))
                .cloned()
                .collect()
        }
    })
}

fn members_reply(set: Set) -> RespValue {
    RespValue::Array(set.into_iter().map(RespValue::Bulk).collect())
}

pub(super) fn execute(cmd: Command, ks: &mut Keyspace, raw: Vec<Bytes>) -> CarmineResult<ExecOutcome> {
    match cmd {
        Command::SAdd { key, members } => {
            let set = ks.write(&key, ValueKind::Set, set_default)?.as_set_mut()?;
            let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
            Ok(ExecOutcome::wrote(
                RespValue::Integer(added as i64),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::SRem { key, members } => {
            let removed = match ks.write_existing(&key, ValueKind::Set)? {
                Some(v) => {
                    let set = v.as_set_mut()?;
                    members.iter().filter(|m| set.swap_remove(*m)).count()
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
        Command::SIsMember { key, member } => {
            let found = ks
                .read(&key, ValueKind::Set)?
                .map(|v| v.as_set().map(|s| s.contains(&member)))
                .transpose()?
                .unwrap_or(false);
            Ok(ExecOutcome::read(RespValue::Integer(i64::from(found))))
        }
        Command::SMIsMember { key, members } => {
            let set = ks.read(&key, ValueKind::Set)?.map(|v| v.as_set()).transpose()?;
            let out = members
                .iter()
                .map(|m| {
                    RespValue::Integer(i64::from(set.map(|s| s.contains(m)).unwrap_or(false)))
                })
                .collect();
            Ok(ExecOutcome::read(RespValue::Array(out)))
        }
        Command::SMembers { key } => {
            let set = match ks.read(&key, ValueKind::Set)? {
                Some(v) => v.as_set()?.clone(),
                None => Set::default(),
            };
            Ok(ExecOutcome::read(members_reply(set)))
        }
        Command::SCard { key } => {
            let len = ks
                .read(&key, ValueKind::Set)?
                .map(|v| v.as_set().map(|s| s.len()))
                .transpose()?
                .unwrap_or(0);
            Ok(ExecOutcome::read(RespValue::Integer(len as i64)))
        }
        Command::SPop { key, count } => {
            let mut rng = rand::rng();
            let popped: Vec<Bytes> = match ks.write_existing(&key, ValueKind::Set)? {
                Some(v) => {
                    let set = v.as_set_mut()?;
                    let take = count.unwrap_or(1).min(set.len() as u64) as usize;
                    (0..take)
                        .filter_map(|_| {
                            if set.is_empty() {
                                None
                            } else {
                                set.swap_remove_index(rng.random_range(0..set.len()))
                            }
                        })
                        .collect()
                }
                None => Vec::new(),
            };
            ks.reap_if_empty(&key);
            let reply = match count {
                None => match popped.first() {
                    Some(member) => RespValue::Bulk(member.clone()),
                    None => RespValue::NullBulk,
                },
                Some(_) => {
                    RespValue::Array(popped.iter().cloned().map(RespValue::Bulk).collect())
                }
            };
            if popped.is_empty() {
                Ok(ExecOutcome::read(reply))
            } else {
                // Random pops replicate as the removal they resolved to.
                let mut command = vec![Bytes::from_static(b"SREM"), key.clone()];
                command.extend(popped);
                Ok(ExecOutcome::wrote(reply, WriteEffect::new(command, vec![key])))
            }
        }
        Command::SRandMember { key, count } => {
            let Some(set) = ks.read(&key, ValueKind::Set)?.map(|v| v.as_set()).transpose()?
            else {
                return Ok(ExecOutcome::read(match count {
                    None => RespValue::NullBulk,
                    Some(_) => RespValue::Array(Vec::new()),
                }));
            };
            let mut rng = rand::rng();
            let len = set.len();
            let member_at = |i: usize| set.get_index(i).cloned();
            let reply = match count {
                None => match member_at(rng.random_range(0..len)) {
                    Some(m) => RespValue::Bulk(m),
                    None => RespValue::NullBulk,
                },
                Some(n) if n >= 0 => {
                    let take = (n as usize).min(len);
                    let mut indices: Vec<usize> = (0..len).collect();
                    for i in 0..take {
                        let j = rng.random_range(i..len);
                        indices.swap(i, j);
                    }
                    RespValue::Array(
                        indices[..take]
                            .iter()
                            .filter_map(|&i| member_at(i).map(RespValue::Bulk))
                            .collect(),
                    )
                }
                Some(n) => RespValue::Array(
                    (0..n.unsigned_abs())
                        .filter_map(|_| member_at(rng.random_range(0..len)))
                        .map(RespValue::Bulk)
                        .collect(),
                ),
            };
            Ok(ExecOutcome::read(reply))
        }
        Command::SetAlgebra { op, keys } => {
            let result = evaluate(ks, op, &keys)?;
            Ok(ExecOutcome::read(members_reply(result)))
        }
        Command::SetAlgebraStore { op, dest, keys } => {
            let result = evaluate(ks, op, &keys)?;
            let len = result.len();
            if result.is_empty() {
                ks.remove(&dest);
            } else {
                ks.set(dest.clone(), Value::Set(Arc::new(result)));
            }
            Ok(ExecOutcome::wrote(
                RespValue::Integer(len as i64),
                WriteEffect::new(raw, vec![dest]),
            ))
        }
        Command::SMove { source, dest, member } => {
            let moved = match ks.write_existing(&source, ValueKind::Set)? {
                Some(v) => v.as_set_mut()?.swap_remove(&member),
                None => false,
            };
            if !moved {
                return Ok(ExecOutcome::read(RespValue::Integer(0)));
            }
            ks.reap_if_empty(&source);
            ks.write(&dest, ValueKind::Set, set_default)?
                .as_set_mut()?
                .insert(member);
            Ok(ExecOutcome::wrote(
                RespValue::Integer(1),
                WriteEffect::new(raw, vec![source, dest]),
            ))
        }

        other => Err(carmine_errors::internal_err!(
            "command routed to the wrong executor: {other:?}"
        )),
    }
}
