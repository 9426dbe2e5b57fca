//! Execution of list commands, including the internal non-blocking form
//! the blocking manager drives.

use std::sync::Arc;

use bytes::Bytes;
use carmine_data::{List, Value, ValueKind};
use carmine_errors::{CarmineError, CarmineResult};
use resp_srv::RespValue;

use super::{Command, ExecOutcome, ListEnd, WriteEffect};
use crate::keyspace::Keyspace;

fn list_default() -> Value {
    Value::List(Arc::new(List::default()))
}

fn pop_end(list: &mut List, end: ListEnd) -> Option<Bytes> {
    match end {
        ListEnd::Left => list.pop_front(),
        ListEnd::Right => list.pop_back(),
    }
}

fn push_end(list: &mut List, end: ListEnd, value: Bytes) {
    match end {
        ListEnd::Left => list.push_front(value),
        ListEnd::Right => list.push_back(value),
    }
}

/// Pop one element from `source`, optionally pushing it onto `dest`.
/// Shared by LMOVE, RPOPLPUSH, and the blocking wakeup path.
fn move_element(
    ks: &mut Keyspace,
    source: &Bytes,
    from: ListEnd,
    dest: Option<(&Bytes, ListEnd)>,
) -> CarmineResult<Option<Bytes>> {
    let Some(value) = ks
        .write_existing(source, ValueKind::List)?
        .and_then(|v| v.as_list_mut().ok())
        .and_then(|list| pop_end(list, from))
    else {
        return Ok(None);
    };
    ks.reap_if_empty(source);
    if let Some((dest_key, to)) = dest {
        let list = ks.write(dest_key, ValueKind::List, list_default)?.as_list_mut()?;
        push_end(list, to, value.clone());
    }
    Ok(Some(value))
}

pub(super) fn execute(cmd: Command, ks: &mut Keyspace, raw: Vec<Bytes>) -> CarmineResult<ExecOutcome> {
    match cmd {
        Command::Push { key, values, end } => {
            let list = ks.write(&key, ValueKind::List, list_default)?.as_list_mut()?;
            for value in values {
                push_end(list, end, value);
            }
            let len = list.len();
            Ok(ExecOutcome::wrote(
                RespValue::Integer(len as i64),
                WriteEffect::new(raw, vec![key.clone()]).with_pushes(vec![key]),
            ))
        }
        Command::Pop { key, end } => {
            let popped = ks
                .write_existing(&key, ValueKind::List)?
                .and_then(|v| v.as_list_mut().ok())
                .and_then(|list| pop_end(list, end));
            ks.reap_if_empty(&key);
            match popped {
                Some(value) => Ok(ExecOutcome::wrote(
                    RespValue::Bulk(value),
                    WriteEffect::new(raw, vec![key]),
                )),
                None => Ok(ExecOutcome::read(RespValue::NullBulk)),
            }
        }
        Command::LLen { key } => {
            let len = ks
                .read(&key, ValueKind::List)?
                .map(|v| v.as_list().map(|l| l.len()))
                .transpose()?
                .unwrap_or(0);
            Ok(ExecOutcome::read(RespValue::Integer(len as i64)))
        }
        Command::LRange { key, start, stop } => {
            let items = match ks.read(&key, ValueKind::List)? {
                Some(v) => v.as_list()?.range(start, stop),
                None => Vec::new(),
            };
            Ok(ExecOutcome::read(RespValue::Array(
                items.into_iter().map(RespValue::Bulk).collect(),
            )))
        }
        Command::LIndex { key, index } => {
            let item = match ks.read(&key, ValueKind::List)? {
                Some(v) => v.as_list()?.get(index).cloned(),
                None => None,
            };
            Ok(ExecOutcome::read(match item {
                Some(value) => RespValue::Bulk(value),
                None => RespValue::NullBulk,
            }))
        }
        Command::LSet { key, index, value } => {
            let Some(list) = ks
                .write_existing(&key, ValueKind::List)?
                .map(|v| v.as_list_mut())
                .transpose()?
            else {
                return Err(CarmineError::NoSuchKey);
            };
            if !list.set(index, value) {
                return Err(CarmineError::IndexOutOfRange);
            }
            Ok(ExecOutcome::wrote(
                RespValue::ok(),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::LRem { key, count, value } => {
            let removed = ks
                .write_existing(&key, ValueKind::List)?
                .and_then(|v| v.as_list_mut().ok())
                .map(|list| list.remove(count, &value))
                .unwrap_or(0);
            ks.reap_if_empty(&key);
            let reply = RespValue::Integer(removed as i64);
            if removed > 0 {
                Ok(ExecOutcome::wrote(reply, WriteEffect::new(raw, vec![key])))
            } else {
                Ok(ExecOutcome::read(reply))
            }
        }
        Command::LTrim { key, start, stop } => {
            let existed = match ks.write_existing(&key, ValueKind::List)? {
                Some(v) => {
                    v.as_list_mut()?.trim(start, stop);
                    true
                }
                None => false,
            };
            ks.reap_if_empty(&key);
            if existed {
                Ok(ExecOutcome::wrote(
                    RespValue::ok(),
                    WriteEffect::new(raw, vec![key]),
                ))
            } else {
                Ok(ExecOutcome::read(RespValue::ok()))
            }
        }
        Command::LInsert { key, whence, pivot, value } => {
            let Some(list) = ks
                .write_existing(&key, ValueKind::List)?
                .map(|v| v.as_list_mut())
                .transpose()?
            else {
                return Ok(ExecOutcome::read(RespValue::Integer(0)));
            };
            match list.insert(whence, &pivot, value) {
                Some(len) => Ok(ExecOutcome::wrote(
                    RespValue::Integer(len as i64),
                    WriteEffect::new(raw, vec![key]),
                )),
                None => Ok(ExecOutcome::read(RespValue::Integer(-1))),
            }
        }
        Command::LMove { source, dest, from, to } => {
            match move_element(ks, &source, from, Some((&dest, to)))? {
                Some(value) => Ok(ExecOutcome::wrote(
                    RespValue::Bulk(value),
                    WriteEffect::new(raw, vec![source, dest.clone()]).with_pushes(vec![dest]),
                )),
                None => Ok(ExecOutcome::read(RespValue::NullBulk)),
            }
        }
        Command::TryListPop { keys, from, dest } => {
            for key in &keys {
                let dest_ref = dest.as_ref().map(|(k, end)| (k, *end));
                if let Some(value) = move_element(ks, key, from, dest_ref)? {
                    // Log the effective non-blocking form on the key that
                    // actually served.
                    let (command, touched, pushed) = match &dest {
                        Some((dest_key, to)) => {
                            let command = if from == ListEnd::Right && *to == ListEnd::Left {
                                vec![Bytes::from_static(b"RPOPLPUSH"), key.clone(), dest_key.clone()]
                            } else {
                                vec![
                                    Bytes::from_static(b"LMOVE"),
                                    key.clone(),
                                    dest_key.clone(),
                                    end_token(from),
                                    end_token(*to),
                                ]
                            };
                            (
                                command,
                                vec![key.clone(), dest_key.clone()],
                                vec![dest_key.clone()],
                            )
                        }
                        None => (
                            vec![Bytes::from_static(from.pop_name().as_bytes()), key.clone()],
                            vec![key.clone()],
                            Vec::new(),
                        ),
                    };
                    return Ok(ExecOutcome::wrote(
                        RespValue::Array(vec![
                            RespValue::Bulk(key.clone()),
                            RespValue::Bulk(value),
                        ]),
                        WriteEffect::new(command, touched).with_pushes(pushed),
                    ));
                }
            }
            Ok(ExecOutcome::read(RespValue::NullArray))
        }

        other => Err(carmine_errors::internal_err!(
            "command routed to the wrong executor: {other:?}"
        )),
    }
}

fn end_token(end: ListEnd) -> Bytes {
    match end {
        ListEnd::Left => Bytes::from_static(b"LEFT"),
        ListEnd::Right => Bytes::from_static(b"RIGHT"),
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

    fn bulks(items: &[&str]) -> RespValue {
        RespValue::Array(items.iter().map(|s| RespValue::bulk(b(s))).collect())
    }

    #[test]
    fn push_order() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "LPUSH", &["k", "a", "b", "c"]), RespValue::Integer(3));
        assert_eq!(reply(&mut ks, "LRANGE", &["k", "0", "-1"]), bulks(&["c", "b", "a"]));
    }

    #[test]
    fn rpush_order_and_pops() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "RPUSH", &["k", "a", "b", "c"]);
        assert_eq!(reply(&mut ks, "LRANGE", &["k", "0", "-1"]), bulks(&["a", "b", "c"]));
        assert_eq!(reply(&mut ks, "LPOP", &["k"]), RespValue::bulk("a"));
        assert_eq!(reply(&mut ks, "RPOP", &["k"]), RespValue::bulk("c"));
        assert_eq!(reply(&mut ks, "LLEN", &["k"]), RespValue::Integer(1));
    }

    #[test]
    fn pop_on_missing_returns_null_without_materializing() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "LPOP", &["nope"]), RespValue::NullBulk);
        assert!(ks.get(b"nope").is_none());
    }

    #[test]
    fn emptied_list_is_reaped() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "RPUSH", &["k", "only"]);
        assert_eq!(reply(&mut ks, "LPOP", &["k"]), RespValue::bulk("only"));
        assert!(ks.get(b"k").is_none());
    }

    #[test]
    fn lset_errors() {
        let mut ks = Keyspace::default();
        assert!(matches!(
            run(&mut ks, "LSET", &["nope", "0", "x"]),
            Err(CarmineError::NoSuchKey)
        ));
        reply(&mut ks, "RPUSH", &["k", "a"]);
        assert!(matches!(
            run(&mut ks, "LSET", &["k", "5", "x"]),
            Err(CarmineError::IndexOutOfRange)
        ));
        assert_eq!(reply(&mut ks, "LSET", &["k", "0", "z"]), RespValue::ok());
        assert_eq!(reply(&mut ks, "LINDEX", &["k", "0"]), RespValue::bulk("z"));
    }

    #[test]
    fn linsert_replies() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "LINSERT", &["k", "BEFORE", "p", "x"]), RespValue::Integer(0));
        reply(&mut ks, "RPUSH", &["k", "a", "c"]);
        assert_eq!(reply(&mut ks, "LINSERT", &["k", "BEFORE", "c", "b"]), RespValue::Integer(3));
        assert_eq!(reply(&mut ks, "LINSERT", &["k", "AFTER", "zz", "x"]), RespValue::Integer(-1));
        assert_eq!(reply(&mut ks, "LRANGE", &["k", "0", "-1"]), bulks(&["a", "b", "c"]));
    }

    #[test]
    fn lmove_and_rpoplpush() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "RPUSH", &["src", "a", "b", "c"]);
        let outcome = run(&mut ks, "RPOPLPUSH", &["src", "dst"]).unwrap();
        assert_eq!(outcome.reply, RespValue::bulk("c"));
        let effect = outcome.effect.unwrap();
        assert_eq!(effect.pushed_lists, vec![b("dst")]);
        assert_eq!(reply(&mut ks, "LRANGE", &["dst", "0", "-1"]), bulks(&["c"]));

        assert_eq!(
            reply(&mut ks, "LMOVE", &["src", "dst", "LEFT", "RIGHT"]),
            RespValue::bulk("a")
        );
        assert_eq!(reply(&mut ks, "LRANGE", &["dst", "0", "-1"]), bulks(&["c", "a"]));
        assert_eq!(reply(&mut ks, "LMOVE", &["ghost", "dst", "LEFT", "LEFT"]), RespValue::NullBulk);
    }

    #[test]
    fn try_list_pop_scans_keys_in_order() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "RPUSH", &["q2", "hello"]);
        let cmd = Command::TryListPop {
            keys: vec![b("q1"), b("q2")],
            from: ListEnd::Left,
            dest: None,
        };
        let outcome = cmd.execute(&mut ks, Vec::new()).unwrap();
        assert_eq!(
            outcome.reply,
            RespValue::Array(vec![RespValue::bulk("q2"), RespValue::bulk("hello")])
        );
        let effect = outcome.effect.unwrap();
        assert_eq!(effect.command, vec![b("LPOP"), b("q2")]);

        let cmd = Command::TryListPop { keys: vec![b("q1")], from: ListEnd::Left, dest: None };
        let outcome = cmd.execute(&mut ks, Vec::new()).unwrap();
        assert_eq!(outcome.reply, RespValue::NullArray);
        assert!(outcome.effect.is_none());
    }

    #[test]
    fn try_list_pop_with_destination_rewrites_to_rpoplpush() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "RPUSH", &["src", "v"]);
        let cmd = Command::TryListPop {
            keys: vec![b("src")],
            from: ListEnd::Right,
            dest: Some((b("dst"), ListEnd::Left)),
        };
        let outcome = cmd.execute(&mut ks, Vec::new()).unwrap();
        let effect = outcome.effect.unwrap();
        assert_eq!(effect.command, vec![b("RPOPLPUSH"), b("src"), b("dst")]);
        assert_eq!(effect.pushed_lists, vec![b("dst")]);
        assert_eq!(reply(&mut ks, "LRANGE", &["dst", "0", "-1"]), bulks(&["v"]));
    }

    #[test]
    fn lrem_and_ltrim() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "RPUSH", &["k", "x", "a", "x", "b", "x"]);
        assert_eq!(reply(&mut ks, "LREM", &["k", "2", "x"]), RespValue::Integer(2));
        assert_eq!(reply(&mut ks, "LRANGE", &["k", "0", "-1"]), bulks(&["a", "b", "x"]));
        assert_eq!(reply(&mut ks, "LTRIM", &["k", "0", "1"]), RespValue::ok());
        assert_eq!(reply(&mut ks, "LRANGE", &["k", "0", "-1"]), bulks(&["a", "b"]));
        assert_eq!(reply(&mut ks, "LREM", &["k", "0", "zz"]), RespValue::Integer(0));
    }
}
