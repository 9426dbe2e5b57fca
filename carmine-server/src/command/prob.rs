//! Execution of the probabilistic commands: HyperLogLog and Bloom filters.

use std::sync::Arc;

use bytes::Bytes;
use carmine_data::{BloomFilter, HyperLogLog, Value, ValueKind};
use carmine_errors::{CarmineError, CarmineResult};
use resp_srv::RespValue;

use super::{Command, ExecOutcome, WriteEffect};
use crate::keyspace::Keyspace;

/// PF commands report a kind mismatch with their own error text rather than
/// the generic WRONGTYPE.
fn read_hll<'a>(ks: &'a mut Keyspace, key: &[u8]) -> CarmineResult<Option<&'a HyperLogLog>> {
    match ks.get(key) {
        None => Ok(None),
        Some(entry) => match &entry.value {
            Value::HyperLogLog(hll) => Ok(Some(hll)),
            _ => Err(CarmineError::NotHyperLogLog),
        },
    }
}

pub(super) fn execute(cmd: Command, ks: &mut Keyspace, raw: Vec<Bytes>) -> CarmineResult<ExecOutcome> {
    match cmd {
        Command::PfAdd { key, elements } => {
            let created = ks.get(&key).is_none();
            let hll = ks
                .write(&key, ValueKind::HyperLogLog, || {
                    Value::HyperLogLog(Arc::new(HyperLogLog::default()))
                })
                .map_err(|_| CarmineError::NotHyperLogLog)?
                .as_hll_mut()?;
            let mut changed = false;
            for element in &elements {
                changed |= hll.add(element);
            }
            if changed || created {
                Ok(ExecOutcome::wrote(
                    RespValue::Integer(1),
                    WriteEffect::new(raw, vec![key]),
                ))
            } else {
                Ok(ExecOutcome::read(RespValue::Integer(0)))
            }
        }
        Command::PfCount { keys } => {
            let count = match keys.as_slice() {
                [single] => read_hll(ks, single)?.map(|h| h.count()).unwrap_or(0),
                many => {
                    // Merge into a scratch HLL sized to the first live
                    // source; missing keys are skipped.
                    let mut scratch: Option<HyperLogLog> = None;
                    for key in many {
                        let Some(hll) = read_hll(ks, key)?.cloned() else {
                            continue;
                        };
                        match &mut scratch {
                            None => scratch = Some(hll),
                            Some(acc) => acc.merge(&hll)?,
                        }
                    }
                    scratch.map(|h| h.count()).unwrap_or(0)
                }
            };
            Ok(ExecOutcome::read(RespValue::Integer(count as i64)))
        }
        Command::PfMerge { dest, sources } => {
            let mut acc = match read_hll(ks, &dest)? {
                Some(hll) => hll.clone(),
                None => {
                    // Inherit the precision of the first live source.
                    let mut seed = None;
                    for key in &sources {
                        if let Some(hll) = read_hll(ks, key)? {
                            seed = Some(HyperLogLog::new(hll.precision()));
                            break;
                        }
                    }
                    seed.unwrap_or_default()
                }
            };
            for key in &sources {
                if let Some(hll) = read_hll(ks, key)?.cloned() {
                    acc.merge(&hll)?;
                }
            }
            ks.set(dest.clone(), Value::HyperLogLog(Arc::new(acc)));
            Ok(ExecOutcome::wrote(
                RespValue::ok(),
                WriteEffect::new(raw, vec![dest]),
            ))
        }

        Command::BfReserve { key, error_rate, capacity } => {
            if ks.get(&key).is_some() {
                return Err(CarmineError::BloomItemExists);
            }
            let filter = BloomFilter::with_params(error_rate, capacity)?;
            ks.set(key.clone(), Value::Bloom(Arc::new(filter)));
            Ok(ExecOutcome::wrote(
                RespValue::ok(),
                WriteEffect::new(raw, vec![key]),
            ))
        }
        Command::BfAdd { key, items } => {
            let multi = items.len() > 1 || raw.first().map(|n| n.as_ref() == b"BF.MADD").unwrap_or(false);
            let filter = ks
                .write(&key, ValueKind::Bloom, || {
                    Value::Bloom(Arc::new(BloomFilter::default()))
                })?
                .as_bloom_mut()?;
            let results: Vec<bool> = items.iter().map(|item| filter.add(item)).collect();
            let reply = if multi {
                RespValue::Array(
                    results.iter().map(|&added| RespValue::Integer(i64::from(added))).collect(),
                )
            } else {
                RespValue::Integer(i64::from(results[0]))
            };
            Ok(ExecOutcome::wrote(reply, WriteEffect::new(raw, vec![key])))
        }
        Command::BfExists { key, items, multi } => {
            let filter = ks.read(&key, ValueKind::Bloom)?.map(|v| v.as_bloom()).transpose()?;
            let probe =
                |item: &Bytes| i64::from(filter.map(|f| f.contains(item)).unwrap_or(false));
            let reply = if multi {
                RespValue::Array(items.iter().map(|i| RespValue::Integer(probe(i))).collect())
            } else {
                RespValue::Integer(probe(&items[0]))
            };
            Ok(ExecOutcome::read(reply))
        }
        Command::BfInfo { key } => {
            let Some(filter) =
                ks.read(&key, ValueKind::Bloom)?.map(|v| v.as_bloom()).transpose()?
            else {
                return Err(CarmineError::NoSuchKey);
            };
            let reply = RespValue::Array(vec![
                RespValue::bulk("Capacity"),
                RespValue::Integer(filter.capacity() as i64),
                RespValue::bulk("Size"),
                RespValue::Integer(filter.size_in_bits() as i64),
                RespValue::bulk("Number of hashes"),
                RespValue::Integer(i64::from(filter.num_hashes())),
                RespValue::bulk("Number of items inserted"),
                RespValue::Integer(filter.items_inserted() as i64),
                RespValue::bulk("Error rate"),
                RespValue::bulk_from_display(filter.error_rate()),
            ]);
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
    fn pfadd_pfcount() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "PFADD", &["h", "x", "y", "z"]), RespValue::Integer(1));
        assert_eq!(reply(&mut ks, "PFADD", &["h", "x"]), RespValue::Integer(0));
        match reply(&mut ks, "PFCOUNT", &["h"]) {
            RespValue::Integer(count) => assert!((3..=4).contains(&count), "count {count}"),
            other => panic!("{other:?}"),
        }
        assert_eq!(reply(&mut ks, "PFCOUNT", &["missing"]), RespValue::Integer(0));
    }

    #[test]
    fn pfcount_multi_merges() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "PFADD", &["a", "1", "2"]);
        reply(&mut ks, "PFADD", &["b", "2", "3"]);
        match reply(&mut ks, "PFCOUNT", &["a", "b", "missing"]) {
            RespValue::Integer(count) => assert!((3..=4).contains(&count), "count {count}"),
            other => panic!("{other:?}"),
        }
        // The sources are untouched by the scratch merge.
        match reply(&mut ks, "PFCOUNT", &["a"]) {
            RespValue::Integer(count) => assert!(count <= 2),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn pfmerge() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "PFADD", &["a", "1", "2"]);
        reply(&mut ks, "PFADD", &["b", "3"]);
        assert_eq!(reply(&mut ks, "PFMERGE", &["dest", "a", "b"]), RespValue::ok());
        match reply(&mut ks, "PFCOUNT", &["dest"]) {
            RespValue::Integer(count) => assert!((3..=4).contains(&count)),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn pf_on_wrong_kind() {
        let mut ks = Keyspace::default();
        ks.set(b("s"), Value::string("text"));
        assert!(matches!(
            run(&mut ks, "PFADD", &["s", "x"]),
            Err(CarmineError::NotHyperLogLog)
        ));
        assert!(matches!(
            run(&mut ks, "PFCOUNT", &["s"]),
            Err(CarmineError::NotHyperLogLog)
        ));
    }

    #[test]
    fn bloom_reserve_add_exists() {
        let mut ks = Keyspace::default();
        assert_eq!(reply(&mut ks, "BF.RESERVE", &["f", "0.01", "100"]), RespValue::ok());
        assert!(matches!(
            run(&mut ks, "BF.RESERVE", &["f", "0.01", "100"]),
            Err(CarmineError::BloomItemExists)
        ));
        assert_eq!(reply(&mut ks, "BF.ADD", &["f", "a"]), RespValue::Integer(1));
        assert_eq!(reply(&mut ks, "BF.ADD", &["f", "a"]), RespValue::Integer(0));
        assert_eq!(reply(&mut ks, "BF.EXISTS", &["f", "a"]), RespValue::Integer(1));
        assert_eq!(reply(&mut ks, "BF.EXISTS", &["f", "zz"]), RespValue::Integer(0));
        assert_eq!(reply(&mut ks, "BF.EXISTS", &["ghost", "a"]), RespValue::Integer(0));
    }

    #[test]
    fn bloom_multi_forms() {
        let mut ks = Keyspace::default();
        assert_eq!(
            reply(&mut ks, "BF.MADD", &["f", "a", "b", "a"]),
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Integer(1),
                RespValue::Integer(0),
            ])
        );
        assert_eq!(
            reply(&mut ks, "BF.MEXISTS", &["f", "a", "zz"]),
            RespValue::Array(vec![RespValue::Integer(1), RespValue::Integer(0)])
        );
    }

    #[test]
    fn bloom_info() {
        let mut ks = Keyspace::default();
        reply(&mut ks, "BF.RESERVE", &["f", "0.01", "100"]);
        match reply(&mut ks, "BF.INFO", &["f"]) {
            RespValue::Array(items) => {
                assert_eq!(items[0], RespValue::bulk("Capacity"));
                assert_eq!(items[1], RespValue::Integer(100));
            }
            other => panic!("{other:?}"),
        }
        assert!(matches!(
            run(&mut ks, "BF.INFO", &["ghost"]),
            Err(CarmineError::NoSuchKey)
        ));
        assert!(matches!(
            run(&mut ks, "BF.RESERVE", &["r", "2", "100"]),
            Err(CarmineError::BloomErrorRate)
        ));
    }
}
