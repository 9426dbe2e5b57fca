//! The typed keyspace command set.
//!
//! A wire request is parsed once into a [`Command`] (arity and argument
//! syntax checked here, before anything touches state), submitted to the
//! processor, and executed against the keyspace to produce an
//! [`ExecOutcome`]: the client reply plus, for successful writes, a
//! [`WriteEffect`] describing what downstream consumers (AOF, replication,
//! watch index, blocking wakeups) need to know.
//!
//! Commands that never reach the processor — pub/sub, transactions control,
//! blocking forms, replication handshake, admin — are intercepted by the
//! connection layer and do not appear here, with one exception:
//! [`Command::TryListPop`], the internal non-blocking form the blocking
//! manager issues on wakeup.

mod hashes;
mod lists;
mod prob;
mod sets;
mod strings;
mod zsets;

use bytes::Bytes;
use carmine_data::list::InsertWhere;
use carmine_data::sorted_set::ScoreBound;
use carmine_data::string::BitOp;
use carmine_data::geo::Unit;
use carmine_errors::{CarmineError, CarmineResult};
use resp_srv::RespValue;

use crate::keyspace::Keyspace;

/// Which end of a list an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Left,
    Right,
}

impl ListEnd {
    pub fn parse(input: &[u8]) -> CarmineResult<Self> {
        match input.to_ascii_uppercase().as_slice() {
            b"LEFT" => Ok(ListEnd::Left),
            b"RIGHT" => Ok(ListEnd::Right),
            _ => Err(CarmineError::Syntax),
        }
    }

    /// The pop command name this end corresponds to, for effect rewriting.
    pub fn pop_name(self) -> &'static str {
        match self {
            ListEnd::Left => "LPOP",
            ListEnd::Right => "RPOP",
        }
    }
}

/// What a successful write tells the rest of the system.
#[derive(Debug, Clone)]
pub struct WriteEffect {
    /// Normalized command (uppercase name + arguments) for the AOF stream
    /// and replication fan-out. May differ from what the client sent: a
    /// blocking pop logs its effective non-blocking form, `SPOP` logs the
    /// `SREM` of whatever it actually removed.
    pub command: Vec<Bytes>,
    /// Keys whose watchers must be marked dirty.
    pub touched_keys: Vec<Bytes>,
    /// Keys that gained list elements, eligible to wake blocked poppers.
    pub pushed_lists: Vec<Bytes>,
}

impl WriteEffect {
    fn new(command: Vec<Bytes>, touched_keys: Vec<Bytes>) -> Self {
        WriteEffect { command, touched_keys, pushed_lists: Vec::new() }
    }

    fn with_pushes(mut self, pushed: Vec<Bytes>) -> Self {
        self.pushed_lists = pushed;
        self
    }
}

/// Reply plus optional write effect.
#[derive(Debug)]
pub struct ExecOutcome {
    pub reply: RespValue,
    pub effect: Option<WriteEffect>,
}

impl ExecOutcome {
    pub fn read(reply: RespValue) -> Self {
        ExecOutcome { reply, effect: None }
    }

    pub fn wrote(reply: RespValue, effect: WriteEffect) -> Self {
        ExecOutcome { reply, effect: Some(effect) }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    // Strings and keys
    Set { key: Bytes, value: Bytes, expire_ms: Option<u64>, nx: bool, xx: bool },
    SetEx { key: Bytes, seconds: i64, value: Bytes },
    SetNx { key: Bytes, value: Bytes },
    Get { key: Bytes },
    GetSet { key: Bytes, value: Bytes },
    Del { keys: Vec<Bytes> },
    Exists { keys: Vec<Bytes> },
    Keys { pattern: Bytes },
    Expire { key: Bytes, seconds: i64 },
    Ttl { key: Bytes },
    Pttl { key: Bytes },
    Persist { key: Bytes },
    Rename { from: Bytes, to: Bytes },
    TypeOf { key: Bytes },
    IncrBy { key: Bytes, delta: i64 },
    IncrByFloat { key: Bytes, delta: f64 },
    Append { key: Bytes, value: Bytes },
    Strlen { key: Bytes },
    GetRange { key: Bytes, start: i64, end: i64 },
    SetRange { key: Bytes, offset: u64, value: Bytes },
    MGet { keys: Vec<Bytes> },
    MSet { pairs: Vec<(Bytes, Bytes)> },
    FlushAll,
    DbSize,

    // Bitmaps
    SetBit { key: Bytes, offset: u64, value: bool },
    GetBit { key: Bytes, offset: u64 },
    BitCount { key: Bytes, range: Option<(i64, i64)> },
    BitPos { key: Bytes, bit: bool, start: i64, end: Option<i64> },
    BitOpCmd { op: BitOp, dest: Bytes, sources: Vec<Bytes> },

    // Lists
    Push { key: Bytes, values: Vec<Bytes>, end: ListEnd },
    Pop { key: Bytes, end: ListEnd },
    LLen { key: Bytes },
    LRange { key: Bytes, start: i64, stop: i64 },
    LIndex { key: Bytes, index: i64 },
    LSet { key: Bytes, index: i64, value: Bytes },
    LRem { key: Bytes, count: i64, value: Bytes },
    LTrim { key: Bytes, start: i64, stop: i64 },
    LInsert { key: Bytes, whence: InsertWhere, pivot: Bytes, value: Bytes },
    LMove { source: Bytes, dest: Bytes, from: ListEnd, to: ListEnd },
    /// Internal: the effective non-blocking form of BLPOP/BRPOP/BLMOVE.
    /// Pops from the first non-empty key; reports which key served.
    TryListPop { keys: Vec<Bytes>, from: ListEnd, dest: Option<(Bytes, ListEnd)> },

    // Hashes
    HSet { key: Bytes, pairs: Vec<(Bytes, Bytes)> },
    HSetNx { key: Bytes, field: Bytes, value: Bytes },
    HGet { key: Bytes, field: Bytes },
    HMGet { key: Bytes, fields: Vec<Bytes> },
    HDel { key: Bytes, fields: Vec<Bytes> },
    HExists { key: Bytes, field: Bytes },
    HLen { key: Bytes },
    HKeys { key: Bytes },
    HVals { key: Bytes },
    HGetAll { key: Bytes },
    HIncrBy { key: Bytes, field: Bytes, delta: i64 },
    HIncrByFloat { key: Bytes, field: Bytes, delta: f64 },
    HRandField { key: Bytes, count: Option<i64> },

    // Sets
    SAdd { key: Bytes, members: Vec<Bytes> },
    SRem { key: Bytes, members: Vec<Bytes> },
    SIsMember { key: Bytes, member: Bytes },
    SMIsMember { key: Bytes, members: Vec<Bytes> },
    SMembers { key: Bytes },
    SCard { key: Bytes },
    SPop { key: Bytes, count: Option<u64> },
    SRandMember { key: Bytes, count: Option<i64> },
    SetAlgebra { op: SetAlgebraOp, keys: Vec<Bytes> },
    SetAlgebraStore { op: SetAlgebraOp, dest: Bytes, keys: Vec<Bytes> },
    SMove { source: Bytes, dest: Bytes, member: Bytes },

    // Sorted sets
    ZAdd { key: Bytes, entries: Vec<(f64, Bytes)> },
    ZRem { key: Bytes, members: Vec<Bytes> },
    ZScore { key: Bytes, member: Bytes },
    ZRank { key: Bytes, member: Bytes, rev: bool },
    ZCard { key: Bytes },
    ZRangeByRank { key: Bytes, start: i64, stop: i64, rev: bool, withscores: bool },
    ZRangeByScore { key: Bytes, min: ScoreBound, max: ScoreBound, rev: bool, withscores: bool },
    ZIncrBy { key: Bytes, delta: f64, member: Bytes },
    ZCount { key: Bytes, min: ScoreBound, max: ScoreBound },
    ZPop { key: Bytes, count: u64, min: bool },
    ZRemRangeByScore { key: Bytes, min: ScoreBound, max: ScoreBound },
    ZRemRangeByRank { key: Bytes, start: i64, stop: i64 },

    // Geo (sorted sets underneath)
    GeoAdd { key: Bytes, items: Vec<(f64, f64, Bytes)> },
    GeoPos { key: Bytes, members: Vec<Bytes> },
    GeoDist { key: Bytes, member1: Bytes, member2: Bytes, unit: Unit },
    GeoHash { key: Bytes, members: Vec<Bytes> },
    GeoRadius {
        key: Bytes,
        lon: f64,
        lat: f64,
        radius: f64,
        unit: Unit,
        opts: GeoRadiusOpts,
    },
    GeoRadiusByMember { key: Bytes, member: Bytes, radius: f64, unit: Unit, opts: GeoRadiusOpts },

    // Probabilistic
    PfAdd { key: Bytes, elements: Vec<Bytes> },
    PfCount { keys: Vec<Bytes> },
    PfMerge { dest: Bytes, sources: Vec<Bytes> },
    BfReserve { key: Bytes, error_rate: f64, capacity: u64 },
    BfAdd { key: Bytes, items: Vec<Bytes> },
    BfExists { key: Bytes, items: Vec<Bytes>, multi: bool },
    BfInfo { key: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAlgebraOp {
    Union,
    Inter,
    Diff,
}

#[derive(Debug, Clone, Default)]
pub struct GeoRadiusOpts {
    pub withcoord: bool,
    pub withdist: bool,
    pub count: Option<usize>,
    pub sort_asc: bool,
}

fn arity_err(name: &str) -> CarmineError {
    CarmineError::WrongArity(name.to_ascii_lowercase())
}

pub(crate) fn parse_i64(input: &[u8]) -> CarmineResult<i64> {
    std::str::from_utf8(input)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CarmineError::NotAnInteger)
}

pub(crate) fn parse_u64(input: &[u8]) -> CarmineResult<u64> {
    std::str::from_utf8(input)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(CarmineError::NotAnInteger)
}

pub(crate) fn parse_f64(input: &[u8]) -> CarmineResult<f64> {
    let value = std::str::from_utf8(input)
        .ok()
        .and_then(|s| match s.to_ascii_lowercase().as_str() {
            "inf" | "+inf" => Some(f64::INFINITY),
            "-inf" => Some(f64::NEG_INFINITY),
            other => other.parse::<f64>().ok(),
        })
        .ok_or(CarmineError::NotAFloat)?;
    if value.is_nan() {
        return Err(CarmineError::NotAFloat);
    }
    Ok(value)
}

impl Command {
    /// Parse an uppercased command name plus arguments. Unknown names are
    /// the caller's problem: the connection layer routes non-keyspace
    /// commands before ever calling this.
    pub fn parse(name: &str, args: &[Bytes]) -> CarmineResult<Command> {
        use Command::*;
        let cmd = match name {
            "SET" => {
                if args.len() < 2 {
                    return Err(arity_err(name));
                }
                let mut expire_ms = None;
                let mut nx = false;
                let mut xx = false;
                let mut i = 2;
                while i < args.len() {
                    match args[i].to_ascii_uppercase().as_slice() {
                        b"EX" => {
                            let secs = parse_i64(args.get(i + 1).ok_or(CarmineError::Syntax)?)?;
                            if secs <= 0 {
                                return Err(CarmineError::InvalidExpireTime("set".into()));
                            }
                            expire_ms = Some(secs as u64 * 1000);
                            i += 2;
                        }
                        b"PX" => {
                            let ms = parse_i64(args.get(i + 1).ok_or(CarmineError::Syntax)?)?;
                            if ms <= 0 {
                                return Err(CarmineError::InvalidExpireTime("set".into()));
                            }
                            expire_ms = Some(ms as u64);
                            i += 2;
                        }
                        b"NX" => {
                            nx = true;
                            i += 1;
                        }
                        b"XX" => {
                            xx = true;
                            i += 1;
                        }
                        _ => return Err(CarmineError::Syntax),
                    }
                }
                if nx && xx {
                    return Err(CarmineError::Syntax);
                }
                Set { key: args[0].clone(), value: args[1].clone(), expire_ms, nx, xx }
            }
            "SETEX" => {
                let [key, seconds, value] = exact::<3>(name, args)?;
                let seconds = parse_i64(&seconds)?;
                if seconds <= 0 {
                    return Err(CarmineError::InvalidExpireTime("setex".into()));
                }
                SetEx { key, seconds, value }
            }
            "SETNX" => {
                let [key, value] = exact::<2>(name, args)?;
                SetNx { key, value }
            }
            "GET" => Get { key: exact::<1>(name, args)?[0].clone() },
            "GETSET" => {
                let [key, value] = exact::<2>(name, args)?;
                GetSet { key, value }
            }
            "DEL" => Del { keys: at_least(name, args, 1)? },
            "EXISTS" => Exists { keys: at_least(name, args, 1)? },
            "KEYS" => Keys { pattern: exact::<1>(name, args)?[0].clone() },
            "EXPIRE" => {
                let [key, seconds] = exact::<2>(name, args)?;
                Expire { key, seconds: parse_i64(&seconds)? }
            }
            "TTL" => Ttl { key: exact::<1>(name, args)?[0].clone() },
            "PTTL" => Pttl { key: exact::<1>(name, args)?[0].clone() },
            "PERSIST" => Persist { key: exact::<1>(name, args)?[0].clone() },
            "RENAME" => {
                let [from, to] = exact::<2>(name, args)?;
                Rename { from, to }
            }
            "TYPE" => TypeOf { key: exact::<1>(name, args)?[0].clone() },
            "INCR" => IncrBy { key: exact::<1>(name, args)?[0].clone(), delta: 1 },
            "DECR" => IncrBy { key: exact::<1>(name, args)?[0].clone(), delta: -1 },
            "INCRBY" => {
                let [key, delta] = exact::<2>(name, args)?;
                IncrBy { key, delta: parse_i64(&delta)? }
            }
            "DECRBY" => {
                let [key, delta] = exact::<2>(name, args)?;
                IncrBy { key, delta: parse_i64(&delta)?.checked_neg().ok_or(CarmineError::NotAnInteger)? }
            }
            "INCRBYFLOAT" => {
                let [key, delta] = exact::<2>(name, args)?;
                IncrByFloat { key, delta: parse_f64(&delta)? }
            }
            "APPEND" => {
                let [key, value] = exact::<2>(name, args)?;
                Append { key, value }
            }
            "STRLEN" => Strlen { key: exact::<1>(name, args)?[0].clone() },
            "GETRANGE" => {
                let [key, start, end] = exact::<3>(name, args)?;
                GetRange { key, start: parse_i64(&start)?, end: parse_i64(&end)? }
            }
            "SETRANGE" => {
                let [key, offset, value] = exact::<3>(name, args)?;
                SetRange { key, offset: parse_u64(&offset)?, value }
            }
            "MGET" => MGet { keys: at_least(name, args, 1)? },
            "MSET" => {
                if args.is_empty() || args.len() % 2 != 0 {
                    return Err(arity_err(name));
                }
                MSet { pairs: args.chunks(2).map(|c| (c[0].clone(), c[1].clone())).collect() }
            }
            "FLUSHALL" => FlushAll,
            "DBSIZE" => DbSize,

            "SETBIT" => {
                let [key, offset, value] = exact::<3>(name, args)?;
                let offset = parse_u64(&offset).map_err(|_| CarmineError::BitOffsetOutOfRange)?;
                let value = match parse_i64(&value) {
                    Ok(0) => false,
                    Ok(1) => true,
                    _ => return Err(CarmineError::BitOutOfRange),
                };
                SetBit { key, offset, value }
            }
            "GETBIT" => {
                let [key, offset] = exact::<2>(name, args)?;
                GetBit {
                    key,
                    offset: parse_u64(&offset).map_err(|_| CarmineError::BitOffsetOutOfRange)?,
                }
            }
            "BITCOUNT" => match args {
                [key] => BitCount { key: key.clone(), range: None },
                [key, start, end] => BitCount {
                    key: key.clone(),
                    range: Some((parse_i64(start)?, parse_i64(end)?)),
                },
                _ => return Err(arity_err(name)),
            },
            "BITPOS" => {
                if !(2..=4).contains(&args.len()) {
                    return Err(arity_err(name));
                }
                let bit = match parse_i64(&args[1]) {
                    Ok(0) => false,
                    Ok(1) => true,
                    _ => return Err(CarmineError::BitOutOfRange),
                };
                let start = args.get(2).map(|a| parse_i64(a)).transpose()?.unwrap_or(0);
                let end = args.get(3).map(|a| parse_i64(a)).transpose()?;
                BitPos { key: args[0].clone(), bit, start, end }
            }
            "BITOP" => {
                if args.len() < 3 {
                    return Err(arity_err(name));
                }
                BitOpCmd {
                    op: BitOp::parse(&args[0])?,
                    dest: args[1].clone(),
                    sources: args[2..].to_vec(),
                }
            }

            "LPUSH" | "RPUSH" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                let end = if name == "LPUSH" { ListEnd::Left } else { ListEnd::Right };
                Push { key, values: rest, end }
            }
            "LPOP" | "RPOP" => {
                let end = if name == "LPOP" { ListEnd::Left } else { ListEnd::Right };
                Pop { key: exact::<1>(name, args)?[0].clone(), end }
            }
            "LLEN" => LLen { key: exact::<1>(name, args)?[0].clone() },
            "LRANGE" => {
                let [key, start, stop] = exact::<3>(name, args)?;
                LRange { key, start: parse_i64(&start)?, stop: parse_i64(&stop)? }
            }
            "LINDEX" => {
                let [key, index] = exact::<2>(name, args)?;
                LIndex { key, index: parse_i64(&index)? }
            }
            "LSET" => {
                let [key, index, value] = exact::<3>(name, args)?;
                LSet { key, index: parse_i64(&index)?, value }
            }
            "LREM" => {
                let [key, count, value] = exact::<3>(name, args)?;
                LRem { key, count: parse_i64(&count)?, value }
            }
            "LTRIM" => {
                let [key, start, stop] = exact::<3>(name, args)?;
                LTrim { key, start: parse_i64(&start)?, stop: parse_i64(&stop)? }
            }
            "LINSERT" => {
                let [key, whence, pivot, value] = exact::<4>(name, args)?;
                let whence = match whence.to_ascii_uppercase().as_slice() {
                    b"BEFORE" => InsertWhere::Before,
                    b"AFTER" => InsertWhere::After,
                    _ => return Err(CarmineError::Syntax),
                };
                LInsert { key, whence, pivot, value }
            }
            "LMOVE" => {
                let [source, dest, from, to] = exact::<4>(name, args)?;
                LMove { source, dest, from: ListEnd::parse(&from)?, to: ListEnd::parse(&to)? }
            }
            "RPOPLPUSH" => {
                let [source, dest] = exact::<2>(name, args)?;
                LMove { source, dest, from: ListEnd::Right, to: ListEnd::Left }
            }

            "HSET" | "HMSET" => {
                if args.len() < 3 || args.len() % 2 != 1 {
                    return Err(arity_err(name));
                }
                HSet {
                    key: args[0].clone(),
                    pairs: args[1..].chunks(2).map(|c| (c[0].clone(), c[1].clone())).collect(),
                }
            }
            "HSETNX" => {
                let [key, field, value] = exact::<3>(name, args)?;
                HSetNx { key, field, value }
            }
            "HGET" => {
                let [key, field] = exact::<2>(name, args)?;
                HGet { key, field }
            }
            "HMGET" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                HMGet { key, fields: rest }
            }
            "HDEL" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                HDel { key, fields: rest }
            }
            "HEXISTS" => {
                let [key, field] = exact::<2>(name, args)?;
                HExists { key, field }
            }
            "HLEN" => HLen { key: exact::<1>(name, args)?[0].clone() },
            "HKEYS" => HKeys { key: exact::<1>(name, args)?[0].clone() },
            "HVALS" => HVals { key: exact::<1>(name, args)?[0].clone() },
            "HGETALL" => HGetAll { key: exact::<1>(name, args)?[0].clone() },
            "HINCRBY" => {
                let [key, field, delta] = exact::<3>(name, args)?;
                HIncrBy { key, field, delta: parse_i64(&delta)? }
            }
            "HINCRBYFLOAT" => {
                let [key, field, delta] = exact::<3>(name, args)?;
                HIncrByFloat { key, field, delta: parse_f64(&delta)? }
            }
            "HRANDFIELD" => match args {
                [key] => HRandField { key: key.clone(), count: None },
                [key, count] => HRandField { key: key.clone(), count: Some(parse_i64(count)?) },
                _ => return Err(arity_err(name)),
            },

            "SADD" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                SAdd { key, members: rest }
            }
            "SREM" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                SRem { key, members: rest }
            }
            "SISMEMBER" => {
                let [key, member] = exact::<2>(name, args)?;
                SIsMember { key, member }
            }
            "SMISMEMBER" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                SMIsMember { key, members: rest }
            }
            "SMEMBERS" => SMembers { key: exact::<1>(name, args)?[0].clone() },
            "SCARD" => SCard { key: exact::<1>(name, args)?[0].clone() },
            "SPOP" => match args {
                [key] => SPop { key: key.clone(), count: None },
                [key, count] => SPop { key: key.clone(), count: Some(parse_u64(count)?) },
                _ => return Err(arity_err(name)),
            },
            "SRANDMEMBER" => match args {
                [key] => SRandMember { key: key.clone(), count: None },
                [key, count] => SRandMember { key: key.clone(), count: Some(parse_i64(count)?) },
                _ => return Err(arity_err(name)),
            },
            "SUNION" => SetAlgebra { op: SetAlgebraOp::Union, keys: at_least(name, args, 1)? },
            "SINTER" => SetAlgebra { op: SetAlgebraOp::Inter, keys: at_least(name, args, 1)? },
            "SDIFF" => SetAlgebra { op: SetAlgebraOp::Diff, keys: at_least(name, args, 1)? },
            "SUNIONSTORE" | "SINTERSTORE" | "SDIFFSTORE" => {
                let mut rest = at_least(name, args, 2)?;
                let dest = rest.remove(0);
                let op = match name {
                    "SUNIONSTORE" => SetAlgebraOp::Union,
                    "SINTERSTORE" => SetAlgebraOp::Inter,
                    _ => SetAlgebraOp::Diff,
                };
                SetAlgebraStore { op, dest, keys: rest }
            }
            "SMOVE" => {
                let [source, dest, member] = exact::<3>(name, args)?;
                SMove { source, dest, member }
            }

            "ZADD" => {
                if args.len() < 3 || args.len() % 2 != 1 {
                    return Err(arity_err(name));
                }
                let mut entries = Vec::with_capacity(args.len() / 2);
                for chunk in args[1..].chunks(2) {
                    entries.push((parse_f64(&chunk[0])?, chunk[1].clone()));
                }
                ZAdd { key: args[0].clone(), entries }
            }
            "ZREM" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                ZRem { key, members: rest }
            }
            "ZSCORE" => {
                let [key, member] = exact::<2>(name, args)?;
                ZScore { key, member }
            }
            "ZRANK" | "ZREVRANK" => {
                let [key, member] = exact::<2>(name, args)?;
                ZRank { key, member, rev: name == "ZREVRANK" }
            }
            "ZCARD" => ZCard { key: exact::<1>(name, args)?[0].clone() },
            "ZRANGE" | "ZREVRANGE" => {
                if !(3..=4).contains(&args.len()) {
                    return Err(arity_err(name));
                }
                let withscores = match args.get(3) {
                    None => false,
                    Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") => true,
                    Some(_) => return Err(CarmineError::Syntax),
                };
                ZRangeByRank {
                    key: args[0].clone(),
                    start: parse_i64(&args[1])?,
                    stop: parse_i64(&args[2])?,
                    rev: name == "ZREVRANGE",
                    withscores,
                }
            }
            "ZRANGEBYSCORE" | "ZREVRANGEBYSCORE" => {
                if !(3..=4).contains(&args.len()) {
                    return Err(arity_err(name));
                }
                let withscores = match args.get(3) {
                    None => false,
                    Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") => true,
                    Some(_) => return Err(CarmineError::Syntax),
                };
                let rev = name == "ZREVRANGEBYSCORE";
                // The reversed form takes (max, min) on the wire.
                let (lo, hi) = if rev { (&args[2], &args[1]) } else { (&args[1], &args[2]) };
                ZRangeByScore {
                    key: args[0].clone(),
                    min: ScoreBound::parse(lo)?,
                    max: ScoreBound::parse(hi)?,
                    rev,
                    withscores,
                }
            }
            "ZINCRBY" => {
                let [key, delta, member] = exact::<3>(name, args)?;
                ZIncrBy { key, delta: parse_f64(&delta)?, member }
            }
            "ZCOUNT" => {
                let [key, min, max] = exact::<3>(name, args)?;
                ZCount { key, min: ScoreBound::parse(&min)?, max: ScoreBound::parse(&max)? }
            }
            "ZPOPMIN" | "ZPOPMAX" => {
                if !(1..=2).contains(&args.len()) {
                    return Err(arity_err(name));
                }
                let count = args.get(1).map(|a| parse_u64(a)).transpose()?.unwrap_or(1);
                ZPop { key: args[0].clone(), count, min: name == "ZPOPMIN" }
            }
            "ZREMRANGEBYSCORE" => {
                let [key, min, max] = exact::<3>(name, args)?;
                ZRemRangeByScore {
                    key,
                    min: ScoreBound::parse(&min)?,
                    max: ScoreBound::parse(&max)?,
                }
            }
            "ZREMRANGEBYRANK" => {
                let [key, start, stop] = exact::<3>(name, args)?;
                ZRemRangeByRank { key, start: parse_i64(&start)?, stop: parse_i64(&stop)? }
            }

            "GEOADD" => {
                if args.len() < 4 || (args.len() - 1) % 3 != 0 {
                    return Err(arity_err(name));
                }
                let mut items = Vec::with_capacity((args.len() - 1) / 3);
                for chunk in args[1..].chunks(3) {
                    items.push((parse_f64(&chunk[0])?, parse_f64(&chunk[1])?, chunk[2].clone()));
                }
                GeoAdd { key: args[0].clone(), items }
            }
            "GEOPOS" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                GeoPos { key, members: rest }
            }
            "GEODIST" => {
                if !(3..=4).contains(&args.len()) {
                    return Err(arity_err(name));
                }
                let unit = match args.get(3) {
                    Some(u) => Unit::parse(u)?,
                    None => Unit::Meters,
                };
                GeoDist {
                    key: args[0].clone(),
                    member1: args[1].clone(),
                    member2: args[2].clone(),
                    unit,
                }
            }
            "GEOHASH" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                GeoHash { key, members: rest }
            }
            "GEORADIUS" => {
                if args.len() < 5 {
                    return Err(arity_err(name));
                }
                GeoRadius {
                    key: args[0].clone(),
                    lon: parse_f64(&args[1])?,
                    lat: parse_f64(&args[2])?,
                    radius: parse_f64(&args[3])?,
                    unit: Unit::parse(&args[4])?,
                    opts: parse_geo_opts(&args[5..])?,
                }
            }
            "GEORADIUSBYMEMBER" => {
                if args.len() < 4 {
                    return Err(arity_err(name));
                }
                GeoRadiusByMember {
                    key: args[0].clone(),
                    member: args[1].clone(),
                    radius: parse_f64(&args[2])?,
                    unit: Unit::parse(&args[3])?,
                    opts: parse_geo_opts(&args[4..])?,
                }
            }

            "PFADD" => {
                let mut rest = at_least(name, args, 1)?;
                let key = rest.remove(0);
                PfAdd { key, elements: rest }
            }
            "PFCOUNT" => PfCount { keys: at_least(name, args, 1)? },
            "PFMERGE" => {
                let mut rest = at_least(name, args, 1)?;
                let dest = rest.remove(0);
                PfMerge { dest, sources: rest }
            }
            "BF.RESERVE" => {
                let [key, error_rate, capacity] = exact::<3>(name, args)?;
                BfReserve {
                    key,
                    error_rate: parse_f64(&error_rate).map_err(|_| CarmineError::BloomErrorRate)?,
                    capacity: parse_u64(&capacity).map_err(|_| CarmineError::BloomCapacity)?,
                }
            }
            "BF.ADD" => {
                let [key, item] = exact::<2>(name, args)?;
                BfAdd { key, items: vec![item] }
            }
            "BF.MADD" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                BfAdd { key, items: rest }
            }
            "BF.EXISTS" => {
                let [key, item] = exact::<2>(name, args)?;
                BfExists { key, items: vec![item], multi: false }
            }
            "BF.MEXISTS" => {
                let mut rest = at_least(name, args, 2)?;
                let key = rest.remove(0);
                BfExists { key, items: rest, multi: true }
            }
            "BF.INFO" => BfInfo { key: exact::<1>(name, args)?[0].clone() },

            other => return Err(CarmineError::UnknownCommand(other.to_ascii_lowercase())),
        };
        Ok(cmd)
    }

    /// Execute against the keyspace. `raw` is the normalized wire form used
    /// when building the write effect.
    pub fn execute(self, ks: &mut Keyspace, raw: Vec<Bytes>) -> CarmineResult<ExecOutcome> {
        use Command::*;
        match self {
            Set { .. } | SetEx { .. } | SetNx { .. } | Get { .. } | GetSet { .. }
            | Del { .. } | Exists { .. } | Keys { .. } | Expire { .. } | Ttl { .. }
            | Pttl { .. } | Persist { .. } | Rename { .. } | TypeOf { .. } | IncrBy { .. }
            | IncrByFloat { .. } | Append { .. } | Strlen { .. } | GetRange { .. }
            | SetRange { .. } | MGet { .. } | MSet { .. } | FlushAll | DbSize
            | SetBit { .. } | GetBit { .. } | BitCount { .. } | BitPos { .. }
            | BitOpCmd { .. } => strings::execute(self, ks, raw),

            Push { .. } | Pop { .. } | LLen { .. } | LRange { .. } | LIndex { .. }
            | LSet { .. } | LRem { .. } | LTrim { .. } | LInsert { .. } | LMove { .. }
            | TryListPop { .. } => lists::execute(self, ks, raw),

            HSet { .. } | HSetNx { .. } | HGet { .. } | HMGet { .. } | HDel { .. }
            | HExists { .. } | HLen { .. } | HKeys { .. } | HVals { .. } | HGetAll { .. }
            | HIncrBy { .. } | HIncrByFloat { .. } | HRandField { .. } => {
                hashes::execute(self, ks, raw)
            }

            SAdd { .. } | SRem { .. } | SIsMember { .. } | SMIsMember { .. }
            | SMembers { .. } | SCard { .. } | SPop { .. } | SRandMember { .. }
            | SetAlgebra { .. } | SetAlgebraStore { .. } | SMove { .. } => {
                sets::execute(self, ks, raw)
            }

            ZAdd { .. } | ZRem { .. } | ZScore { .. } | ZRank { .. } | ZCard { .. }
            | ZRangeByRank { .. } | ZRangeByScore { .. } | ZIncrBy { .. } | ZCount { .. }
            | ZPop { .. } | ZRemRangeByScore { .. } | ZRemRangeByRank { .. }
            | GeoAdd { .. } | GeoPos { .. } | GeoDist { .. } | GeoHash { .. }
            | GeoRadius { .. } | GeoRadiusByMember { .. } => zsets::execute(self, ks, raw),

            PfAdd { .. } | PfCount { .. } | PfMerge { .. } | BfReserve { .. }
            | BfAdd { .. } | BfExists { .. } | BfInfo { .. } => prob::execute(self, ks, raw),
        }
    }

    /// Whether this command can mutate the keyspace. Used by the replica
    /// read-only guard; the actual effect decision happens at execute time.
    pub fn is_write(&self) -> bool {
        use Command::*;
        matches!(
            self,
            Set { .. }
                | SetEx { .. }
                | SetNx { .. }
                | GetSet { .. }
                | Del { .. }
                | Expire { .. }
                | Persist { .. }
                | Rename { .. }
                | IncrBy { .. }
                | IncrByFloat { .. }
                | Append { .. }
                | SetRange { .. }
                | MSet { .. }
                | FlushAll
                | SetBit { .. }
                | BitOpCmd { .. }
                | Push { .. }
                | Pop { .. }
                | LSet { .. }
                | LRem { .. }
                | LTrim { .. }
                | LInsert { .. }
                | LMove { .. }
                | TryListPop { .. }
                | HSet { .. }
                | HSetNx { .. }
                | HDel { .. }
                | HIncrBy { .. }
                | HIncrByFloat { .. }
                | SAdd { .. }
                | SRem { .. }
                | SPop { .. }
                | SetAlgebraStore { .. }
                | SMove { .. }
                | ZAdd { .. }
                | ZRem { .. }
                | ZIncrBy { .. }
                | ZPop { .. }
                | ZRemRangeByScore { .. }
                | ZRemRangeByRank { .. }
                | GeoAdd { .. }
                | PfAdd { .. }
                | PfMerge { .. }
                | BfReserve { .. }
                | BfAdd { .. }
        )
    }
}

fn parse_geo_opts(args: &[Bytes]) -> CarmineResult<GeoRadiusOpts> {
    let mut opts = GeoRadiusOpts::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].to_ascii_uppercase().as_slice() {
            b"WITHCOORD" => {
                opts.withcoord = true;
                i += 1;
            }
            b"WITHDIST" => {
                opts.withdist = true;
                i += 1;
            }
            b"COUNT" => {
                let count = parse_u64(args.get(i + 1).ok_or(CarmineError::Syntax)?)?;
                if count == 0 {
                    return Err(CarmineError::Syntax);
                }
                opts.count = Some(count as usize);
                opts.sort_asc = true;
                i += 2;
            }
            b"ASC" => {
                opts.sort_asc = true;
                i += 1;
            }
            b"DESC" => {
                opts.sort_asc = false;
                i += 1;
            }
            _ => return Err(CarmineError::Syntax),
        }
    }
    Ok(opts)
}

fn exact<const N: usize>(name: &str, args: &[Bytes]) -> CarmineResult<[Bytes; N]> {
    if args.len() != N {
        return Err(arity_err(name));
    }
    Ok(std::array::from_fn(|i| args[i].clone()))
}

fn at_least(name: &str, args: &[Bytes], min: usize) -> CarmineResult<Vec<Bytes>> {
    if args.len() < min {
        return Err(arity_err(name));
    }
    Ok(args.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn arity_checks() {
        assert!(matches!(
            Command::parse("GET", &[]),
            Err(CarmineError::WrongArity(ref c)) if c == "get"
        ));
        assert!(matches!(
            Command::parse("SET", &[b("k")]),
            Err(CarmineError::WrongArity(_))
        ));
        assert!(Command::parse("SET", &[b("k"), b("v")]).is_ok());
        assert!(matches!(
            Command::parse("MSET", &[b("a"), b("1"), b("b")]),
            Err(CarmineError::WrongArity(_))
        ));
    }

    #[test]
    fn set_options() {
        let cmd = Command::parse("SET", &[b("k"), b("v"), b("ex"), b("10"), b("NX")]).unwrap();
        match cmd {
            Command::Set { expire_ms, nx, xx, .. } => {
                assert_eq!(expire_ms, Some(10_000));
                assert!(nx);
                assert!(!xx);
            }
            other => panic!("parsed {other:?}"),
        }
        assert!(matches!(
            Command::parse("SET", &[b("k"), b("v"), b("NX"), b("XX")]),
            Err(CarmineError::Syntax)
        ));
        assert!(matches!(
            Command::parse("SET", &[b("k"), b("v"), b("EX"), b("0")]),
            Err(CarmineError::InvalidExpireTime(_))
        ));
    }

    #[test]
    fn numeric_argument_errors() {
        assert!(matches!(
            Command::parse("INCRBY", &[b("k"), b("ten")]),
            Err(CarmineError::NotAnInteger)
        ));
        assert!(matches!(
            Command::parse("SETBIT", &[b("k"), b("7"), b("2")]),
            Err(CarmineError::BitOutOfRange)
        ));
        assert!(matches!(
            Command::parse("ZADD", &[b("k"), b("abc"), b("m")]),
            Err(CarmineError::NotAFloat)
        ));
    }

    #[test]
    fn rpoplpush_is_lmove_sugar() {
        match Command::parse("RPOPLPUSH", &[b("s"), b("d")]).unwrap() {
            Command::LMove { from, to, .. } => {
                assert_eq!(from, ListEnd::Right);
                assert_eq!(to, ListEnd::Left);
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn zrevrangebyscore_swaps_bounds() {
        match Command::parse("ZREVRANGEBYSCORE", &[b("k"), b("10"), b("2")]).unwrap() {
            Command::ZRangeByScore { min, max, rev, .. } => {
                assert!(rev);
                assert_eq!(min.value, 2.0);
                assert_eq!(max.value, 10.0);
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn write_classification() {
        assert!(Command::parse("SET", &[b("k"), b("v")]).unwrap().is_write());
        assert!(!Command::parse("GET", &[b("k")]).unwrap().is_write());
        assert!(Command::parse("LPUSH", &[b("k"), b("v")]).unwrap().is_write());
        assert!(!Command::parse("ZSCORE", &[b("k"), b("m")]).unwrap().is_write());
        assert!(!Command::parse("SRANDMEMBER", &[b("k")]).unwrap().is_write());
        assert!(Command::parse("SPOP", &[b("k")]).unwrap().is_write());
    }

    #[test]
    fn unknown_command() {
        assert!(matches!(
            Command::parse("FROB", &[]),
            Err(CarmineError::UnknownCommand(ref c)) if c == "frob"
        ));
    }
}
