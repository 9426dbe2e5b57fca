//! The RDB snapshot wire format, used for `BGSAVE` output and the full
//! resync leg of replication.
//!
//! Layout: 5-byte magic `REDIS`, a 4-digit ASCII version, an optional
//! `0xFE <db>` selector and `0xFB <len> <len>` resize hint, then a run of
//! entries (optional expiry opcode, value type byte, key, payload) closed by
//! `0xFF` and an 8-byte little-endian CRC-64/ECMA-182 of everything before
//! the checksum itself.
//!
//! Lengths use the classic variable encoding: top bits `00` mean 6-bit
//! inline, `01` mean 14-bit big-endian, `10` mean a 32-bit big-endian word
//! follows.

mod crc64;

pub use crc64::{crc64, Crc64};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const MAGIC: &[u8; 5] = b"REDIS";
pub const VERSION: &[u8; 4] = b"0006";

const OPCODE_SELECTDB: u8 = 0xFE;
const OPCODE_RESIZEDB: u8 = 0xFB;
const OPCODE_EXPIRE_S: u8 = 0xFD;
const OPCODE_EXPIRE_MS: u8 = 0xFC;
const OPCODE_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_SET: u8 = 2;
const TYPE_ZSET: u8 = 3;
const TYPE_HASH: u8 = 4;

#[derive(Debug, Error)]
pub enum RdbError {
    #[error("truncated payload")]
    UnexpectedEof,

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported length encoding {0:#04x}")]
    BadLength(u8),

    #[error("unknown value type {0:#04x}")]
    UnknownValueType(u8),

    #[error("checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },

    #[error("unparsable sorted-set score")]
    BadScore,
}

/// One typed payload as it appears in the file.
#[derive(Debug, Clone, PartialEq)]
pub enum RdbValue {
    String(Bytes),
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    ZSet(Vec<(Bytes, f64)>),
    Hash(Vec<(Bytes, Bytes)>),
}

/// One keyed entry with its optional absolute expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct RdbEntry {
    pub key: Bytes,
    pub value: RdbValue,
    pub expires_at_ms: Option<u64>,
}

fn put_length(dst: &mut BytesMut, len: usize) {
    if len < 1 << 6 {
        dst.put_u8(len as u8);
    } else if len < 1 << 14 {
        dst.put_u8(0b0100_0000 | (len >> 8) as u8);
        dst.put_u8(len as u8);
    } else {
        dst.put_u8(0b1000_0000);
        dst.put_u32(len as u32);
    }
}

fn put_bytes(dst: &mut BytesMut, bytes: &[u8]) {
    put_length(dst, bytes.len());
    dst.put_slice(bytes);
}

/// Serialize a complete snapshot.
pub fn encode(entries: &[RdbEntry]) -> Bytes {
    let mut dst = BytesMut::new();
    dst.put_slice(MAGIC);
    dst.put_slice(VERSION);
    dst.put_u8(OPCODE_SELECTDB);
    put_length(&mut dst, 0);
    dst.put_u8(OPCODE_RESIZEDB);
    put_length(&mut dst, entries.len());
    put_length(&mut dst, entries.iter().filter(|e| e.expires_at_ms.is_some()).count());

    for entry in entries {
        if let Some(at) = entry.expires_at_ms {
            dst.put_u8(OPCODE_EXPIRE_MS);
            dst.put_u64_le(at);
        }
        match &entry.value {
            RdbValue::String(bytes) => {
                dst.put_u8(TYPE_STRING);
                put_bytes(&mut dst, &entry.key);
                put_bytes(&mut dst, bytes);
            }
            RdbValue::List(items) => {
                dst.put_u8(TYPE_LIST);
                put_bytes(&mut dst, &entry.key);
                put_length(&mut dst, items.len());
                for item in items {
                    put_bytes(&mut dst, item);
                }
            }
            RdbValue::Set(members) => {
                dst.put_u8(TYPE_SET);
                put_bytes(&mut dst, &entry.key);
                put_length(&mut dst, members.len());
                for member in members {
                    put_bytes(&mut dst, member);
                }
            }
            RdbValue::ZSet(entries) => {
                dst.put_u8(TYPE_ZSET);
                put_bytes(&mut dst, &entry.key);
                put_length(&mut dst, entries.len());
                for (member, score) in entries {
                    put_bytes(&mut dst, member);
                    // f64 Display is shortest-round-trip decimal, with
                    // infinities as "inf"/"-inf"; the parse side accepts
                    // exactly these forms.
                    put_bytes(&mut dst, score.to_string().as_bytes());
                }
            }
            RdbValue::Hash(fields) => {
                dst.put_u8(TYPE_HASH);
                put_bytes(&mut dst, &entry.key);
                put_length(&mut dst, fields.len());
                for (field, value) in fields {
                    put_bytes(&mut dst, field);
                    put_bytes(&mut dst, value);
                }
            }
        }
    }

    dst.put_u8(OPCODE_EOF);
    let checksum = crc64(&dst);
    dst.put_u64_le(checksum);
    dst.freeze()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RdbError> {
        if self.pos + n > self.buf.len() {
            return Err(RdbError::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, RdbError> {
        Ok(self.take(1)?[0])
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn length(&mut self) -> Result<usize, RdbError> {
        let first = self.u8()?;
        match first >> 6 {
            0b00 => Ok(usize::from(first & 0x3f)),
            0b01 => {
                let second = self.u8()?;
                Ok((usize::from(first & 0x3f) << 8) | usize::from(second))
            }
            0b10 => {
                let word = self.take(4)?;
                Ok(u32::from_be_bytes([word[0], word[1], word[2], word[3]]) as usize)
            }
            _ => Err(RdbError::BadLength(first)),
        }
    }

    fn bytes(&mut self) -> Result<Bytes, RdbError> {
        let len = self.length()?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}

/// Parse and checksum-verify a complete snapshot.
pub fn decode(input: &[u8]) -> Result<Vec<RdbEntry>, RdbError> {
    if input.len() < MAGIC.len() + VERSION.len() + 1 + 8 {
        return Err(RdbError::UnexpectedEof);
    }
    let (body, trailer) = input.split_at(input.len() - 8);
    let stored = LittleEndian::read_u64(trailer);
    let computed = crc64(body);
    if stored != computed {
        return Err(RdbError::ChecksumMismatch { stored, computed });
    }

    let mut r = Reader { buf: body, pos: 0 };
    if r.take(5)? != MAGIC {
        return Err(RdbError::BadMagic);
    }
    r.take(4)?; // version digits; any version with this layout parses

    let mut entries = Vec::new();
    let mut pending_expiry: Option<u64> = None;
    loop {
        let opcode = match r.peek() {
            Some(op) => op,
            None => return Err(RdbError::UnexpectedEof),
        };
        match opcode {
            OPCODE_EOF => break,
            OPCODE_SELECTDB => {
                r.u8()?;
                r.length()?;
            }
            OPCODE_RESIZEDB => {
                r.u8()?;
                r.length()?;
                r.length()?;
            }
            OPCODE_EXPIRE_S => {
                r.u8()?;
                let secs = LittleEndian::read_u32(r.take(4)?);
                pending_expiry = Some(u64::from(secs) * 1000);
            }
            OPCODE_EXPIRE_MS => {
                r.u8()?;
                pending_expiry = Some(LittleEndian::read_u64(r.take(8)?));
            }
            type_byte => {
                r.u8()?;
                let key = r.bytes()?;
                let value = match type_byte {
                    TYPE_STRING => RdbValue::String(r.bytes()?),
                    TYPE_LIST => {
                        let count = r.length()?;
                        let mut items = Vec::with_capacity(count);
                        for _ in 0..count {
                            items.push(r.bytes()?);
                        }
                        RdbValue::List(items)
                    }
                    TYPE_SET => {
                        let count = r.length()?;
                        let mut members = Vec::with_capacity(count);
                        for _ in 0..count {
                            members.push(r.bytes()?);
                        }
                        RdbValue::Set(members)
                    }
                    TYPE_ZSET => {
                        let count = r.length()?;
                        let mut pairs = Vec::with_capacity(count);
                        for _ in 0..count {
                            let member = r.bytes()?;
                            let score_text = r.bytes()?;
                            let score = std::str::from_utf8(&score_text)
                                .ok()
                                .and_then(|s| match s {
                                    "inf" | "+inf" => Some(f64::INFINITY),
                                    "-inf" => Some(f64::NEG_INFINITY),
                                    other => other.parse::<f64>().ok(),
                                })
                                .ok_or(RdbError::BadScore)?;
                            pairs.push((member, score));
                        }
                        RdbValue::ZSet(pairs)
                    }
                    TYPE_HASH => {
                        let count = r.length()?;
                        let mut fields = Vec::with_capacity(count);
                        for _ in 0..count {
                            let field = r.bytes()?;
                            let value = r.bytes()?;
                            fields.push((field, value));
                        }
                        RdbValue::Hash(fields)
                    }
                    other => return Err(RdbError::UnknownValueType(other)),
                };
                entries.push(RdbEntry {
                    key,
                    value,
                    expires_at_ms: pending_expiry.take(),
                });
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn sample_entries() -> Vec<RdbEntry> {
        vec![
            RdbEntry {
                key: b("greeting"),
                value: RdbValue::String(b("hello")),
                expires_at_ms: None,
            },
            RdbEntry {
                key: b("queue"),
                value: RdbValue::List(vec![b("a"), b("b"), b("c")]),
                expires_at_ms: Some(1_750_000_000_000),
            },
            RdbEntry {
                key: b("tags"),
                value: RdbValue::Set(vec![b("x"), b("y")]),
                expires_at_ms: None,
            },
            RdbEntry {
                key: b("board"),
                value: RdbValue::ZSet(vec![(b("alice"), 1.5), (b("bob"), 2.0)]),
                expires_at_ms: None,
            },
            RdbEntry {
                key: b("profile"),
                value: RdbValue::Hash(vec![(b("name"), b("carol")), (b("age"), b("30"))]),
                expires_at_ms: None,
            },
        ]
    }

    #[test]
    fn round_trip() {
        let entries = sample_entries();
        let encoded = encode(&entries);
        assert_eq!(&encoded[..5], MAGIC);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn zset_bodies_carry_members_and_scores() {
        let entries = vec![RdbEntry {
            key: b("z"),
            value: RdbValue::ZSet(vec![(b("m"), 3.25)]),
            expires_at_ms: None,
        }];
        let encoded = encode(&entries);
        // The member bytes and an ASCII score must both appear.
        let haystack = encoded.as_ref();
        assert!(haystack.windows(1).any(|w| w == b"m"));
        assert!(haystack.windows(4).any(|w| w == b"3.25"));
    }

    #[test]
    fn corruption_is_detected() {
        let mut encoded = encode(&sample_entries()).to_vec();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xff;
        assert!(matches!(
            decode(&encoded),
            Err(RdbError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn truncation_is_detected() {
        let encoded = encode(&sample_entries());
        assert!(decode(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn seconds_expiry_opcode_is_accepted() {
        // Hand-build a file using the 0xFD (seconds) opcode.
        let mut dst = BytesMut::new();
        dst.put_slice(MAGIC);
        dst.put_slice(VERSION);
        dst.put_u8(OPCODE_EXPIRE_S);
        dst.put_u32_le(1_750_000_000);
        dst.put_u8(TYPE_STRING);
        put_bytes(&mut dst, b"k");
        put_bytes(&mut dst, b"v");
        dst.put_u8(OPCODE_EOF);
        let checksum = crc64(&dst);
        dst.put_u64_le(checksum);

        let decoded = decode(&dst).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].expires_at_ms, Some(1_750_000_000_000));
    }

    #[test]
    fn length_encodings() {
        for len in [0usize, 5, 63, 64, 300, 16_383, 16_384, 1_000_000] {
            let mut dst = BytesMut::new();
            put_length(&mut dst, len);
            let mut r = Reader { buf: &dst, pos: 0 };
            assert_eq!(r.length().unwrap(), len, "length {len}");
            assert_eq!(r.pos, dst.len());
        }
    }
}

#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn arb_bytes() -> impl Strategy<Value = Bytes> {
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(Bytes::from)
    }

    fn arb_value() -> impl Strategy<Value = RdbValue> {
        prop_oneof![
            arb_bytes().prop_map(RdbValue::String),
            proptest::collection::vec(arb_bytes(), 0..8).prop_map(RdbValue::List),
            proptest::collection::vec(arb_bytes(), 0..8).prop_map(RdbValue::Set),
            proptest::collection::vec((arb_bytes(), -1000i32..1000), 0..8)
                .prop_map(|pairs| RdbValue::ZSet(
                    pairs.into_iter().map(|(m, s)| (m, f64::from(s))).collect()
                )),
            proptest::collection::vec((arb_bytes(), arb_bytes()), 0..8)
                .prop_map(RdbValue::Hash),
        ]
    }

    fn arb_entry() -> impl Strategy<Value = RdbEntry> {
        (arb_bytes(), arb_value(), proptest::option::of(1u64..u64::from(u32::MAX)))
            .prop_map(|(key, value, expires_at_ms)| RdbEntry { key, value, expires_at_ms })
    }

    #[proptest]
    fn encode_decode_round_trips(
        #[strategy(proptest::collection::vec(arb_entry(), 0..12))] entries: Vec<RdbEntry>,
    ) {
        let encoded = encode(&entries);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[proptest]
    fn single_byte_corruption_is_caught(
        #[strategy(proptest::collection::vec(arb_entry(), 1..6))] entries: Vec<RdbEntry>,
        #[strategy(0.0f64..1.0)] position: f64,
        #[strategy(1u8..=255)] flip: u8,
    ) {
        let mut encoded = encode(&entries).to_vec();
        let idx = ((encoded.len() as f64) * position) as usize;
        encoded[idx] ^= flip;
        // Whatever the corruption did, it cannot produce the original
        // entries with a valid checksum.
        match decode(&encoded) {
            Err(_) => {}
            Ok(decoded) => assert_ne!(decoded, entries),
        }
    }
}
