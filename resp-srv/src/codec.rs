use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DecodeError;
use crate::value::RespValue;
use crate::Request;

/// Upper bound on elements in one request array.
pub const MAX_ARRAY_ELEMENTS: i64 = 1024 * 1024;

/// Upper bound on one bulk string (512 MiB, matching the protocol's limit).
pub const MAX_BULK_LENGTH: i64 = 512 * 1024 * 1024;

/// Upper bound on one inline request line.
pub const MAX_INLINE_LENGTH: usize = 64 * 1024;

/// Index of the `\r` of the first CRLF at or after `start`, if the buffer
/// holds one.
fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn parse_line_i64(line: &[u8]) -> Result<i64, DecodeError> {
    Ok(std::str::from_utf8(line)?.parse::<i64>()?)
}

/// Attempt to read one request frame starting at the front of `buf` without
/// consuming anything.
///
/// Returns the parsed argument vector (or `None` for a blank/empty frame that
/// should be skipped) and the number of bytes the frame occupies.
#[allow(clippy::type_complexity)]
fn peek_request(buf: &[u8]) -> Result<Option<(Option<Vec<Bytes>>, usize)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] == b'*' {
        peek_multibulk(buf)
    } else {
        peek_inline(buf)
    }
}

#[allow(clippy::type_complexity)]
fn peek_multibulk(buf: &[u8]) -> Result<Option<(Option<Vec<Bytes>>, usize)>, DecodeError> {
    let Some(eol) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let count =
        parse_line_i64(&buf[1..eol]).map_err(|_| DecodeError::InvalidMultibulkLength)?;
    if count > MAX_ARRAY_ELEMENTS {
        return Err(DecodeError::InvalidMultibulkLength);
    }
    let mut pos = eol + 2;
    if count <= 0 {
        // "*0" and null arrays on the request side are no-ops.
        return Ok(Some((None, pos)));
    }

    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] != b'$' {
            return Err(DecodeError::ExpectedBulkHeader(buf[pos]));
        }
        let Some(eol) = find_crlf(buf, pos) else {
            return Ok(None);
        };
        let len = parse_line_i64(&buf[pos + 1..eol])
            .map_err(|_| DecodeError::InvalidBulkLength)?;
        if !(0..=MAX_BULK_LENGTH).contains(&len) {
            return Err(DecodeError::InvalidBulkLength);
        }
        let data_start = eol + 2;
        let data_end = data_start + len as usize;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(DecodeError::InvalidBulkLength);
        }
        args.push(Bytes::copy_from_slice(&buf[data_start..data_end]));
        pos = data_end + 2;
    }
    Ok(Some((Some(args), pos)))
}

#[allow(clippy::type_complexity)]
fn peek_inline(buf: &[u8]) -> Result<Option<(Option<Vec<Bytes>>, usize)>, DecodeError> {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_INLINE_LENGTH {
            return Err(DecodeError::InlineTooLong);
        }
        return Ok(None);
    };
    if nl > MAX_INLINE_LENGTH {
        return Err(DecodeError::InlineTooLong);
    }
    let line = &buf[..nl];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let args: Vec<Bytes> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|tok| !tok.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();
    let consumed = nl + 1;
    if args.is_empty() {
        Ok(Some((None, consumed)))
    } else {
        Ok(Some((Some(args), consumed)))
    }
}

/// Does `buf` hold at least one complete request frame?
///
/// This is the pipeline's drain predicate: the connection handler keeps
/// executing as long as this is true and never issues a read that could
/// block while a parsed request is already sitting in the buffer.
pub fn has_complete_request(buf: &[u8]) -> bool {
    let mut offset = 0;
    // Skip leading blank frames so a stray "\r\n" between pipelined
    // commands doesn't read as "nothing available".
    loop {
        match peek_request(&buf[offset..]) {
            Ok(Some((Some(_), _))) => return true,
            Ok(Some((None, consumed))) => offset += consumed,
            Ok(None) => return false,
            // A malformed frame still needs the pipeline's attention.
            Err(_) => return true,
        }
    }
}

/// Consume one request from `src`, skipping blank frames. `Ok(None)` means
/// the buffer does not yet hold a complete request.
pub fn decode_request(src: &mut BytesMut) -> Result<Option<Request>, DecodeError> {
    loop {
        match peek_request(src)? {
            Some((Some(args), consumed)) => {
                src.advance(consumed);
                return Ok(Some(Request(args)));
            }
            Some((None, consumed)) => {
                src.advance(consumed);
            }
            None => return Ok(None),
        }
    }
}

/// Attempt to read one reply value at the front of `buf` without consuming.
fn peek_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let Some(eol) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let line = &buf[1..eol];
    let after_line = eol + 2;
    match buf[0] {
        b'+' => Ok(Some((
            RespValue::Simple(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b'-' => Ok(Some((
            RespValue::Error(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b':' => Ok(Some((RespValue::Integer(parse_line_i64(line)?), after_line))),
        b'$' => {
            let len = parse_line_i64(line).map_err(|_| DecodeError::InvalidBulkLength)?;
            if len < 0 {
                return Ok(Some((RespValue::NullBulk, after_line)));
            }
            if len > MAX_BULK_LENGTH {
                return Err(DecodeError::InvalidBulkLength);
            }
            let data_end = after_line + len as usize;
            if buf.len() < data_end + 2 {
                return Ok(None);
            }
            Ok(Some((
                RespValue::Bulk(Bytes::copy_from_slice(&buf[after_line..data_end])),
                data_end + 2,
            )))
        }
        b'*' => {
            let count =
                parse_line_i64(line).map_err(|_| DecodeError::InvalidMultibulkLength)?;
            if count < 0 {
                return Ok(Some((RespValue::NullArray, after_line)));
            }
            if count > MAX_ARRAY_ELEMENTS {
                return Err(DecodeError::InvalidMultibulkLength);
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut pos = after_line;
            for _ in 0..count {
                match peek_value(&buf[pos..])? {
                    Some((item, consumed)) => {
                        items.push(item);
                        pos += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), pos)))
        }
        other => Err(DecodeError::ExpectedBulkHeader(other)),
    }
}

/// Consume one reply value from `src`. Used on the replica side of a
/// replication link, where the peer speaks in replies rather than requests.
pub fn decode_value(src: &mut BytesMut) -> Result<Option<RespValue>, DecodeError> {
    match peek_value(src)? {
        Some((value, consumed)) => {
            src.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Encode `args` as the canonical multibulk request framing. This is the
/// normalized form used for AOF appends and replication propagation.
pub fn encode_command(args: &[Bytes], dst: &mut BytesMut) {
    RespValue::Array(args.iter().cloned().map(RespValue::Bulk).collect()).put(dst);
}

/// Framing codec for one client connection: decodes requests, encodes
/// replies.
#[derive(Debug, Default)]
pub struct RequestCodec;

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, DecodeError> {
        decode_request(src)
    }
}

impl Encoder<RespValue> for RequestCodec {
    type Error = DecodeError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), DecodeError> {
        item.put(dst);
        Ok(())
    }
}


#[cfg(test)]
mod props {
    use super::*;
    use test_strategy::proptest;

    fn encode(args: &[Vec<u8>]) -> BytesMut {
        let owned: Vec<Bytes> = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
        let mut buf = BytesMut::new();
        encode_command(&owned, &mut buf);
        buf
    }

    /// Any binary-safe argument vector survives the wire intact.
    #[proptest]
    fn multibulk_round_trips(
        #[strategy(proptest::collection::vec(
            proptest::collection::vec(proptest::num::u8::ANY, 0..32),
            1..8,
        ))]
        args: Vec<Vec<u8>>,
    ) {
        let mut buf = encode(&args);
        let decoded = decode_request(&mut buf).unwrap().unwrap();
        let expected: Vec<Bytes> = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
        assert_eq!(decoded.0, expected);
        assert!(buf.is_empty());
    }

    /// Every strict prefix of one frame is "not enough data", never an
    /// error and never a bogus parse — and consumes nothing.
    #[proptest]
    fn prefixes_are_incomplete(
        #[strategy(proptest::collection::vec(
            proptest::collection::vec(proptest::num::u8::ANY, 0..16),
            1..5,
        ))]
        args: Vec<Vec<u8>>,
        #[strategy(0.0f64..1.0)] cut: f64,
    ) {
        let full = encode(&args);
        let cut = ((full.len() as f64) * cut) as usize;
        let mut buf = BytesMut::from(&full[..cut]);
        assert_eq!(decode_request(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), cut);
        assert!(!has_complete_request(&full[..cut]));
    }
}
