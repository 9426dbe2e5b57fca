use bytes::{BufMut, Bytes, BytesMut};

/// One RESP reply value.
///
/// Nulls get their own variants rather than `Option` wrapping: the null bulk
/// string (`$-1`) and null array (`*-1`) are distinct wire encodings with
/// distinct meanings (missing value vs. aborted transaction / timed-out
/// blocking pop), and collapsing them invites mixups at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    /// The canonical `+OK` reply.
    pub fn ok() -> Self {
        RespValue::Simple("OK".into())
    }

    pub fn bulk(bytes: impl Into<Bytes>) -> Self {
        RespValue::Bulk(bytes.into())
    }

    /// A bulk string from anything printable; used for numeric bulk replies
    /// like scores.
    pub fn bulk_from_display(value: impl ToString) -> Self {
        RespValue::Bulk(Bytes::from(value.to_string()))
    }

    /// Serialize this value onto `dst`.
    pub fn put(&self, dst: &mut BytesMut) {
        match self {
            RespValue::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Error(msg) => {
                dst.put_u8(b'-');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                dst.put_u8(b':');
                dst.put_slice(itoa(*n).as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Bulk(bytes) => {
                dst.put_u8(b'$');
                dst.put_slice(itoa(bytes.len() as i64).as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(bytes);
                dst.put_slice(b"\r\n");
            }
            RespValue::NullBulk => dst.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                dst.put_u8(b'*');
                dst.put_slice(itoa(items.len() as i64).as_bytes());
                dst.put_slice(b"\r\n");
                for item in items {
                    item.put(dst);
                }
            }
            RespValue::NullArray => dst.put_slice(b"*-1\r\n"),
        }
    }

    /// Serialize to a fresh buffer. Handy in tests and for the replication
    /// stream, where commands are encoded once and fanned out.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.put(&mut buf);
        buf.freeze()
    }
}

fn itoa(n: i64) -> String {
    n.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_every_kind() {
        assert_eq!(&*RespValue::ok().to_bytes(), b"+OK\r\n");
        assert_eq!(
            &*RespValue::Error("ERR syntax error".into()).to_bytes(),
            b"-ERR syntax error\r\n"
        );
        assert_eq!(&*RespValue::Integer(-7).to_bytes(), b":-7\r\n");
        assert_eq!(&*RespValue::bulk("hi").to_bytes(), b"$2\r\nhi\r\n");
        assert_eq!(&*RespValue::NullBulk.to_bytes(), b"$-1\r\n");
        assert_eq!(&*RespValue::NullArray.to_bytes(), b"*-1\r\n");
        assert_eq!(
            &*RespValue::Array(vec![RespValue::bulk("a"), RespValue::Integer(1)]).to_bytes(),
            b"*2\r\n$1\r\na\r\n:1\r\n"
        );
    }

    #[test]
    fn bulk_is_binary_safe() {
        let value = RespValue::bulk(&b"\x00\r\n\xff"[..]);
        assert_eq!(&*value.to_bytes(), b"$4\r\n\x00\r\n\xff\r\n");
    }
}
