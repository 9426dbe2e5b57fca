//! Server-side bindings for RESP, the line-oriented serialization protocol
//! spoken by Redis-compatible clients.
//!
//! The crate is deliberately small: a [`RespValue`] tree covering the five
//! reply kinds, an incremental request parser that understands both the
//! canonical multibulk framing and inline commands, and [`tokio_util`] codec
//! impls so a connection can be driven through `Framed`.
//!
//! Parsing is strictly non-blocking: every decode entry point either consumes
//! one complete frame from the buffer or consumes nothing and reports "not
//! enough data", which lets the connection pipeline drain pipelined requests
//! without ever risking a blocking read.

mod codec;
mod error;
mod value;

pub use codec::{
    decode_request, decode_value, encode_command, has_complete_request, RequestCodec,
    MAX_ARRAY_ELEMENTS, MAX_BULK_LENGTH, MAX_INLINE_LENGTH,
};
pub use error::DecodeError;
pub use value::RespValue;

use bytes::Bytes;

/// One client request: the command name followed by its arguments, each a
/// binary-safe byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request(pub Vec<Bytes>);

impl Request {
    /// The command name, uppercased for dispatch. Empty requests never make
    /// it out of the decoder.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.0[0]).to_ascii_uppercase()
    }

    /// Arguments after the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.0[1..]
    }
}
