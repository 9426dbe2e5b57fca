use std::num::ParseIntError;
use std::str::Utf8Error;

use carmine_errors::CarmineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid multibulk length")]
    InvalidMultibulkLength,

    #[error("invalid bulk length")]
    InvalidBulkLength,

    #[error("expected '$', got '{}'", char::from(*.0))]
    ExpectedBulkHeader(u8),

    #[error("unbalanced quotes in request")]
    UnbalancedQuotes,

    #[error("too big inline request")]
    InlineTooLong,

    #[error("invalid length encoding: {0}")]
    BadLength(#[from] ParseIntError),

    #[error("non-utf8 header: {0}")]
    BadHeader(#[from] Utf8Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DecodeError> for CarmineError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(e) => CarmineError::Io(e),
            other => CarmineError::Protocol(other.to_string()),
        }
    }
}
