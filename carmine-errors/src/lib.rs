//! Error types shared across the Carmine workspace.
//!
//! [`CarmineError`] covers every error a client can observe on the wire plus
//! the internal conditions the server recovers from locally. The `Display`
//! impl of each client-facing variant is exactly the RESP error payload
//! (including the `ERR` / `WRONGTYPE` / `READONLY` prefix), so the codec can
//! emit `-{error}\r\n` without further formatting.

use std::io;

use thiserror::Error;

/// Convenient alias for fallible operations in this workspace.
pub type CarmineResult<T> = Result<T, CarmineError>;

#[derive(Debug, Error)]
pub enum CarmineError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR value is not a valid float")]
    NotAFloat,

    #[error("ERR increment or decrement would overflow")]
    IntegerOverflow,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR bit is not an integer or out of range")]
    BitOutOfRange,

    #[error("ERR bit offset is not an integer or out of range")]
    BitOffsetOutOfRange,

    #[error("ERR BITOP NOT must be called with a single source key")]
    BitopNotSingleSource,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpireTime(String),

    #[error("ERR error rate must be between 0 and 1")]
    BloomErrorRate,

    #[error("ERR capacity must be larger than 0")]
    BloomCapacity,

    #[error("ERR item exists")]
    BloomItemExists,

    #[error("WRONGTYPE Key is not a valid HyperLogLog string value.")]
    NotHyperLogLog,

    #[error("ERR HyperLogLog precision mismatch")]
    HllPrecisionMismatch,

    #[error("ERR invalid longitude,latitude pair {0:.6},{1:.6}")]
    InvalidCoordinates(f64, f64),

    #[error("ERR unsupported unit provided. please use m, km, ft, mi")]
    InvalidGeoUnit,

    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,

    #[error("ERR WATCH inside MULTI is not allowed")]
    WatchInsideMulti,

    #[error("ERR {0} is not allowed in transactions")]
    NotAllowedInTransactions(String),

    #[error("ERR command timeout")]
    CommandTimeout,

    #[error("ERR too many slow commands")]
    TooManySlowCommands,

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnlyReplica,

    #[error("NOSCRIPT No matching script. Please use EVAL.")]
    NoScript,

    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    /// Invariant violations inside the server. Never constructed directly;
    /// use [`internal_err!`](crate::internal_err).
    #[error("ERR internal error: {0}")]
    Internal(String),

    /// I/O failures on persistence or replication links. Logged and recovered
    /// locally, never rendered to the client that triggered the write.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CarmineError {
    /// Whether this error may be rendered to a client as a RESP error reply.
    ///
    /// I/O errors are infrastructure failures; surfacing their text on the
    /// wire would leak nothing useful and the triggering client is not at
    /// fault, so the connection layer logs them instead.
    pub fn is_client_visible(&self) -> bool {
        !matches!(self, CarmineError::Io(_))
    }
}

/// Construct a [`CarmineError::Internal`] from format arguments, capturing
/// the call site module path for log correlation.
#[macro_export]
macro_rules! internal_err {
    ($($format_args:tt)*) => {
        $crate::CarmineError::Internal(format!(
            "{}: {}",
            module_path!(),
            format_args!($($format_args)*),
        ))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_payloads_carry_resp_prefixes() {
        assert_eq!(
            CarmineError::WrongArity("get".into()).to_string(),
            "ERR wrong number of arguments for 'get' command"
        );
        assert_eq!(
            CarmineError::WrongType.to_string(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
        assert!(CarmineError::ReadOnlyReplica.to_string().starts_with("READONLY"));
    }

    #[test]
    fn io_errors_are_not_client_visible() {
        let err = CarmineError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!err.is_client_visible());
        assert!(CarmineError::Syntax.is_client_visible());
    }

    #[test]
    fn internal_err_includes_module_path() {
        let err = internal_err!("bad state {}", 42);
        assert!(matches!(err, CarmineError::Internal(ref s) if s.contains("bad state 42")));
    }
}
