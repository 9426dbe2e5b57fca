//! The Carmine server core.
//!
//! The crate wires the single-writer [`processor`] that owns the keyspace
//! to everything around it: the per-connection pipeline, the pub/sub
//! broker, optimistic transactions, blocking list operations, the slow log,
//! and the persistence/replication seams. The TCP accept loop, CLI, and
//! file writers live in the binary crate; replication's implementation
//! lives in its own crate behind [`repl::ReplicationService`].

pub mod blocking;
pub mod command;
pub mod connection;
pub mod glob;
pub mod keyspace;
pub mod persistence;
pub mod processor;
pub mod pubsub;
pub mod repl;
pub mod server;
pub mod slowlog;
pub mod txn;

pub use connection::serve_connection;
pub use server::{Server, ServerBuilder, ServerConfig};
