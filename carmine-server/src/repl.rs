//! The seam between the server core and the replication manager.
//!
//! The core intercepts the handshake commands (`REPLCONF`, `PSYNC`,
//! `REPLICAOF`, `INFO replication`, `WAIT`) in the connection layer and
//! forwards them through this trait; the manager lives in its own crate and
//! is injected at wiring time. `propagate` is synchronous because the
//! processor calls it inline after each write — implementations must only
//! enqueue, never touch the network on the caller's thread.

use async_trait::async_trait;
use bytes::Bytes;
use carmine_errors::CarmineResult;
use resp_srv::RespValue;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "slave",
        }
    }
}

#[async_trait]
pub trait ReplicationService: Send + Sync + 'static {
    fn role(&self) -> Role;

    /// The replica read-only guard keys off this.
    fn is_replica(&self) -> bool {
        self.role() == Role::Replica
    }

    /// The body of `INFO replication`.
    fn info_section(&self) -> String;

    /// `REPLCONF listening-port|capa|ack|getack` from a connected peer.
    /// `None` means no reply goes on the wire (`REPLCONF ACK` is one-way).
    fn handle_replconf(&self, client_id: u64, args: &[Bytes]) -> Option<RespValue>;

    /// `PSYNC`: decide full vs partial resync and take over the
    /// connection's outgoing byte stream. After this returns `Ok`, the
    /// writer channel belongs to the replication manager; the connection
    /// keeps reading only to feed later `REPLCONF ACK`s back in.
    async fn handle_psync(
        &self,
        client_id: u64,
        args: &[Bytes],
        out: mpsc::UnboundedSender<Bytes>,
    ) -> CarmineResult<()>;

    /// `REPLICAOF host port` / `REPLICAOF NO ONE`.
    async fn handle_replicaof(&self, target: Option<(String, u16)>) -> RespValue;

    /// Called by the processor after every successful write while in the
    /// master role, with the command already RESP-encoded. Must not block.
    fn propagate(&self, encoded: Bytes);

    /// Called by the processor immediately after it takes a snapshot, on
    /// the processor task itself. Because propagation and this callback
    /// run on the same thread in execution order, a full-resync
    /// implementation can use it to mark exactly which buffered commands
    /// the snapshot already contains.
    fn on_snapshot_taken(&self) {}

    /// Number of replicas whose acked offset has reached the master
    /// offset; the cheap form of `WAIT`.
    fn acked_replicas(&self) -> usize;

    fn master_offset(&self) -> u64;
}

/// Standalone behavior when no replication manager is wired in: a plain
/// master that drops propagation on the floor.
#[derive(Debug, Default)]
pub struct NoReplication;

#[async_trait]
impl ReplicationService for NoReplication {
    fn role(&self) -> Role {
        Role::Master
    }

    fn info_section(&self) -> String {
        "role:master\r\nconnected_slaves:0\r\nmaster_repl_offset:0\r\n".into()
    }

    fn handle_replconf(&self, _client_id: u64, _args: &[Bytes]) -> Option<RespValue> {
        Some(RespValue::ok())
    }

    async fn handle_psync(
        &self,
        _client_id: u64,
        _args: &[Bytes],
        _out: mpsc::UnboundedSender<Bytes>,
    ) -> CarmineResult<()> {
        Err(carmine_errors::internal_err!("replication is not enabled"))
    }

    async fn handle_replicaof(&self, _target: Option<(String, u16)>) -> RespValue {
        RespValue::Error("ERR replication is not enabled".into())
    }

    fn propagate(&self, _encoded: Bytes) {}

    fn acked_replicas(&self) -> usize {
        0
    }

    fn master_offset(&self) -> u64 {
        0
    }
}

/// Generate the 40-character lowercase hex id that names a replication
/// history.
pub fn new_replication_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..40)
        .map(|_| {
            let nibble: u8 = rng.random_range(0..16);
            char::from_digit(u32::from(nibble), 16).unwrap_or('0')
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_ids_are_40_hex_chars() {
        let id = new_replication_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_replication_id());
    }

    #[test]
    fn role_strings() {
        assert_eq!(Role::Master.as_str(), "master");
        assert_eq!(Role::Replica.as_str(), "slave");
    }
}
