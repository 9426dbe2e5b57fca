//! Master/replica replication for Carmine.
//!
//! The [`ReplicationManager`] implements the server core's
//! [`ReplicationService`] seam. In the master role it tracks connected
//! replicas, appends every propagated command to the circular [`backlog`],
//! and serves `PSYNC` with either a full RDB transfer or a backlog tail.
//! In the replica role it runs the handshake/ingest/apply loop in
//! [`replica`] and remembers its position so a reconnect can try partial
//! resync first.
//!
//! Full resync is made exact by the processor's snapshot callback: a
//! syncing replica buffers propagated commands, and the callback (which
//! runs on the processor thread, ordered with propagation) clears the
//! buffer at the snapshot boundary — everything cleared is already inside
//! the RDB image, everything buffered after is not.

pub mod backlog;
mod replica;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use carmine_errors::{internal_err, CarmineResult};
use carmine_server::repl::{new_replication_id, ReplicationService, Role};
use carmine_server::Server;
use parking_lot::Mutex;
use resp_srv::RespValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use backlog::Backlog;

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// The port this instance serves clients on; sent to the master
    /// during the handshake.
    pub listening_port: u16,
    pub backlog_capacity: usize,
    /// Cadence of `REPLCONF ACK` while streaming from a master.
    pub ack_interval: Duration,
    /// Pause between reconnect attempts after the master link drops.
    pub reconnect_backoff: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            listening_port: 6379,
            backlog_capacity: backlog::DEFAULT_CAPACITY,
            ack_interval: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Syncing,
    Online,
}

struct ReplicaHandle {
    out: mpsc::UnboundedSender<Bytes>,
    state: LinkState,
    /// Commands propagated while the RDB transfer is in flight.
    buffered: Vec<Bytes>,
    /// Master offset at the snapshot boundary; what FULLRESYNC reports.
    sync_offset: u64,
    acked_offset: u64,
    listening_port: Option<u16>,
    capabilities: Vec<String>,
}

struct MasterLink {
    host: String,
    port: u16,
    task: JoinHandle<()>,
    up: bool,
}

struct State {
    role: Role,
    replication_id: String,
    master_offset: u64,
    backlog: Backlog,
    replicas: std::collections::HashMap<u64, ReplicaHandle>,
    /// `REPLCONF listening-port` arrives before `PSYNC` on the same
    /// connection; parked here until the replica registers.
    pending_ports: std::collections::HashMap<u64, u16>,
    master_link: Option<MasterLink>,
    /// Resume state for partial resync after a disconnect.
    saved_master_id: Option<String>,
    replica_offset: u64,
}

pub struct ReplicationManager {
    server: Server,
    config: ReplicationConfig,
    state: Mutex<State>,
    self_ref: OnceLock<Weak<ReplicationManager>>,
}

impl ReplicationManager {
    /// Build the manager and install it into the server's write fan-out.
    pub fn install(server: Server, config: ReplicationConfig) -> Arc<Self> {
        let manager = Arc::new(ReplicationManager {
            server: server.clone(),
            state: Mutex::new(State {
                role: Role::Master,
                replication_id: new_replication_id(),
                master_offset: 0,
                backlog: Backlog::new(config.backlog_capacity),
                replicas: Default::default(),
                pending_ports: Default::default(),
                master_link: None,
                saved_master_id: None,
                replica_offset: 0,
            }),
            config,
            self_ref: OnceLock::new(),
        });
        let _ = manager.self_ref.set(Arc::downgrade(&manager));
        server.set_replication(manager.clone());
        manager
    }

    fn strong_self(&self) -> Option<Arc<ReplicationManager>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    pub(crate) fn server(&self) -> &Server {
        &self.server
    }

    pub(crate) fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub(crate) fn current_role(&self) -> Role {
        self.state.lock().role
    }

    /// The (id, offset) pair to present in `PSYNC`; `("?", -1)` when no
    /// history has been tracked yet.
    pub(crate) fn saved_position(&self) -> (String, i64) {
        let state = self.state.lock();
        match &state.saved_master_id {
            Some(id) => (id.clone(), state.replica_offset as i64),
            None => ("?".into(), -1),
        }
    }

    pub(crate) fn adopt_master_history(&self, id: String, offset: u64) {
        let mut state = self.state.lock();
        state.replication_id = id.clone();
        state.saved_master_id = Some(id);
        state.replica_offset = offset;
    }

    pub(crate) fn advance_replica_offset(&self, bytes: u64) -> u64 {
        let mut state = self.state.lock();
        state.replica_offset += bytes;
        state.replica_offset
    }

    pub(crate) fn replica_offset(&self) -> u64 {
        self.state.lock().replica_offset
    }

    pub(crate) fn set_link_up(&self, up: bool) {
        if let Some(link) = self.state.lock().master_link.as_mut() {
            link.up = up;
        }
    }

    fn remove_dead_replicas(state: &mut State, dead: Vec<u64>) {
        for id in dead {
            warn!(replica = id, "replica link failed, dropping");
            state.replicas.remove(&id);
        }
    }
}

#[async_trait]
impl ReplicationService for ReplicationManager {
    fn role(&self) -> Role {
        self.current_role()
    }

    fn info_section(&self) -> String {
        let state = self.state.lock();
        match state.role {
            Role::Master => {
                let mut out = format!(
                    "role:master\r\nconnected_slaves:{}\r\n",
                    state.replicas.len()
                );
                for (idx, handle) in state.replicas.values().enumerate() {
                    out.push_str(&format!(
                        "slave{idx}:port={},state={},offset={}\r\n",
                        handle.listening_port.unwrap_or(0),
                        match handle.state {
                            LinkState::Syncing => "sync_in_progress",
                            LinkState::Online => "online",
                        },
                        handle.acked_offset,
                    ));
                }
                out.push_str(&format!(
                    "master_replid:{}\r\nmaster_repl_offset:{}\r\n",
                    state.replication_id, state.master_offset
                ));
                out
            }
            Role::Replica => {
                let (host, port, up) = match &state.master_link {
                    Some(link) => (link.host.as_str(), link.port, link.up),
                    None => ("", 0, false),
                };
                format!(
                    "role:slave\r\nmaster_host:{host}\r\nmaster_port:{port}\r\n\
                     master_link_status:{}\r\nslave_repl_offset:{}\r\n\
                     master_replid:{}\r\n",
                    if up { "up" } else { "down" },
                    state.replica_offset,
                    state.replication_id,
                )
            }
        }
    }

    fn handle_replconf(&self, client_id: u64, args: &[Bytes]) -> Option<RespValue> {
        let Some(subcommand) = args.first() else {
            return Some(RespValue::Error(
                "ERR wrong number of arguments for 'replconf' command".into(),
            ));
        };
        match subcommand.to_ascii_lowercase().as_slice() {
            b"listening-port" => {
                let port = args
                    .get(1)
                    .and_then(|p| std::str::from_utf8(p).ok())
                    .and_then(|p| p.parse::<u16>().ok());
                if let Some(port) = port {
                    let mut state = self.state.lock();
                    match state.replicas.get_mut(&client_id) {
                        Some(handle) => handle.listening_port = Some(port),
                        None => {
                            state.pending_ports.insert(client_id, port);
                        }
                    }
                }
                Some(RespValue::ok())
            }
            b"capa" => {
                let capabilities: Vec<String> = args[1..]
                    .iter()
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .collect();
                if let Some(handle) = self.state.lock().replicas.get_mut(&client_id) {
                    handle.capabilities = capabilities;
                }
                Some(RespValue::ok())
            }
            b"ack" => {
                let offset = args
                    .get(1)
                    .and_then(|o| std::str::from_utf8(o).ok())
                    .and_then(|o| o.parse::<u64>().ok());
                if let Some(offset) = offset {
                    if let Some(handle) = self.state.lock().replicas.get_mut(&client_id) {
                        handle.acked_offset = offset;
                    }
                }
                // ACK is one-way; nothing goes back on the wire.
                None
            }
            _ => Some(RespValue::ok()),
        }
    }

    async fn handle_psync(
        &self,
        client_id: u64,
        args: &[Bytes],
        out: mpsc::UnboundedSender<Bytes>,
    ) -> CarmineResult<()> {
        let requested_id = args
            .first()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .unwrap_or_else(|| "?".into());
        let requested_offset: i64 = args
            .get(1)
            .and_then(|o| std::str::from_utf8(o).ok())
            .and_then(|o| o.parse().ok())
            .unwrap_or(-1);

        // Partial resync: same history and the offset is still covered.
        {
            let mut state = self.state.lock();
            let listening_port = state.pending_ports.remove(&client_id);
            if requested_id == state.replication_id && requested_offset >= 0 {
                if let Some(tail) = state.backlog.get_range(requested_offset as u64) {
                    info!(
                        replica = client_id,
                        offset = requested_offset,
                        "serving partial resync"
                    );
                    out.send(Bytes::from_static(b"+CONTINUE\r\n"))
                        .map_err(|_| internal_err!("replica link closed during psync"))?;
                    if !tail.is_empty() {
                        out.send(Bytes::from(tail))
                            .map_err(|_| internal_err!("replica link closed during psync"))?;
                    }
                    state.replicas.insert(
                        client_id,
                        ReplicaHandle {
                            out,
                            state: LinkState::Online,
                            buffered: Vec::new(),
                            sync_offset: requested_offset as u64,
                            acked_offset: requested_offset as u64,
                            listening_port,
                            capabilities: Vec::new(),
                        },
                    );
                    return Ok(());
                }
            }
            // Full resync: register as syncing so propagated commands
            // buffer while the snapshot is produced.
            info!(replica = client_id, "serving full resync");
            let master_offset = state.master_offset;
            state.replicas.insert(
                client_id,
                ReplicaHandle {
                    out,
                    state: LinkState::Syncing,
                    buffered: Vec::new(),
                    sync_offset: master_offset,
                    acked_offset: 0,
                    listening_port,
                    capabilities: Vec::new(),
                },
            );
        }

        // Taking the snapshot fires `on_snapshot_taken` on the processor
        // thread, which clears this replica's buffer at the exact boundary
        // and stamps the offset the RDB image corresponds to.
        let rdb = self.server.rdb_image().await?;

        let mut state = self.state.lock();
        let replication_id = state.replication_id.clone();
        let failed = {
            let Some(handle) = state.replicas.get_mut(&client_id) else {
                return Err(internal_err!("replica vanished during full resync"));
            };
            let header = format!("+FULLRESYNC {} {}\r\n", replication_id, handle.sync_offset);
            let mut payload = bytes::BytesMut::new();
            payload.extend_from_slice(header.as_bytes());
            payload.extend_from_slice(format!("${}\r\n", rdb.len()).as_bytes());
            payload.extend_from_slice(&rdb);
            let mut failed = handle.out.send(payload.freeze()).is_err();
            for buffered in handle.buffered.drain(..) {
                if failed {
                    break;
                }
                failed = handle.out.send(buffered).is_err();
            }
            if !failed {
                handle.state = LinkState::Online;
            }
            failed
        };
        if failed {
            state.replicas.remove(&client_id);
            return Err(internal_err!("replica link closed during full resync"));
        }
        Ok(())
    }

    async fn handle_replicaof(&self, target: Option<(String, u16)>) -> RespValue {
        match target {
            Some((host, port)) => {
                let Some(manager) = self.strong_self() else {
                    return RespValue::Error("ERR replication manager shutting down".into());
                };
                let mut state = self.state.lock();
                if let Some(link) = state.master_link.take() {
                    link.task.abort();
                }
                state.role = Role::Replica;
                state.saved_master_id = None;
                state.replica_offset = 0;
                let task = tokio::spawn(replica::run(manager, host.clone(), port));
                state.master_link = Some(MasterLink { host, port, task, up: false });
                info!("replication role changed to replica");
                RespValue::ok()
            }
            None => {
                let mut state = self.state.lock();
                if let Some(link) = state.master_link.take() {
                    link.task.abort();
                }
                if state.role == Role::Replica {
                    // Promotion starts a fresh history.
                    state.role = Role::Master;
                    state.replication_id = new_replication_id();
                    state.master_offset = state.replica_offset;
                    info!("promoted to master");
                }
                RespValue::ok()
            }
        }
    }

    fn propagate(&self, encoded: Bytes) {
        let mut state = self.state.lock();
        if state.role != Role::Master {
            return;
        }
        state.backlog.append(&encoded);
        state.master_offset += encoded.len() as u64;
        let mut dead = Vec::new();
        for (&id, handle) in state.replicas.iter_mut() {
            match handle.state {
                LinkState::Online => {
                    if handle.out.send(encoded.clone()).is_err() {
                        dead.push(id);
                    }
                }
                LinkState::Syncing => handle.buffered.push(encoded.clone()),
            }
        }
        Self::remove_dead_replicas(&mut state, dead);
    }

    fn on_snapshot_taken(&self) {
        let mut state = self.state.lock();
        let offset = state.master_offset;
        for handle in state.replicas.values_mut() {
            if handle.state == LinkState::Syncing {
                debug!(offset, "snapshot boundary for syncing replica");
                handle.buffered.clear();
                handle.sync_offset = offset;
            }
        }
    }

    fn acked_replicas(&self) -> usize {
        let state = self.state.lock();
        state
            .replicas
            .values()
            .filter(|handle| {
                handle.state == LinkState::Online && handle.acked_offset >= state.master_offset
            })
            .count()
    }

    fn master_offset(&self) -> u64 {
        self.state.lock().master_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn propagate_appends_to_backlog_and_replicas() {
        let server = Server::builder().build();
        let manager = ReplicationManager::install(server, ReplicationConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .handle_psync(1, &[b("?"), b("-1")], tx)
            .await
            .unwrap();
        // Drain the FULLRESYNC header + empty RDB payload.
        let first = rx.recv().await.unwrap();
        assert!(first.starts_with(b"+FULLRESYNC "));

        let payload = Bytes::from_static(b"*1\r\n$4\r\nPING\r\n");
        manager.propagate(payload.clone());
        assert_eq!(manager.master_offset(), payload.len() as u64);
        assert_eq!(rx.recv().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn partial_resync_when_offset_in_backlog() {
        let server = Server::builder().build();
        let manager = ReplicationManager::install(server, ReplicationConfig::default());
        let replid = { manager.state.lock().replication_id.clone() };

        let payload = Bytes::from_static(b"*1\r\n$4\r\nPING\r\n");
        manager.propagate(payload.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .handle_psync(2, &[b(&replid), b("0")], tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"+CONTINUE\r\n"));
        assert_eq!(rx.recv().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn mismatched_id_falls_back_to_full_resync() {
        let server = Server::builder().build();
        let manager = ReplicationManager::install(server, ReplicationConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .handle_psync(3, &[b("0123456789abcdef0123456789abcdef01234567"), b("50")], tx)
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().starts_with(b"+FULLRESYNC "));
    }

    #[tokio::test]
    async fn ack_updates_replica_offset_without_reply() {
        let server = Server::builder().build();
        let manager = ReplicationManager::install(server, ReplicationConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.handle_psync(4, &[b("?"), b("-1")], tx).await.unwrap();

        assert_eq!(manager.handle_replconf(4, &[b("ack"), b("0")]), None);
        assert_eq!(manager.acked_replicas(), 1);

        manager.propagate(Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));
        assert_eq!(manager.acked_replicas(), 0);
        let offset = manager.master_offset();
        assert_eq!(
            manager.handle_replconf(4, &[b("ack"), b(&offset.to_string())]),
            None
        );
        assert_eq!(manager.acked_replicas(), 1);
    }

    #[tokio::test]
    async fn listening_port_parks_until_psync() {
        let server = Server::builder().build();
        let manager = ReplicationManager::install(server, ReplicationConfig::default());
        assert_eq!(
            manager.handle_replconf(5, &[b("listening-port"), b("7777")]),
            Some(RespValue::ok())
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.handle_psync(5, &[b("?"), b("-1")], tx).await.unwrap();
        let state = manager.state.lock();
        assert_eq!(state.replicas[&5].listening_port, Some(7777));
    }
}
