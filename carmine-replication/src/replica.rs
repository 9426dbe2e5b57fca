//! The replica side of the link: handshake, RDB ingest, streaming apply.
//!
//! One task per master link. It reconnects with a backoff after any
//! failure, offering the saved (replication id, offset) so the master can
//! serve a partial resync; when the backlog no longer covers the offset
//! the master answers FULLRESYNC and the replica rebuilds from scratch.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use carmine_errors::{internal_err, CarmineError, CarmineResult};
use carmine_server::persistence::rdb_entry_to_commands;
use carmine_server::repl::Role;
use resp_srv::{decode_request, decode_value, encode_command, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::ReplicationManager;

/// Run the master link until the role changes. Spawned by `REPLICAOF`.
pub(crate) async fn run(manager: Arc<ReplicationManager>, host: String, port: u16) {
    loop {
        if manager.current_role() != Role::Replica {
            break;
        }
        match sync_once(&manager, &host, port).await {
            Ok(()) => debug!("master link closed cleanly"),
            Err(err) => warn!(%err, host, port, "master link failed"),
        }
        manager.set_link_up(false);
        if manager.current_role() != Role::Replica {
            break;
        }
        tokio::time::sleep(manager.config().reconnect_backoff).await;
    }
    debug!("replica loop exiting");
}

struct Link {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    buf: BytesMut,
}

impl Link {
    async fn send(&mut self, parts: &[&[u8]]) -> CarmineResult<()> {
        let args: Vec<Bytes> = parts.iter().map(|p| Bytes::copy_from_slice(p)).collect();
        let mut out = BytesMut::new();
        encode_command(&args, &mut out);
        self.write.write_all(&out).await?;
        Ok(())
    }

    async fn recv_value(&mut self) -> CarmineResult<RespValue> {
        loop {
            if let Some(value) = decode_value(&mut self.buf)? {
                return Ok(value);
            }
            if self.read.read_buf(&mut self.buf).await? == 0 {
                return Err(internal_err!("master closed the connection"));
            }
        }
    }

    async fn expect_simple(&mut self, expected: &str) -> CarmineResult<()> {
        match self.recv_value().await? {
            RespValue::Simple(s) if s.eq_ignore_ascii_case(expected) => Ok(()),
            other => Err(internal_err!("handshake expected +{expected}, got {other:?}")),
        }
    }

    /// Read the `$<len>\r\n<bytes>` RDB payload; unlike a bulk string
    /// there is no trailing CRLF.
    async fn recv_rdb(&mut self) -> CarmineResult<Bytes> {
        let header_end = loop {
            if let Some(idx) = self.buf.windows(2).position(|w| w == b"\r\n") {
                break idx;
            }
            if self.read.read_buf(&mut self.buf).await? == 0 {
                return Err(internal_err!("master closed before sending the snapshot"));
            }
        };
        let header = self.buf.split_to(header_end + 2);
        if header.first() != Some(&b'$') {
            return Err(internal_err!("expected RDB bulk header"));
        }
        let len: usize = std::str::from_utf8(&header[1..header.len() - 2])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| internal_err!("bad RDB length header"))?;
        while self.buf.len() < len {
            if self.read.read_buf(&mut self.buf).await? == 0 {
                return Err(internal_err!("master closed mid-snapshot"));
            }
        }
        Ok(self.buf.split_to(len).freeze())
    }
}

async fn sync_once(manager: &Arc<ReplicationManager>, host: &str, port: u16) -> CarmineResult<()> {
    let stream = TcpStream::connect((host, port)).await?;
    let (read, write) = stream.into_split();
    let mut link = Link { read, write, buf: BytesMut::with_capacity(64 * 1024) };

    // The handshake is a fixed sequence.
    link.send(&[&b"PING"[..]]).await?;
    link.expect_simple("PONG").await?;
    let port_arg = manager.config().listening_port.to_string();
    link.send(&[&b"REPLCONF"[..], b"listening-port", port_arg.as_bytes()])
        .await?;
    link.expect_simple("OK").await?;
    link.send(&[&b"REPLCONF"[..], b"capa", b"psync2"]).await?;
    link.expect_simple("OK").await?;

    let (saved_id, saved_offset) = manager.saved_position();
    link.send(&[&b"PSYNC"[..], saved_id.as_bytes(), saved_offset.to_string().as_bytes()])
        .await?;

    match link.recv_value().await? {
        RespValue::Simple(reply) if reply.starts_with("FULLRESYNC") => {
            let mut parts = reply.split_ascii_whitespace();
            parts.next();
            let master_id = parts
                .next()
                .ok_or_else(|| internal_err!("FULLRESYNC missing replication id"))?
                .to_string();
            let offset: u64 = parts
                .next()
                .and_then(|o| o.parse().ok())
                .ok_or_else(|| internal_err!("FULLRESYNC missing offset"))?;

            let rdb = link.recv_rdb().await?;
            ingest_snapshot(manager, &rdb).await?;
            manager.adopt_master_history(master_id, offset);
            info!(offset, "full resync complete");
        }
        RespValue::Simple(reply) if reply.starts_with("CONTINUE") => {
            info!(offset = saved_offset, "partial resync accepted");
        }
        other => return Err(internal_err!("unexpected PSYNC reply: {other:?}")),
    }

    manager.set_link_up(true);
    stream_commands(manager, &mut link).await
}

/// Verify and replay a full RDB image, replacing the local dataset.
async fn ingest_snapshot(manager: &Arc<ReplicationManager>, rdb: &[u8]) -> CarmineResult<()> {
    let entries = carmine_rdb::decode(rdb)
        .map_err(|err| internal_err!("snapshot rejected: {err}"))?;
    let server = manager.server();
    server.execute("FLUSHALL", &[]).await?;
    for entry in &entries {
        for command in rdb_entry_to_commands(entry) {
            apply(manager, &command).await;
        }
    }
    debug!(keys = entries.len(), "snapshot ingested");
    Ok(())
}

/// The streaming loop: parse each arriving command, apply it through the
/// processor, advance the offset by the bytes consumed, and ack once a
/// second.
async fn stream_commands(
    manager: &Arc<ReplicationManager>,
    link: &mut Link,
) -> CarmineResult<()> {
    let ack_interval = manager.config().ack_interval;
    let mut next_ack = tokio::time::Instant::now() + ack_interval;
    loop {
        // Race the socket read against the ack deadline. The timeout owns
        // the read future, so the link is free again in either branch.
        match tokio::time::timeout_at(next_ack, link.read.read_buf(&mut link.buf)).await {
            Err(_) => {
                send_ack(manager, link).await?;
                next_ack = tokio::time::Instant::now() + ack_interval;
                continue;
            }
            Ok(read) => {
                if read? == 0 {
                    // Keep the saved position; the reconnect attempts a
                    // partial resync from here.
                    return Err(CarmineError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "master link dropped",
                    )));
                }
            }
        }
        loop {
            let before = link.buf.len();
            let Some(request) = decode_request(&mut link.buf)? else {
                break;
            };
            let consumed = (before - link.buf.len()) as u64;
            let name = request.name();
            if name == "REPLCONF"
                && request.args().first().map(|a| a.eq_ignore_ascii_case(b"GETACK")) == Some(true)
            {
                manager.advance_replica_offset(consumed);
                send_ack(manager, link).await?;
                continue;
            }
            apply_request(manager, &name, request.args()).await;
            manager.advance_replica_offset(consumed);
        }
    }
}

async fn send_ack(manager: &Arc<ReplicationManager>, link: &mut Link) -> CarmineResult<()> {
    let offset = manager.replica_offset().to_string();
    link.send(&[&b"REPLCONF"[..], b"ACK", offset.as_bytes()]).await
}

async fn apply(manager: &Arc<ReplicationManager>, command: &[Bytes]) {
    let Some((name, args)) = command.split_first() else {
        return;
    };
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();
    apply_request(manager, &name, args).await;
}

/// Replayed commands bypass the read-only guard by entering the server
/// directly rather than through a client connection.
async fn apply_request(manager: &Arc<ReplicationManager>, name: &str, args: &[Bytes]) {
    if let Err(err) = manager.server().execute(name, args).await {
        // Local trouble applying the stream is logged, never sent back.
        warn!(%err, command = name, "failed to apply replicated command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReplicationConfig, ReplicationManager};
    use carmine_server::repl::ReplicationService;
    use carmine_server::{serve_connection, Server};
    use tokio::net::TcpListener;

    async fn start_master() -> (Server, std::net::SocketAddr) {
        let server = Server::builder().build();
        ReplicationManager::install(server.clone(), ReplicationConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_server = server.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(accept_server.clone(), stream));
                    }
                    Err(_) => break,
                }
            }
        });
        (server, addr)
    }

    async fn get(server: &Server, key: &str) -> RespValue {
        server
            .execute("GET", &[Bytes::copy_from_slice(key.as_bytes())])
            .await
            .unwrap()
            .reply
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_resync_then_streaming() {
        let (master, master_addr) = start_master().await;

        // Seed the master before the replica attaches.
        master
            .execute("SET", &[Bytes::from("seeded"), Bytes::from("yes")])
            .await
            .unwrap();

        let replica = Server::builder().build();
        let manager =
            ReplicationManager::install(replica.clone(), ReplicationConfig::default());
        manager
            .handle_replicaof(Some((master_addr.ip().to_string(), master_addr.port())))
            .await;

        // The replica ingests the snapshot...
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if get(&replica, "seeded").await == RespValue::bulk("yes") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("replica never ingested the snapshot");

        // ...and then follows the live stream.
        master
            .execute("SET", &[Bytes::from("live"), Bytes::from("1")])
            .await
            .unwrap();
        master
            .execute("INCR", &[Bytes::from("live")])
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if get(&replica, "live").await == RespValue::bulk("2") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("replica never applied the stream");

        // The replica acks its progress back to the master.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if master.replication().acked_replicas() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("master never saw the replica ack");

        assert!(replica.replication().is_replica());
        let info = replica.info_string(Some("replication"));
        assert!(info.contains("role:slave"), "{info}");
        assert!(info.contains("master_link_status:up"), "{info}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replica_rejects_client_writes() {
        let (_master, master_addr) = start_master().await;

        let replica = Server::builder().build();
        let manager =
            ReplicationManager::install(replica.clone(), ReplicationConfig::default());
        manager
            .handle_replicaof(Some((master_addr.ip().to_string(), master_addr.port())))
            .await;

        // Serve the replica over TCP and try to write to it as a client.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let replica_addr = listener.local_addr().unwrap();
        let accept_server = replica.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(accept_server.clone(), stream));
                    }
                    Err(_) => break,
                }
            }
        });

        let mut stream = TcpStream::connect(replica_addr).await.unwrap();
        let mut out = BytesMut::new();
        encode_command(
            &[Bytes::from("SET"), Bytes::from("k"), Bytes::from("v")],
            &mut out,
        );
        stream.write_all(&out).await.unwrap();
        let mut buf = BytesMut::new();
        let reply = loop {
            if let Some(value) = decode_value(&mut buf).unwrap() {
                break value;
            }
            assert!(stream.read_buf(&mut buf).await.unwrap() > 0);
        };
        match reply {
            RespValue::Error(msg) => assert!(msg.starts_with("READONLY"), "{msg}"),
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn promotion_restores_writes() {
        let (_master, master_addr) = start_master().await;
        let replica = Server::builder().build();
        let manager =
            ReplicationManager::install(replica.clone(), ReplicationConfig::default());
        manager
            .handle_replicaof(Some((master_addr.ip().to_string(), master_addr.port())))
            .await;
        assert!(replica.replication().is_replica());

        manager.handle_replicaof(None).await;
        assert!(!replica.replication().is_replica());
        let info = replica.info_string(Some("replication"));
        assert!(info.contains("role:master"), "{info}");
    }
}
