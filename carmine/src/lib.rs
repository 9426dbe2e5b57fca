//! The Carmine daemon: option parsing, wiring, and the accept loop.

mod sinks;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use carmine_replication::{ReplicationConfig, ReplicationManager};
use carmine_server::persistence::{AofSink, NoopAof};
use carmine_server::repl::ReplicationService;
use carmine_server::{serve_connection, Server};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

pub use sinks::{FileAof, FileSnapshotSink};

#[derive(Parser, Debug)]
#[command(name = "carmine", version, about = "An in-memory multi-structure key/value server")]
pub struct Options {
    /// Address to listen on.
    #[arg(long, short = 'a', env = "CARMINE_ADDRESS", default_value = "127.0.0.1:6379")]
    pub address: SocketAddr,

    /// Append every write to this file (AOF). Off when unset.
    #[arg(long, env = "CARMINE_APPENDONLY")]
    pub appendonly: Option<PathBuf>,

    /// Where BGSAVE writes its snapshot.
    #[arg(long, env = "CARMINE_DUMP_FILE", default_value = "dump.rdb")]
    pub dump_file: PathBuf,

    /// Where BGREWRITEAOF writes the rebuilt command stream.
    #[arg(long, env = "CARMINE_REWRITE_FILE", default_value = "rewrite.aof")]
    pub rewrite_file: PathBuf,

    /// Start as a replica of `HOST PORT`.
    #[arg(long, env = "CARMINE_REPLICAOF", value_name = "HOST PORT")]
    pub replicaof: Option<String>,
}

impl Options {
    fn replicaof_target(&self) -> anyhow::Result<Option<(String, u16)>> {
        let Some(raw) = &self.replicaof else {
            return Ok(None);
        };
        let mut parts = raw.split_ascii_whitespace();
        let host = parts.next().context("--replicaof needs 'HOST PORT'")?;
        let port = parts
            .next()
            .context("--replicaof needs 'HOST PORT'")?
            .parse::<u16>()
            .context("--replicaof port is not a number")?;
        Ok(Some((host.to_string(), port)))
    }
}

/// Bring the server up and serve until ctrl-c.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let aof: Arc<dyn AofSink> = match &options.appendonly {
        Some(path) => {
            let aof = FileAof::open(path)
                .await
                .with_context(|| format!("opening append-only file {}", path.display()))?;
            info!(path = %path.display(), "append-only file enabled");
            Arc::new(aof)
        }
        None => Arc::new(NoopAof),
    };

    let server = Server::builder()
        .aof_sink(aof)
        .snapshot_sink(Arc::new(FileSnapshotSink::new(
            options.dump_file.clone(),
            options.rewrite_file.clone(),
        )))
        .build();

    let listener = TcpListener::bind(options.address)
        .await
        .with_context(|| format!("binding {}", options.address))?;
    let local_addr = listener.local_addr()?;

    let manager = ReplicationManager::install(
        server.clone(),
        ReplicationConfig { listening_port: local_addr.port(), ..Default::default() },
    );
    if let Some((host, port)) = options.replicaof_target()? {
        info!(%host, port, "starting as replica");
        manager.handle_replicaof(Some((host, port))).await;
    }

    info!(%local_addr, "carmine listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        tokio::spawn(serve_connection(server.clone(), stream));
                    }
                    Err(err) => {
                        error!(%err, "accept failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    // Dropping the server lets the processor drain its queue and stop.
    Ok(())
}
