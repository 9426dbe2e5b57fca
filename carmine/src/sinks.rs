//! File-backed implementations of the server core's persistence contracts.
//!
//! The core only speaks [`AofSink`] and [`SnapshotSink`]; these adapters
//! put bytes on disk. AOF appends are handed to a dedicated writer task
//! through a channel so the processor thread never waits on the
//! filesystem.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use carmine_server::persistence::{AofSink, SnapshotSink};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Appends RESP-encoded write commands to an append-only file.
pub struct FileAof {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl FileAof {
    /// Open (creating or appending) the AOF and start its writer task.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<FileAof> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(err) = file.write_all(&chunk).await {
                    error!(%err, "append-only file write failed");
                    break;
                }
                if let Err(err) = file.flush().await {
                    error!(%err, "append-only file flush failed");
                    break;
                }
            }
        });
        Ok(FileAof { tx })
    }
}

impl AofSink for FileAof {
    fn append(&self, command: &[Bytes]) {
        let mut buf = BytesMut::new();
        resp_srv::encode_command(command, &mut buf);
        // A closed channel means the writer task died; the error was
        // already logged there.
        let _ = self.tx.send(buf.freeze());
    }
}

/// Writes background snapshots to stable paths, atomically via a rename.
pub struct FileSnapshotSink {
    rdb_path: PathBuf,
    rewrite_path: PathBuf,
}

impl FileSnapshotSink {
    pub fn new(rdb_path: PathBuf, rewrite_path: PathBuf) -> FileSnapshotSink {
        FileSnapshotSink { rdb_path, rewrite_path }
    }

    fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn write_rdb(&self, bytes: Bytes) -> io::Result<()> {
        Self::write_atomically(&self.rdb_path, &bytes)?;
        debug!(path = %self.rdb_path.display(), size = bytes.len(), "rdb snapshot written");
        Ok(())
    }

    fn write_aof_rewrite(&self, commands: &[Vec<Bytes>]) -> io::Result<()> {
        let mut buf = BytesMut::new();
        for command in commands {
            resp_srv::encode_command(command, &mut buf);
        }
        Self::write_atomically(&self.rewrite_path, &buf)?;
        debug!(path = %self.rewrite_path.display(), commands = commands.len(), "aof rewrite written");
        Ok(())
    }
}
