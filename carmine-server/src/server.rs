//! The assembled server core: processor plus the shared managers, and the
//! write fan-out that connects them.
//!
//! [`Server`] is the cheap-clone handle every connection task carries. It
//! owns wiring, not policy: commands execute in the processor, and the
//! after-write pass here only drives what cannot run inside it — waking
//! blocked list poppers, which itself submits pops back into the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use carmine_errors::CarmineResult;
use resp_srv::RespValue;
use tracing::{error, info, warn};

use crate::blocking::{BlockingManager, BlockingReplyStyle, WaiterSpec, FOREVER};
use crate::command::{Command, ExecOutcome, ListEnd};
use crate::keyspace::Keyspace;
use crate::persistence::{
    snapshot_to_commands, snapshot_to_rdb, AofSink, NoopAof, NoopSnapshotSink, SnapshotSink,
};
use crate::processor::{self, ProcessorHandle, WriteHooks};
use crate::pubsub::PubSubBroker;
use crate::repl::{NoReplication, ReplicationService};
use crate::slowlog::SlowLog;
use crate::txn::{QueuedCommand, WatchIndex};

/// Knobs of the connection pipeline and admin surfaces.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Idle read deadline for normal-mode connections.
    pub idle_timeout: Duration,
    /// Per-command execution deadline; expiry disconnects the client.
    pub command_timeout: Duration,
    /// Pipelined commands drained before a flush.
    pub pipeline_max_commands: usize,
    /// Short wait for in-flight pipeline bytes before flushing.
    pub pipeline_wait: Duration,
    /// Latency above which a command enters the slow log.
    pub slowlog_threshold: Duration,
    /// Entries the slow log retains.
    pub slowlog_max_len: usize,
    /// Consecutive slow commands before the client is disconnected.
    pub max_consecutive_slow: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            idle_timeout: Duration::from_secs(300),
            command_timeout: Duration::from_secs(5),
            pipeline_max_commands: 128,
            pipeline_wait: Duration::from_millis(1),
            slowlog_threshold: Duration::from_millis(100),
            slowlog_max_len: 128,
            max_consecutive_slow: 16,
        }
    }
}

pub struct ServerBuilder {
    config: ServerConfig,
    aof: Arc<dyn AofSink>,
    snapshot_sink: Arc<dyn SnapshotSink>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder {
            config: ServerConfig::default(),
            aof: Arc::new(NoopAof),
            snapshot_sink: Arc::new(NoopSnapshotSink),
        }
    }
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn aof_sink(mut self, sink: Arc<dyn AofSink>) -> Self {
        self.aof = sink;
        self
    }

    pub fn snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshot_sink = sink;
        self
    }

    /// Spawn the processor and assemble the handle. Must run inside a
    /// tokio runtime.
    pub fn build(self) -> Server {
        let watch = Arc::new(WatchIndex::default());
        let standalone: Arc<dyn ReplicationService> = Arc::new(NoReplication);
        let hooks = Arc::new(WriteHooks {
            aof: self.aof,
            watch,
            replication: parking_lot::RwLock::new(Some(standalone)),
        });
        let processor = processor::spawn(Keyspace::default(), Arc::clone(&hooks));
        Server {
            inner: Arc::new(ServerInner {
                processor,
                hooks,
                blocking: BlockingManager::new(),
                pubsub: Arc::new(PubSubBroker::default()),
                slowlog: Arc::new(SlowLog::new(
                    self.config.slowlog_threshold,
                    self.config.slowlog_max_len,
                )),
                snapshot_sink: self.snapshot_sink,
                config: self.config,
                next_client_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(0),
            }),
        }
    }
}

struct ServerInner {
    processor: ProcessorHandle,
    hooks: Arc<WriteHooks>,
    blocking: Arc<BlockingManager>,
    pubsub: Arc<PubSubBroker>,
    slowlog: Arc<SlowLog>,
    snapshot_sink: Arc<dyn SnapshotSink>,
    config: ServerConfig,
    next_client_id: AtomicU64,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn processor(&self) -> &ProcessorHandle {
        &self.inner.processor
    }

    pub fn pubsub(&self) -> &PubSubBroker {
        &self.inner.pubsub
    }

    pub fn slowlog(&self) -> &SlowLog {
        &self.inner.slowlog
    }

    pub fn watch_index(&self) -> &WatchIndex {
        &self.inner.hooks.watch
    }

    pub fn blocking(&self) -> &Arc<BlockingManager> {
        &self.inner.blocking
    }

    pub fn replication(&self) -> Arc<dyn ReplicationService> {
        self.inner
            .hooks
            .replication
            .read()
            .clone()
            .unwrap_or_else(|| Arc::new(NoReplication))
    }

    /// Install the replication manager. Called once at wiring time.
    pub fn set_replication(&self, service: Arc<dyn ReplicationService>) {
        self.inner.hooks.set_replication(service);
    }

    pub fn next_client_id(&self) -> u64 {
        self.inner.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_subscriber_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Parse and execute one keyspace command, running the post-write
    /// wakeups.
    pub async fn execute(&self, name: &str, args: &[Bytes]) -> CarmineResult<ExecOutcome> {
        let command = Command::parse(name, args)?;
        self.execute_parsed(command, normalize(name, args)).await
    }

    /// Execute an already-parsed command.
    pub async fn execute_parsed(
        &self,
        command: Command,
        raw: Vec<Bytes>,
    ) -> CarmineResult<ExecOutcome> {
        let outcome = self.inner.processor.execute(command, raw).await?;
        if let Some(effect) = &outcome.effect {
            self.wake_blocked(effect.pushed_lists.clone()).await;
        }
        Ok(outcome)
    }

    /// Run an EXEC body: dirty check, contiguous batch execution, per-item
    /// replies, watch cleanup.
    pub async fn execute_transaction(
        &self,
        client_id: u64,
        queued: Vec<QueuedCommand>,
    ) -> CarmineResult<RespValue> {
        let watch = &self.inner.hooks.watch;
        if watch.is_dirty(client_id) {
            watch.unwatch(client_id);
            return Ok(RespValue::NullArray);
        }
        let batch: Vec<(Command, Vec<Bytes>)> = queued
            .into_iter()
            .map(|q| (q.command, q.raw))
            .collect();
        let outcomes = self.inner.processor.execute_batch(batch).await?;

        let mut pushed = Vec::new();
        let mut replies = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => {
                    if let Some(effect) = &outcome.effect {
                        pushed.extend(effect.pushed_lists.iter().cloned());
                    }
                    replies.push(outcome.reply);
                }
                Err(err) if err.is_client_visible() => {
                    replies.push(RespValue::Error(err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }
        self.wake_blocked(pushed).await;
        watch.unwatch(client_id);
        Ok(RespValue::Array(replies))
    }

    /// The blocking list commands: serve immediately when data exists,
    /// otherwise park a waiter until a push, the timeout, or disconnect.
    ///
    /// `timeout` of zero means wait forever.
    pub async fn blocking_pop(
        &self,
        keys: Vec<Bytes>,
        from: ListEnd,
        dest: Option<(Bytes, ListEnd)>,
        style: BlockingReplyStyle,
        timeout: Duration,
    ) -> CarmineResult<RespValue> {
        let command = Command::TryListPop { keys: keys.clone(), from, dest: dest.clone() };
        let outcome = self.execute_parsed(command, Vec::new()).await?;
        if outcome.reply != RespValue::NullArray {
            return Ok(shape_blocking_reply(outcome.reply, style));
        }

        let timeout = if timeout.is_zero() { FOREVER } else { timeout };
        let (_id, rx) = self
            .inner
            .blocking
            .register(WaiterSpec { keys, from, dest, style }, timeout);
        rx.await
            .map_err(|_| carmine_errors::internal_err!("blocking waiter dropped unresolved"))
    }

    /// Try to satisfy head-of-line waiters for every key that just gained
    /// list elements. Iterative: a BLMOVE wakeup pushes into its
    /// destination, which may wake further waiters.
    async fn wake_blocked(&self, pushed: Vec<Bytes>) {
        let mut queue: VecDeque<Bytes> = pushed.into();
        while let Some(key) = queue.pop_front() {
            loop {
                let Some((_id, claimed)) = self.inner.blocking.claim_head(&key) else {
                    break;
                };
                let command = Command::TryListPop {
                    keys: vec![key.clone()],
                    from: claimed.spec.from,
                    dest: claimed.spec.dest.clone(),
                };
                let outcome = match self.inner.processor.execute(command, Vec::new()).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(%err, "wakeup pop failed, requeuing waiter");
                        self.inner.blocking.requeue_front(claimed);
                        break;
                    }
                };
                if outcome.reply == RespValue::NullArray {
                    // Someone consumed the element first; put the waiter
                    // back at the head and stop scanning this key.
                    self.inner.blocking.requeue_front(claimed);
                    break;
                }
                if let Some(effect) = &outcome.effect {
                    queue.extend(effect.pushed_lists.iter().cloned());
                }
                let style = claimed.spec.style;
                let spec = claimed.spec.clone();
                if let Err(undelivered) = claimed.resolve(shape_blocking_reply(outcome.reply, style))
                {
                    // The client disconnected with the element already
                    // popped. Push it back where it came from so nothing
                    // is lost; the compensating write re-propagates.
                    warn!("blocking client vanished, restoring popped element");
                    self.compensate_lost_delivery(&spec, undelivered).await;
                }
            }
        }
    }

    async fn compensate_lost_delivery(&self, spec: &WaiterSpec, reply: RespValue) {
        // The wakeup reply always carries [key, value] before shaping, but
        // shape may have reduced it; recover what we can.
        let (key, value) = match reply {
            RespValue::Array(items) if items.len() == 2 => match (&items[0], &items[1]) {
                (RespValue::Bulk(k), RespValue::Bulk(v)) => (k.clone(), v.clone()),
                _ => return,
            },
            RespValue::Bulk(value) => {
                // ValueOnly shape: the element now lives at the BLMOVE
                // destination, which is still correct state. Nothing to
                // restore at the source.
                let _ = value;
                return;
            }
            _ => return,
        };
        let push_back = Command::Push {
            key: key.clone(),
            values: vec![value.clone()],
            end: spec.from,
        };
        let raw = vec![
            Bytes::from_static(match spec.from {
                ListEnd::Left => b"LPUSH",
                ListEnd::Right => b"RPUSH",
            }),
            key,
            value,
        ];
        if let Err(err) = self.inner.processor.execute(push_back, raw).await {
            error!(%err, "failed to restore element after lost delivery");
        }
    }

    /// `PUBLISH`: fan out through the broker, never touching the keyspace.
    pub fn publish(&self, channel: &[u8], payload: &Bytes) -> usize {
        self.inner.pubsub.publish(channel, payload)
    }

    /// `BGSAVE` / `BGREWRITEAOF`: snapshot on the processor, convert and
    /// hand off in a background task, release by drop.
    pub fn spawn_background_save(&self, rewrite_aof: bool) {
        let server = self.clone();
        tokio::spawn(async move {
            let snapshot = match server.inner.processor.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    error!(%err, "background save could not snapshot");
                    return;
                }
            };
            let result = if rewrite_aof {
                let commands = snapshot_to_commands(&snapshot);
                server.inner.snapshot_sink.write_aof_rewrite(&commands)
            } else {
                let bytes = snapshot_to_rdb(&snapshot);
                server.inner.snapshot_sink.write_rdb(bytes)
            };
            match result {
                Ok(()) => info!(rewrite_aof, "background save finished"),
                // Persistence failures are local trouble, never the
                // client's.
                Err(err) => error!(%err, "background save failed"),
            }
        });
    }

    /// Take a point-in-time RDB image; the full-resync path uses this.
    pub async fn rdb_image(&self) -> CarmineResult<Bytes> {
        let snapshot = self.inner.processor.snapshot().await?;
        Ok(snapshot_to_rdb(&snapshot))
    }

    /// The `INFO` reply body.
    pub fn info_string(&self, section: Option<&str>) -> String {
        let replication = self.replication();
        let repl_section = format!("# Replication\r\n{}", replication.info_section());
        match section.map(|s| s.to_ascii_lowercase()) {
            Some(ref s) if s == "replication" => repl_section,
            _ => format!(
                "# Server\r\nredis_version:7.0.0-carmine\r\n\r\n{repl_section}"
            ),
        }
    }
}

pub(crate) fn normalize(name: &str, args: &[Bytes]) -> Vec<Bytes> {
    let mut raw = Vec::with_capacity(args.len() + 1);
    raw.push(Bytes::from(name.to_ascii_uppercase()));
    raw.extend(args.iter().cloned());
    raw
}

fn shape_blocking_reply(reply: RespValue, style: BlockingReplyStyle) -> RespValue {
    match (style, reply) {
        (BlockingReplyStyle::KeyAndValue, reply) => reply,
        (BlockingReplyStyle::ValueOnly, RespValue::Array(items)) if items.len() == 2 => {
            items.into_iter().nth(1).unwrap_or(RespValue::NullBulk)
        }
        (BlockingReplyStyle::ValueOnly, other) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    async fn run(server: &Server, name: &str, args: &[&str]) -> RespValue {
        let args: Vec<Bytes> = args.iter().map(|a| b(a)).collect();
        server.execute(name, &args).await.unwrap().reply
    }

    #[tokio::test]
    async fn basic_execute() {
        let server = Server::builder().build();
        assert_eq!(run(&server, "SET", &["k", "v"]).await, RespValue::ok());
        assert_eq!(run(&server, "GET", &["k"]).await, RespValue::bulk("v"));
    }

    #[tokio::test]
    async fn blocking_pop_serves_immediately_when_data_exists() {
        let server = Server::builder().build();
        run(&server, "RPUSH", &["q", "hello"]).await;
        let reply = server
            .blocking_pop(
                vec![b("q")],
                ListEnd::Left,
                None,
                BlockingReplyStyle::KeyAndValue,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            RespValue::Array(vec![RespValue::bulk("q"), RespValue::bulk("hello")])
        );
        assert_eq!(run(&server, "LLEN", &["q"]).await, RespValue::Integer(0));
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_push() {
        let server = Server::builder().build();
        let waiter = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .blocking_pop(
                        vec![b("q")],
                        ListEnd::Left,
                        None,
                        BlockingReplyStyle::KeyAndValue,
                        Duration::ZERO,
                    )
                    .await
                    .unwrap()
            })
        };
        // Give the waiter time to park.
        tokio::time::sleep(Duration::from_millis(50)).await;
        run(&server, "RPUSH", &["q", "hello"]).await;

        let reply = waiter.await.unwrap();
        assert_eq!(
            reply,
            RespValue::Array(vec![RespValue::bulk("q"), RespValue::bulk("hello")])
        );
        assert_eq!(run(&server, "LLEN", &["q"]).await, RespValue::Integer(0));
    }

    #[tokio::test]
    async fn blocking_pop_times_out_with_null_array() {
        let server = Server::builder().build();
        let reply = server
            .blocking_pop(
                vec![b("q")],
                ListEnd::Left,
                None,
                BlockingReplyStyle::KeyAndValue,
                Duration::from_millis(30),
            )
            .await
            .unwrap();
        assert_eq!(reply, RespValue::NullArray);
    }

    #[tokio::test]
    async fn blocking_move_delivers_value_only_and_pushes_dest() {
        let server = Server::builder().build();
        let waiter = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .blocking_pop(
                        vec![b("src")],
                        ListEnd::Right,
                        Some((b("dst"), ListEnd::Left)),
                        BlockingReplyStyle::ValueOnly,
                        Duration::ZERO,
                    )
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        run(&server, "RPUSH", &["src", "v"]).await;

        assert_eq!(waiter.await.unwrap(), RespValue::bulk("v"));
        assert_eq!(run(&server, "LRANGE", &["dst", "0", "-1"]).await,
            RespValue::Array(vec![RespValue::bulk("v")]));
    }

    #[tokio::test]
    async fn transaction_commit_and_abort() {
        let server = Server::builder().build();
        let client = 7;

        // Commit path.
        server.watch_index().watch(client, &[b("x")]);
        let queued = vec![
            QueuedCommand {
                command: Command::parse("SET", &[b("x"), b("1")]).unwrap(),
                raw: vec![b("SET"), b("x"), b("1")],
            },
            QueuedCommand {
                command: Command::parse("INCR", &[b("x")]).unwrap(),
                raw: vec![b("INCR"), b("x")],
            },
        ];
        let reply = server.execute_transaction(client, queued).await.unwrap();
        assert_eq!(
            reply,
            RespValue::Array(vec![RespValue::ok(), RespValue::Integer(2)])
        );
        assert_eq!(run(&server, "GET", &["x"]).await, RespValue::bulk("2"));

        // Abort path: another writer touches the watched key.
        server.watch_index().watch(client, &[b("x")]);
        run(&server, "SET", &["x", "5"]).await;
        let queued = vec![QueuedCommand {
            command: Command::parse("INCR", &[b("x")]).unwrap(),
            raw: vec![b("INCR"), b("x")],
        }];
        let reply = server.execute_transaction(client, queued).await.unwrap();
        assert_eq!(reply, RespValue::NullArray);
        assert_eq!(run(&server, "GET", &["x"]).await, RespValue::bulk("5"));
    }

    #[tokio::test]
    async fn transaction_error_becomes_element_reply() {
        let server = Server::builder().build();
        run(&server, "SET", &["s", "text"]).await;
        let queued = vec![
            QueuedCommand {
                command: Command::parse("INCR", &[b("s")]).unwrap(),
                raw: vec![b("INCR"), b("s")],
            },
            QueuedCommand {
                command: Command::parse("SET", &[b("y"), b("1")]).unwrap(),
                raw: vec![b("SET"), b("y"), b("1")],
            },
        ];
        let reply = server.execute_transaction(1, queued).await.unwrap();
        match reply {
            RespValue::Array(items) => {
                assert!(matches!(items[0], RespValue::Error(_)));
                assert_eq!(items[1], RespValue::ok());
            }
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers() {
        let server = Server::builder().build();
        assert_eq!(server.publish(b"news", &b("x")), 0);
    }
}
