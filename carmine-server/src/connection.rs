//! The per-connection pipeline: parse → execute → enqueue reply → flush.
//!
//! Each connection runs two tasks. The reader task owns the parse buffer
//! and drives command execution; the writer task owns the socket's write
//! half and drains a byte channel. Pub/sub pumps and the replication
//! manager push into the same channel, which is what makes `PSYNC`'s
//! "socket hijack" safe: after the handshake the manager simply becomes
//! another producer, while the reader keeps consuming the replica's
//! `REPLCONF ACK`s.
//!
//! The drain loop implements pipelining: after each reply it polls the
//! buffer for further complete requests without blocking, waits ≈1 ms for
//! in-flight bytes, and flushes once the budget is spent or the buffer
//! runs dry.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use carmine_errors::{CarmineError, CarmineResult};
use resp_srv::{decode_request, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::blocking::BlockingReplyStyle;
use crate::command::{Command, ListEnd};
use crate::pubsub::SubscriberId;
use crate::server::{normalize, Server};
use crate::txn::{QueuedCommand, TxnState};

type Set<T> = std::collections::HashSet<T, ahash::RandomState>;

/// Serve one client connection to completion.
pub async fn serve_connection(server: Server, stream: TcpStream) {
    let client_id = server.next_client_id();
    let peer = stream.peer_addr().ok();
    debug!(client = client_id, ?peer, "connection opened");

    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
    let writer = tokio::spawn(write_loop(write_half, out_rx));

    let mut conn = Connection {
        id: client_id,
        server: server.clone(),
        out: out_tx,
        txn: TxnState::None,
        channels: Set::default(),
        patterns: Set::default(),
        subscriber: None,
        name: None,
        replica_link: false,
        consecutive_slow: 0,
        closing: false,
    };

    if let Err(err) = conn.run(read_half).await {
        debug!(client = client_id, %err, "connection ended with error");
    }

    server.watch_index().disconnect(client_id);
    if let Some(subscriber) = conn.subscriber.take() {
        server.pubsub().disconnect(subscriber);
    }
    drop(conn);
    // Writer drains whatever is queued, then exits with the channel.
    let _ = writer.await;
    debug!(client = client_id, "connection closed");
}

async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if half.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = half.shutdown().await;
}

struct Connection {
    id: u64,
    server: Server,
    out: mpsc::UnboundedSender<Bytes>,
    txn: TxnState,
    channels: Set<Bytes>,
    patterns: Set<Bytes>,
    subscriber: Option<SubscriberId>,
    name: Option<Bytes>,
    /// Set once PSYNC succeeds; disables idle deadlines and read timeouts.
    replica_link: bool,
    consecutive_slow: u32,
    closing: bool,
}

impl Connection {
    fn in_pubsub_mode(&self) -> bool {
        !self.channels.is_empty() || !self.patterns.is_empty()
    }

    fn no_deadline(&self) -> bool {
        self.in_pubsub_mode() || self.replica_link
    }

    async fn run(&mut self, mut read_half: OwnedReadHalf) -> CarmineResult<()> {
        let config = self.server.config().clone();
        let mut buf = BytesMut::with_capacity(16 * 1024);

        'connection: loop {
            // Block (with the idle deadline) until one complete request
            // is buffered.
            let request = loop {
                match decode_request(&mut buf) {
                    Ok(Some(request)) => break request,
                    Ok(None) => {}
                    Err(err) => {
                        self.send_value(&RespValue::Error(format!("ERR Protocol error: {err}")));
                        return Ok(());
                    }
                }
                let read = if self.no_deadline() {
                    read_half.read_buf(&mut buf).await?
                } else {
                    match timeout(config.idle_timeout, read_half.read_buf(&mut buf)).await {
                        Ok(read) => read?,
                        Err(_) => {
                            trace!(client = self.id, "idle deadline reached");
                            return Ok(());
                        }
                    }
                };
                if read == 0 {
                    return Ok(());
                }
            };

            // Drain pipelined requests up to the budget, then flush.
            let mut replies = BytesMut::new();
            let mut budget = config.pipeline_max_commands;
            let mut next = Some(request);
            while let Some(request) = next {
                self.handle_request(request, &mut replies).await?;
                budget -= 1;
                if self.closing || budget == 0 {
                    break;
                }
                next = match decode_request(&mut buf) {
                    Ok(Some(request)) => Some(request),
                    Ok(None) => {
                        // Catch bytes already in flight before flushing.
                        match timeout(config.pipeline_wait, read_half.read_buf(&mut buf)).await {
                            Ok(Ok(0)) => {
                                self.closing = true;
                                None
                            }
                            Ok(Ok(_)) => decode_request(&mut buf).unwrap_or(None),
                            Ok(Err(err)) => return Err(err.into()),
                            Err(_) => None,
                        }
                    }
                    Err(err) => {
                        RespValue::Error(format!("ERR Protocol error: {err}")).put(&mut replies);
                        self.closing = true;
                        None
                    }
                };
            }
            if !replies.is_empty() && self.out.send(replies.freeze()).is_err() {
                return Ok(());
            }
            if self.closing {
                break 'connection;
            }
        }
        Ok(())
    }

    fn send_value(&self, value: &RespValue) {
        let _ = self.out.send(value.to_bytes());
    }

    async fn handle_request(
        &mut self,
        request: resp_srv::Request,
        replies: &mut BytesMut,
    ) -> CarmineResult<()> {
        let name = request.name();
        let args: Vec<Bytes> = request.args().to_vec();
        let started = Instant::now();

        match self.route(&name, &args, replies).await {
            Ok(()) => {}
            Err(err) if err.is_client_visible() => {
                if matches!(
                    err,
                    CarmineError::CommandTimeout | CarmineError::TooManySlowCommands
                ) {
                    self.closing = true;
                }
                RespValue::Error(err.to_string()).put(replies);
            }
            Err(err) => return Err(err),
        }

        let elapsed = started.elapsed();
        if self.server.slowlog().observe(&normalize(&name, &args), elapsed) {
            self.consecutive_slow += 1;
            if self.consecutive_slow > self.server.config().max_consecutive_slow {
                self.closing = true;
                RespValue::Error(CarmineError::TooManySlowCommands.to_string()).put(replies);
            }
        } else {
            self.consecutive_slow = 0;
        }
        Ok(())
    }

    /// Dispatch one command, writing its reply (or replies) into the
    /// buffer.
    async fn route(
        &mut self,
        name: &str,
        args: &[Bytes],
        replies: &mut BytesMut,
    ) -> CarmineResult<()> {
        // Subscribed connections accept only the pub/sub control surface.
        if self.in_pubsub_mode()
            && !matches!(
                name,
                "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE" | "PING" | "QUIT"
            )
        {
            return Err(CarmineError::Protocol(format!(
                "Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context",
                name.to_ascii_lowercase()
            )));
        }

        // Open transaction: queue everything except the control commands.
        if self.txn.is_queuing() && !matches!(name, "MULTI" | "EXEC" | "DISCARD" | "WATCH") {
            if is_blocking_command(name) {
                return Err(CarmineError::NotAllowedInTransactions(name.to_string()));
            }
            let command = Command::parse(name, args)?;
            if let TxnState::Queuing(queue) = &mut self.txn {
                queue.push(QueuedCommand { command, raw: normalize(name, args) });
            }
            RespValue::Simple("QUEUED".into()).put(replies);
            return Ok(());
        }

        match name {
            "PING" => {
                match args.first() {
                    Some(payload) => RespValue::Bulk(payload.clone()).put(replies),
                    None => RespValue::Simple("PONG".into()).put(replies),
                }
                Ok(())
            }
            "ECHO" => {
                let [payload] = args else {
                    return Err(CarmineError::WrongArity("echo".into()));
                };
                RespValue::Bulk(payload.clone()).put(replies);
                Ok(())
            }
            "QUIT" => {
                RespValue::ok().put(replies);
                self.closing = true;
                Ok(())
            }
            "SELECT" => {
                // Single keyspace; accept and ignore the index.
                RespValue::ok().put(replies);
                Ok(())
            }

            "MULTI" => {
                if self.txn.is_queuing() {
                    return Err(CarmineError::NestedMulti);
                }
                self.txn = TxnState::Queuing(Vec::new());
                RespValue::ok().put(replies);
                Ok(())
            }
            "EXEC" => {
                let TxnState::Queuing(queue) = std::mem::take(&mut self.txn) else {
                    return Err(CarmineError::ExecWithoutMulti);
                };
                let reply = self.server.execute_transaction(self.id, queue).await?;
                reply.put(replies);
                Ok(())
            }
            "DISCARD" => {
                if !self.txn.is_queuing() {
                    return Err(CarmineError::DiscardWithoutMulti);
                }
                // Watches survive DISCARD; only the queue is dropped.
                self.txn = TxnState::None;
                RespValue::ok().put(replies);
                Ok(())
            }
            "WATCH" => {
                if self.txn.is_queuing() {
                    return Err(CarmineError::WatchInsideMulti);
                }
                if args.is_empty() {
                    return Err(CarmineError::WrongArity("watch".into()));
                }
                self.server.watch_index().watch(self.id, args);
                RespValue::ok().put(replies);
                Ok(())
            }
            "UNWATCH" => {
                self.server.watch_index().unwatch(self.id);
                RespValue::ok().put(replies);
                Ok(())
            }

            "SUBSCRIBE" | "PSUBSCRIBE" => self.subscribe(name == "PSUBSCRIBE", args, replies),
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                self.unsubscribe(name == "PUNSUBSCRIBE", args, replies);
                Ok(())
            }
            "PUBLISH" => {
                let [channel, payload] = args else {
                    return Err(CarmineError::WrongArity("publish".into()));
                };
                let delivered = self.server.publish(channel, payload);
                RespValue::Integer(delivered as i64).put(replies);
                Ok(())
            }
            "PUBSUB" => {
                self.pubsub_introspect(args, replies)?;
                Ok(())
            }

            "BLPOP" | "BRPOP" => {
                let from = if name == "BLPOP" { ListEnd::Left } else { ListEnd::Right };
                let (keys, wait) = parse_blocking_tail(name, args, 2)?;
                let reply = self
                    .server
                    .blocking_pop(keys, from, None, BlockingReplyStyle::KeyAndValue, wait)
                    .await?;
                reply.put(replies);
                Ok(())
            }
            "BLMOVE" => {
                if args.len() != 5 {
                    return Err(CarmineError::WrongArity("blmove".into()));
                }
                let from = ListEnd::parse(&args[2])?;
                let to = ListEnd::parse(&args[3])?;
                let wait = parse_timeout(&args[4])?;
                let reply = self
                    .server
                    .blocking_pop(
                        vec![args[0].clone()],
                        from,
                        Some((args[1].clone(), to)),
                        BlockingReplyStyle::ValueOnly,
                        wait,
                    )
                    .await?;
                reply.put(replies);
                Ok(())
            }
            "BRPOPLPUSH" => {
                if args.len() != 3 {
                    return Err(CarmineError::WrongArity("brpoplpush".into()));
                }
                let wait = parse_timeout(&args[2])?;
                let reply = self
                    .server
                    .blocking_pop(
                        vec![args[0].clone()],
                        ListEnd::Right,
                        Some((args[1].clone(), ListEnd::Left)),
                        BlockingReplyStyle::ValueOnly,
                        wait,
                    )
                    .await?;
                // BRPOPLPUSH replies null bulk on timeout, not null array.
                let reply = match reply {
                    RespValue::NullArray => RespValue::NullBulk,
                    other => other,
                };
                reply.put(replies);
                Ok(())
            }

            "INFO" => {
                let section = args.first().map(|s| String::from_utf8_lossy(s).into_owned());
                RespValue::bulk(self.server.info_string(section.as_deref())).put(replies);
                Ok(())
            }
            "REPLCONF" => {
                if let Some(reply) = self.server.replication().handle_replconf(self.id, args) {
                    reply.put(replies);
                }
                Ok(())
            }
            "PSYNC" => {
                self.server
                    .replication()
                    .handle_psync(self.id, args, self.out.clone())
                    .await?;
                // The manager now produces this connection's output; the
                // read side keeps feeding ACKs back through REPLCONF.
                self.replica_link = true;
                Ok(())
            }
            "REPLICAOF" | "SLAVEOF" => {
                let [host, port] = args else {
                    return Err(CarmineError::WrongArity("replicaof".into()));
                };
                let target = if host.eq_ignore_ascii_case(b"NO") && port.eq_ignore_ascii_case(b"ONE")
                {
                    None
                } else {
                    let host = String::from_utf8_lossy(host).into_owned();
                    let port: u16 = std::str::from_utf8(port)
                        .ok()
                        .and_then(|p| p.parse().ok())
                        .ok_or(CarmineError::NotAnInteger)?;
                    Some((host, port))
                };
                let reply = self.server.replication().handle_replicaof(target).await;
                reply.put(replies);
                Ok(())
            }
            "WAIT" => {
                if args.len() != 2 {
                    return Err(CarmineError::WrongArity("wait".into()));
                }
                let acked = self.server.replication().acked_replicas();
                RespValue::Integer(acked as i64).put(replies);
                Ok(())
            }

            "SLOWLOG" => {
                self.slowlog(args, replies)?;
                Ok(())
            }
            "BGSAVE" => {
                self.server.spawn_background_save(false);
                RespValue::Simple("Background saving started".into()).put(replies);
                Ok(())
            }
            "BGREWRITEAOF" => {
                self.server.spawn_background_save(true);
                RespValue::Simple("Background append only file rewriting started".into())
                    .put(replies);
                Ok(())
            }
            "COMMAND" => {
                // Enough for client handshakes: an empty table.
                match args.first().map(|s| s.to_ascii_uppercase()) {
                    Some(sub) if sub == b"COUNT" => RespValue::Integer(0).put(replies),
                    _ => RespValue::Array(Vec::new()).put(replies),
                }
                Ok(())
            }
            "CLIENT" => {
                match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
                    Some(b"SETNAME") => {
                        let Some(name) = args.get(1) else {
                            return Err(CarmineError::WrongArity("client|setname".into()));
                        };
                        self.name = Some(name.clone());
                        RespValue::ok().put(replies);
                    }
                    Some(b"GETNAME") => {
                        RespValue::Bulk(self.name.clone().unwrap_or_default()).put(replies);
                    }
                    _ => RespValue::ok().put(replies),
                }
                Ok(())
            }
            "DEBUG" => {
                match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
                    Some(b"SLEEP") => {
                        let seconds: f64 = args
                            .get(1)
                            .and_then(|s| std::str::from_utf8(s).ok())
                            .and_then(|s| s.parse().ok())
                            .ok_or(CarmineError::NotAFloat)?;
                        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                        RespValue::ok().put(replies);
                        Ok(())
                    }
                    _ => Err(CarmineError::Syntax),
                }
            }
            "EVAL" | "EVALSHA" | "SCRIPT" => Err(CarmineError::NoScript),

            // Everything else is a keyspace command for the processor.
            _ => {
                let command = Command::parse(name, args)?;
                if command.is_write() && self.server.replication().is_replica() {
                    return Err(CarmineError::ReadOnlyReplica);
                }
                let deadline = self.server.config().command_timeout;
                let outcome = timeout(
                    deadline,
                    self.server.execute_parsed(command, normalize(name, args)),
                )
                .await
                .map_err(|_| CarmineError::CommandTimeout)??;
                outcome.reply.put(replies);
                Ok(())
            }
        }
    }

    fn subscribe(
        &mut self,
        pattern: bool,
        args: &[Bytes],
        replies: &mut BytesMut,
    ) -> CarmineResult<()> {
        if args.is_empty() {
            return Err(CarmineError::WrongArity(
                if pattern { "psubscribe" } else { "subscribe" }.into(),
            ));
        }
        let subscriber = self.ensure_subscriber();
        for target in args {
            if pattern {
                self.server.pubsub().psubscribe(subscriber, target.clone());
                self.patterns.insert(target.clone());
            } else {
                self.server.pubsub().subscribe(subscriber, target.clone());
                self.channels.insert(target.clone());
            }
            let total = (self.channels.len() + self.patterns.len()) as i64;
            RespValue::Array(vec![
                RespValue::bulk(if pattern { "psubscribe" } else { "subscribe" }),
                RespValue::Bulk(target.clone()),
                RespValue::Integer(total),
            ])
            .put(replies);
        }
        Ok(())
    }

    fn unsubscribe(&mut self, pattern: bool, args: &[Bytes], replies: &mut BytesMut) {
        let verb = if pattern { "punsubscribe" } else { "unsubscribe" };
        let targets: Vec<Bytes> = if args.is_empty() {
            if pattern {
                self.patterns.iter().cloned().collect()
            } else {
                self.channels.iter().cloned().collect()
            }
        } else {
            args.to_vec()
        };

        if targets.is_empty() {
            RespValue::Array(vec![
                RespValue::bulk(verb),
                RespValue::NullBulk,
                RespValue::Integer((self.channels.len() + self.patterns.len()) as i64),
            ])
            .put(replies);
            return;
        }

        for target in targets {
            if let Some(subscriber) = self.subscriber {
                if pattern {
                    self.server.pubsub().punsubscribe(subscriber, &target);
                } else {
                    self.server.pubsub().unsubscribe(subscriber, &target);
                }
            }
            if pattern {
                self.patterns.remove(&target);
            } else {
                self.channels.remove(&target);
            }
            RespValue::Array(vec![
                RespValue::bulk(verb),
                RespValue::Bulk(target),
                RespValue::Integer((self.channels.len() + self.patterns.len()) as i64),
            ])
            .put(replies);
        }

        // Last subscription released: leave pub/sub mode entirely.
        if !self.in_pubsub_mode() {
            if let Some(subscriber) = self.subscriber.take() {
                self.server.pubsub().disconnect(subscriber);
            }
        }
    }

    /// Register the mailbox and its pump on first subscription. The
    /// generation counter keeps a reconnect under a reused client id from
    /// colliding with a stale mailbox.
    fn ensure_subscriber(&mut self) -> SubscriberId {
        if let Some(subscriber) = self.subscriber {
            return subscriber;
        }
        let subscriber = (self.id, self.server.next_subscriber_generation());
        let mut mailbox = self.server.pubsub().register(subscriber);
        let out = self.out.clone();
        tokio::spawn(async move {
            while let Some(message) = mailbox.recv().await {
                if out.send(message.to_resp().to_bytes()).is_err() {
                    break;
                }
            }
        });
        self.subscriber = Some(subscriber);
        subscriber
    }

    fn pubsub_introspect(&self, args: &[Bytes], replies: &mut BytesMut) -> CarmineResult<()> {
        match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
            Some(b"CHANNELS") => {
                let channels = self.server.pubsub().active_channels(args.get(1).map(|p| p.as_ref()));
                RespValue::Array(channels.into_iter().map(RespValue::Bulk).collect()).put(replies);
                Ok(())
            }
            Some(b"NUMSUB") => {
                let mut out = Vec::with_capacity(args.len().saturating_sub(1) * 2);
                for channel in &args[1..] {
                    out.push(RespValue::Bulk(channel.clone()));
                    out.push(RespValue::Integer(
                        self.server.pubsub().subscriber_count(channel) as i64,
                    ));
                }
                RespValue::Array(out).put(replies);
                Ok(())
            }
            Some(b"NUMPAT") => {
                RespValue::Integer(self.server.pubsub().pattern_count() as i64).put(replies);
                Ok(())
            }
            _ => Err(CarmineError::Syntax),
        }
    }

    fn slowlog(&self, args: &[Bytes], replies: &mut BytesMut) -> CarmineResult<()> {
        match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
            Some(b"GET") => {
                let count = match args.get(1) {
                    Some(n) => Some(
                        std::str::from_utf8(n)
                            .ok()
                            .and_then(|s| s.parse::<usize>().ok())
                            .ok_or(CarmineError::NotAnInteger)?,
                    ),
                    None => None,
                };
                let entries = self.server.slowlog().get(count);
                RespValue::Array(entries.iter().map(|e| e.to_resp()).collect()).put(replies);
                Ok(())
            }
            Some(b"LEN") => {
                RespValue::Integer(self.server.slowlog().len() as i64).put(replies);
                Ok(())
            }
            Some(b"RESET") => {
                self.server.slowlog().reset();
                RespValue::ok().put(replies);
                Ok(())
            }
            _ => Err(CarmineError::Syntax),
        }
    }
}

fn is_blocking_command(name: &str) -> bool {
    matches!(name, "BLPOP" | "BRPOP" | "BLMOVE" | "BRPOPLPUSH")
}

/// Split `KEY [KEY ...] TIMEOUT` and parse the trailing timeout.
fn parse_blocking_tail(
    name: &str,
    args: &[Bytes],
    min_args: usize,
) -> CarmineResult<(Vec<Bytes>, Duration)> {
    if args.len() < min_args {
        return Err(CarmineError::WrongArity(name.to_ascii_lowercase()));
    }
    let Some((timeout_arg, keys)) = args.split_last() else {
        return Err(CarmineError::WrongArity(name.to_ascii_lowercase()));
    };
    Ok((keys.to_vec(), parse_timeout(timeout_arg)?))
}

/// Timeouts arrive in (possibly fractional) seconds; zero means forever.
fn parse_timeout(input: &Bytes) -> CarmineResult<Duration> {
    let seconds: f64 = std::str::from_utf8(input)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CarmineError::NotAFloat)?;
    if seconds < 0.0 || !seconds.is_finite() {
        return Err(CarmineError::NotAFloat);
    }
    Ok(Duration::from_secs_f64(seconds))
}
