//! The single-writer processor: one task owns the [`Keyspace`] and executes
//! submitted commands to completion, in FIFO order, entirely over in-memory
//! state.
//!
//! Everything else in the system talks to it through a [`ProcessorHandle`]:
//! a typed command plus a one-shot reply slot. This serializes every
//! mutation (and every read that traverses mutable state) without a single
//! lock on the keyspace itself. Background work — the expiry sampler,
//! snapshot requests — enters the same queue and is ordered with respect to
//! writes like any other request.
//!
//! Write fan-out (watch touching, AOF append, replication propagation)
//! happens inline in the processor loop, so downstream consumers observe
//! writes in exactly the execution order. The hook implementations only
//! enqueue; no network or disk I/O runs on this task.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use carmine_errors::{internal_err, CarmineResult};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::command::{Command, ExecOutcome, WriteEffect};
use crate::keyspace::{Keyspace, Snapshot};
use crate::persistence::{AofSink, NoopAof};
use crate::repl::ReplicationService;
use crate::txn::WatchIndex;

/// Queue depth before submitters start applying backpressure.
const QUEUE_DEPTH: usize = 1024;

/// Cadence of the self-submitting expiry sampler.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Expiry sampler tuning: batch size, repeat threshold, per-tick budget.
const SWEEP_SAMPLE: usize = 20;
const SWEEP_REPEAT_THRESHOLD: f64 = 0.25;
const SWEEP_BUDGET: Duration = Duration::from_millis(25);

/// The consumers every successful write fans out to.
pub struct WriteHooks {
    pub aof: Arc<dyn AofSink>,
    pub watch: Arc<WatchIndex>,
    /// Filled in at wiring time, after the processor is already running.
    pub replication: parking_lot::RwLock<Option<Arc<dyn ReplicationService>>>,
}

impl WriteHooks {
    /// Hooks with no AOF sink and no replication; unit tests and
    /// standalone embedding.
    pub fn disconnected() -> Arc<Self> {
        Arc::new(WriteHooks {
            aof: Arc::new(NoopAof),
            watch: Arc::new(WatchIndex::default()),
            replication: parking_lot::RwLock::new(None),
        })
    }

    pub fn set_replication(&self, service: Arc<dyn ReplicationService>) {
        *self.replication.write() = Some(service);
    }

    fn touch(&self, effect: &WriteEffect) {
        self.watch.touch(&effect.touched_keys);
    }

    fn log_and_propagate(&self, effect: &WriteEffect) {
        self.aof.append(&effect.command);
        let replication = self.replication.read();
        if let Some(service) = replication.as_ref() {
            if !service.is_replica() {
                let mut buf = BytesMut::new();
                resp_srv::encode_command(&effect.command, &mut buf);
                service.propagate(buf.freeze());
            }
        }
    }
}

impl std::fmt::Debug for WriteHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHooks")
            .field("replication", &self.replication.read().is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ProcessorRequest {
    Execute {
        command: Command,
        raw: Vec<Bytes>,
        reply: oneshot::Sender<CarmineResult<ExecOutcome>>,
    },
    /// An EXEC body: runs contiguously with respect to the queue, with AOF
    /// and replication fan-out deferred until the whole batch finished.
    ExecuteBatch {
        commands: Vec<(Command, Vec<Bytes>)>,
        reply: oneshot::Sender<Vec<CarmineResult<ExecOutcome>>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    ExpirySweep,
}

/// Cheap-to-clone submission side of the processor queue.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    tx: mpsc::Sender<ProcessorRequest>,
}

impl ProcessorHandle {
    /// Execute one command and wait for its outcome.
    pub async fn execute(&self, command: Command, raw: Vec<Bytes>) -> CarmineResult<ExecOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ProcessorRequest::Execute { command, raw, reply })
            .await
            .map_err(|_| internal_err!("processor task has stopped"))?;
        rx.await
            .map_err(|_| internal_err!("processor dropped the reply slot"))?
    }

    /// Execute a transaction body back-to-back.
    pub async fn execute_batch(
        &self,
        commands: Vec<(Command, Vec<Bytes>)>,
    ) -> CarmineResult<Vec<CarmineResult<ExecOutcome>>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ProcessorRequest::ExecuteBatch { commands, reply })
            .await
            .map_err(|_| internal_err!("processor task has stopped"))?;
        rx.await
            .map_err(|_| internal_err!("processor dropped the reply slot"))
    }

    /// Take a COW snapshot of the keyspace.
    pub async fn snapshot(&self) -> CarmineResult<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ProcessorRequest::Snapshot { reply })
            .await
            .map_err(|_| internal_err!("processor task has stopped"))?;
        rx.await
            .map_err(|_| internal_err!("processor dropped the reply slot"))
    }
}

/// Spawn the processor task plus its expiry sampler. The processor drains
/// every queued request before exiting, so in-flight commands complete even
/// during shutdown; it stops once all handles are gone.
pub fn spawn(keyspace: Keyspace, hooks: Arc<WriteHooks>) -> ProcessorHandle {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

    tokio::spawn(run(keyspace, hooks, rx));

    // The sampler holds only a weak sender: it must not keep the processor
    // alive after the last real handle is dropped.
    let weak = tx.downgrade();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(tx) = weak.upgrade() else { break };
            if tx.send(ProcessorRequest::ExpirySweep).await.is_err() {
                break;
            }
        }
        trace!("expiry sampler stopped");
    });

    ProcessorHandle { tx }
}

async fn run(
    mut keyspace: Keyspace,
    hooks: Arc<WriteHooks>,
    mut rx: mpsc::Receiver<ProcessorRequest>,
) {
    while let Some(request) = rx.recv().await {
        match request {
            ProcessorRequest::Execute { command, raw, reply } => {
                let outcome = command.execute(&mut keyspace, raw);
                if let Ok(outcome) = &outcome {
                    if let Some(effect) = &outcome.effect {
                        hooks.touch(effect);
                        hooks.log_and_propagate(effect);
                    }
                }
                // A dropped receiver means the client went away mid-flight;
                // the mutation has already happened either way.
                let _ = reply.send(outcome);
            }
            ProcessorRequest::ExecuteBatch { commands, reply } => {
                let mut outcomes = Vec::with_capacity(commands.len());
                let mut effects: Vec<WriteEffect> = Vec::new();
                for (command, raw) in commands {
                    let outcome = command.execute(&mut keyspace, raw);
                    if let Ok(outcome) = &outcome {
                        if let Some(effect) = &outcome.effect {
                            // Watchers go dirty at write time; persistence
                            // and propagation wait for the batch to finish.
                            hooks.touch(effect);
                            effects.push(effect.clone());
                        }
                    }
                    outcomes.push(outcome);
                }
                for effect in &effects {
                    hooks.log_and_propagate(effect);
                }
                let _ = reply.send(outcomes);
            }
            ProcessorRequest::Snapshot { reply } => {
                let snapshot = keyspace.snapshot();
                if let Some(service) = hooks.replication.read().as_ref() {
                    service.on_snapshot_taken();
                }
                let _ = reply.send(snapshot);
            }
            ProcessorRequest::ExpirySweep => {
                keyspace.sweep_expired(SWEEP_SAMPLE, SWEEP_REPEAT_THRESHOLD, SWEEP_BUDGET);
            }
        }
    }
    debug!("processor queue closed, task exiting");
}
