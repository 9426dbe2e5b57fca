//! The blocking manager: per-key FIFO queues of waiters for BLPOP / BRPOP /
//! BLMOVE / BRPOPLPUSH.
//!
//! A waiter lives in a registry keyed by a monotonically increasing id and
//! is referenced from the FIFO queue of every key it watches. Resolution is
//! exactly-once by construction: whichever side (push wakeup, timer,
//! disconnect) claims the waiter first removes it from the registry and
//! takes its one-shot sender; queue entries left behind are skipped when
//! popped. Registry removal is O(1), so cancellation never scans queues.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use resp_srv::RespValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::command::ListEnd;

/// "Block forever" sentinel: ~10 years, far past any connection's life.
pub const FOREVER: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

type Map<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// How the resolved value is shaped for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingReplyStyle {
    /// BLPOP / BRPOP: `[key, value]`.
    KeyAndValue,
    /// BLMOVE / BRPOPLPUSH: just the value.
    ValueOnly,
}

/// What a waiter wants done when one of its keys receives data.
#[derive(Debug, Clone)]
pub struct WaiterSpec {
    pub keys: Vec<Bytes>,
    pub from: ListEnd,
    pub dest: Option<(Bytes, ListEnd)>,
    pub style: BlockingReplyStyle,
}

#[derive(Debug)]
struct Waiter {
    spec: WaiterSpec,
    tx: oneshot::Sender<RespValue>,
    deadline: Instant,
    timer: Option<JoinHandle<()>>,
}

/// A waiter taken out of the registry by the wakeup path. Either resolved
/// (send + drop) or handed back via [`BlockingManager::requeue_front`] when
/// the race for the pushed element was lost.
#[derive(Debug)]
pub struct ClaimedWaiter {
    pub spec: WaiterSpec,
    tx: oneshot::Sender<RespValue>,
    deadline: Instant,
}

impl ClaimedWaiter {
    /// Deliver the reply. `Err` hands the reply back when the client
    /// vanished before delivery, so the caller can compensate.
    pub fn resolve(self, reply: RespValue) -> Result<(), RespValue> {
        self.tx.send(reply)
    }
}

#[derive(Debug, Default)]
struct Inner {
    waiters: Map<u64, Waiter>,
    queues: Map<Bytes, VecDeque<u64>>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct BlockingManager {
    inner: Mutex<Inner>,
    /// Back-reference for the timer tasks; set once at construction.
    self_ref: OnceLock<Weak<BlockingManager>>,
}

impl BlockingManager {
    pub fn new() -> Arc<Self> {
        let manager = Arc::new(BlockingManager::default());
        let _ = manager.self_ref.set(Arc::downgrade(&manager));
        manager
    }

    /// Register a waiter on every key in its spec, arming a one-shot timer.
    /// Returns the receiver the connection awaits plus the waiter id for
    /// disconnect cleanup.
    pub fn register(
        &self,
        spec: WaiterSpec,
        timeout: Duration,
    ) -> (u64, oneshot::Receiver<RespValue>) {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            for key in &spec.keys {
                inner.queues.entry(key.clone()).or_default().push_back(id);
            }
            inner
                .waiters
                .insert(id, Waiter { spec, tx, deadline, timer: None });
            id
        };
        self.arm_timer(id, deadline);
        (id, rx)
    }

    fn arm_timer(&self, id: u64, deadline: Instant) {
        let Some(manager) = self.self_ref.get().and_then(Weak::upgrade) else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            manager.timeout(id);
        });
        if let Some(waiter) = self.inner.lock().waiters.get_mut(&id) {
            waiter.timer = Some(handle);
        } else {
            // Already resolved between registration and here.
            handle.abort();
        }
    }

    /// Timer expiry: deliver the null-array reply and unlink. Idempotent
    /// with a concurrent wakeup because only one side finds the waiter in
    /// the registry.
    fn timeout(&self, id: u64) {
        let waiter = self.inner.lock().waiters.remove(&id);
        if let Some(waiter) = waiter {
            trace!(waiter = id, "blocking waiter timed out");
            let _ = waiter.tx.send(RespValue::NullArray);
        }
    }

    /// Claim the head-of-line waiter for `key`, removing it from the
    /// registry and cancelling its timer. Stale queue entries (already
    /// resolved waiters) are skipped and dropped.
    pub fn claim_head(&self, key: &[u8]) -> Option<(u64, ClaimedWaiter)> {
        let mut inner = self.inner.lock();
        loop {
            let id = {
                let queue = inner.queues.get_mut(key)?;
                match queue.pop_front() {
                    Some(id) => id,
                    None => {
                        inner.queues.remove(key);
                        return None;
                    }
                }
            };
            if let Some(waiter) = inner.waiters.remove(&id) {
                if let Some(timer) = waiter.timer {
                    timer.abort();
                }
                return Some((
                    id,
                    ClaimedWaiter { spec: waiter.spec, tx: waiter.tx, deadline: waiter.deadline },
                ));
            }
            // Stale id: the waiter was resolved through another key or
            // timed out. Keep scanning.
        }
    }

    /// Put a claimed waiter back at the head of its queues, with its
    /// original deadline re-armed. Used when the pushed element was gone by
    /// the time the wakeup pop ran.
    pub fn requeue_front(&self, claimed: ClaimedWaiter) {
        let deadline = claimed.deadline;
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            for key in &claimed.spec.keys {
                inner.queues.entry(key.clone()).or_default().push_front(id);
            }
            inner.waiters.insert(
                id,
                Waiter { spec: claimed.spec, tx: claimed.tx, deadline, timer: None },
            );
            id
        };
        self.arm_timer(id, deadline);
    }

    /// Whether any waiter is queued on `key`.
    pub fn has_waiters(&self, key: &[u8]) -> bool {
        let inner = self.inner.lock();
        inner
            .queues
            .get(key)
            .map(|queue| queue.iter().any(|id| inner.waiters.contains_key(id)))
            .unwrap_or(false)
    }

    /// Drop a waiter on client disconnect without delivering anything.
    pub fn cancel(&self, id: u64) {
        let waiter = self.inner.lock().waiters.remove(&id);
        if let Some(waiter) = waiter {
            if let Some(timer) = waiter.timer {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn spec(keys: &[&str]) -> WaiterSpec {
        WaiterSpec {
            keys: keys.iter().map(|k| b(k)).collect(),
            from: ListEnd::Left,
            dest: None,
            style: BlockingReplyStyle::KeyAndValue,
        }
    }

    #[tokio::test]
    async fn claim_is_fifo() {
        let manager = BlockingManager::new();
        let (_id1, _rx1) = manager.register(spec(&["q"]), FOREVER);
        let (_id2, _rx2) = manager.register(spec(&["q"]), FOREVER);

        let (first, claimed) = manager.claim_head(b"q").unwrap();
        let _ = claimed.resolve(RespValue::NullArray);
        let (second, claimed) = manager.claim_head(b"q").unwrap();
        let _ = claimed.resolve(RespValue::NullArray);
        assert!(first < second);
        assert!(manager.claim_head(b"q").is_none());
    }

    #[tokio::test]
    async fn timeout_delivers_null_array_once() {
        let manager = BlockingManager::new();
        let (_id, rx) = manager.register(spec(&["q"]), Duration::from_millis(20));
        let reply = rx.await.unwrap();
        assert_eq!(reply, RespValue::NullArray);
        // The waiter is gone from the queue.
        assert!(manager.claim_head(b"q").is_none());
        assert!(!manager.has_waiters(b"q"));
    }

    #[tokio::test]
    async fn wakeup_beats_timer() {
        let manager = BlockingManager::new();
        let (_id, rx) = manager.register(spec(&["q"]), Duration::from_millis(50));
        let (_, claimed) = manager.claim_head(b"q").unwrap();
        claimed.resolve(RespValue::bulk("data")).unwrap();
        assert_eq!(rx.await.unwrap(), RespValue::bulk("data"));
        // Timer later finds nothing; no panic, no double delivery.
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn multi_key_waiter_is_unlinked_everywhere() {
        let manager = BlockingManager::new();
        let (_id, _rx) = manager.register(spec(&["a", "b"]), FOREVER);
        assert!(manager.has_waiters(b"a"));
        assert!(manager.has_waiters(b"b"));

        let (_, claimed) = manager.claim_head(b"a").unwrap();
        let _ = claimed.resolve(RespValue::NullArray);
        // The entry under "b" is stale now.
        assert!(!manager.has_waiters(b"b"));
        assert!(manager.claim_head(b"b").is_none());
    }

    #[tokio::test]
    async fn requeue_front_preserves_priority() {
        let manager = BlockingManager::new();
        let (_id1, _rx1) = manager.register(spec(&["q"]), FOREVER);
        let (_id2, _rx2) = manager.register(spec(&["q"]), FOREVER);

        let (first_id, claimed) = manager.claim_head(b"q").unwrap();
        manager.requeue_front(claimed);
        // The requeued waiter still wins over the second registrant.
        let (reclaimed_id, reclaimed) = manager.claim_head(b"q").unwrap();
        assert_ne!(first_id, reclaimed_id, "requeue allocates a fresh id");
        let _ = reclaimed.resolve(RespValue::NullArray);
        let (second, _) = manager.claim_head(b"q").unwrap();
        assert!(second < reclaimed_id);
    }

    #[tokio::test]
    async fn cancel_unlinks_silently() {
        let manager = BlockingManager::new();
        let (id, rx) = manager.register(spec(&["q"]), FOREVER);
        manager.cancel(id);
        assert!(manager.claim_head(b"q").is_none());
        // Sender dropped without a reply.
        assert!(rx.await.is_err());
    }
}
