//! Transaction support: the WATCH reverse index and per-connection queue
//! state.
//!
//! The cost model is deliberately write-heavy: every successful write calls
//! [`WatchIndex::touch`], which marks the watchers of the written keys
//! dirty. `EXEC` then only reads one flag. Watch sets are tiny and writes
//! already pay a processor round-trip, so the extra map probe is noise
//! there and keeps `EXEC` O(1).

use bytes::Bytes;
use parking_lot::Mutex;

use crate::command::Command;

type Map<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
type Set<T> = std::collections::HashSet<T, ahash::RandomState>;

/// One command held in a transaction queue: parsed at queue time (so the
/// client hears about syntax problems immediately) plus its normalized wire
/// form for the write fan-out.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    pub raw: Vec<Bytes>,
}

/// Per-connection transaction state.
#[derive(Debug, Default)]
pub enum TxnState {
    #[default]
    None,
    Queuing(Vec<QueuedCommand>),
}

impl TxnState {
    pub fn is_queuing(&self) -> bool {
        matches!(self, TxnState::Queuing(_))
    }
}

#[derive(Debug, Default)]
struct ClientWatch {
    keys: Set<Bytes>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// key → clients watching it.
    watchers: Map<Bytes, Set<u64>>,
    clients: Map<u64, ClientWatch>,
}

/// The global reverse index from key to watching clients.
#[derive(Debug, Default)]
pub struct WatchIndex {
    inner: Mutex<Inner>,
}

impl WatchIndex {
    pub fn watch(&self, client: u64, keys: &[Bytes]) {
        let mut inner = self.inner.lock();
        let entry = inner.clients.entry(client).or_default();
        let fresh: Vec<Bytes> = keys.iter().filter(|k| entry.keys.insert((*k).clone())).cloned().collect();
        for key in fresh {
            inner.watchers.entry(key).or_default().insert(client);
        }
    }

    /// Clear the client's watches and dirty flag.
    pub fn unwatch(&self, client: u64) {
        let mut inner = self.inner.lock();
        let Some(watch) = inner.clients.remove(&client) else {
            return;
        };
        for key in watch.keys {
            if let Some(watchers) = inner.watchers.get_mut(&key) {
                watchers.remove(&client);
                if watchers.is_empty() {
                    inner.watchers.remove(&key);
                }
            }
        }
    }

    /// Mark every client watching any of `keys` dirty. Called by the write
    /// fan-out after each successful write, inside or outside EXEC.
    pub fn touch(&self, keys: &[Bytes]) {
        let mut inner = self.inner.lock();
        for key in keys {
            let Some(watchers) = inner.watchers.get(key) else {
                continue;
            };
            let watchers: Vec<u64> = watchers.iter().copied().collect();
            for client in watchers {
                if let Some(watch) = inner.clients.get_mut(&client) {
                    watch.dirty = true;
                }
            }
        }
    }

    pub fn is_dirty(&self, client: u64) -> bool {
        self.inner
            .lock()
            .clients
            .get(&client)
            .map(|w| w.dirty)
            .unwrap_or(false)
    }

    pub fn disconnect(&self, client: u64) {
        self.unwatch(client);
    }
}
