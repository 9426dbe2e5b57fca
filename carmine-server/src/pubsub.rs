//! The pub/sub broker: channel and pattern subscription indices with
//! bounded per-subscriber mailboxes.
//!
//! Patterns are indexed twice: a prefix trie over the literal prefix (the
//! characters before the first metacharacter) narrows publish to patterns
//! that could possibly match, and a per-pattern matcher does the exact
//! check. Both structures are purged together when the last subscriber of a
//! pattern leaves.
//!
//! Subscribers are identified by (client id, generation): the generation
//! makes a reconnect under a recycled client id a distinct subscriber, so a
//! stale mailbox can never be revived by an id collision.

use bytes::Bytes;
use parking_lot::Mutex;
use resp_srv::RespValue;
use tokio::sync::mpsc;
use tracing::trace;

use crate::glob::{glob_match, literal_prefix};

/// (client id, generation)
pub type SubscriberId = (u64, u64);

/// Mailbox bound: a subscriber this far behind starts losing messages.
pub const MAILBOX_CAPACITY: usize = 100;

type Map<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
type Set<T> = std::collections::HashSet<T, ahash::RandomState>;

/// One message on its way to a subscriber's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubMessage {
    Message { channel: Bytes, payload: Bytes },
    PatternMessage { pattern: Bytes, channel: Bytes, payload: Bytes },
}

impl PubSubMessage {
    /// The RESP array the subscriber's pump writes to the socket.
    pub fn to_resp(&self) -> RespValue {
        match self {
            PubSubMessage::Message { channel, payload } => RespValue::Array(vec![
                RespValue::bulk("message"),
                RespValue::Bulk(channel.clone()),
                RespValue::Bulk(payload.clone()),
            ]),
            PubSubMessage::PatternMessage { pattern, channel, payload } => RespValue::Array(vec![
                RespValue::bulk("pmessage"),
                RespValue::Bulk(pattern.clone()),
                RespValue::Bulk(channel.clone()),
                RespValue::Bulk(payload.clone()),
            ]),
        }
    }
}

/// A compiled pattern: the raw glob plus its pre-extracted literal prefix.
/// Kept separate from the trie so both can be purged in O(|prefix|).
#[derive(Debug, Clone)]
struct PatternMatcher {
    pattern: Bytes,
}

impl PatternMatcher {
    fn matches(&self, channel: &[u8]) -> bool {
        glob_match(&self.pattern, channel)
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: Map<u8, TrieNode>,
    /// Patterns whose literal prefix ends exactly here.
    patterns: Set<Bytes>,
}

impl TrieNode {
    fn insert(&mut self, prefix: &[u8], pattern: Bytes) {
        match prefix.first() {
            None => {
                self.patterns.insert(pattern);
            }
            Some(&b) => self.children.entry(b).or_default().insert(&prefix[1..], pattern),
        }
    }

    /// Remove, pruning nodes left empty. Returns whether this node is now
    /// removable.
    fn remove(&mut self, prefix: &[u8], pattern: &[u8]) -> bool {
        match prefix.first() {
            None => {
                self.patterns.remove(pattern);
            }
            Some(&b) => {
                if let Some(child) = self.children.get_mut(&b) {
                    if child.remove(&prefix[1..], pattern) {
                        self.children.remove(&b);
                    }
                }
            }
        }
        self.patterns.is_empty() && self.children.is_empty()
    }

    /// Collect the patterns reachable along `channel`'s character path:
    /// exactly those whose literal prefix is a prefix of `channel`.
    fn collect_along<'a>(&'a self, channel: &[u8], out: &mut Vec<&'a Bytes>) {
        out.extend(self.patterns.iter());
        if let Some((&first, rest)) = channel.split_first() {
            if let Some(child) = self.children.get(&first) {
                child.collect_along(rest, out);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    channels: Map<Bytes, Set<SubscriberId>>,
    patterns: Map<Bytes, (PatternMatcher, Set<SubscriberId>)>,
    trie: TrieNode,
    mailboxes: Map<SubscriberId, mpsc::Sender<PubSubMessage>>,
}

#[derive(Debug, Default)]
pub struct PubSubBroker {
    inner: Mutex<Inner>,
}

impl PubSubBroker {
    /// Create the subscriber's mailbox. The returned receiver is pumped by
    /// a dedicated task that writes straight to the subscriber's socket.
    pub fn register(&self, id: SubscriberId) -> mpsc::Receiver<PubSubMessage> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.inner.lock().mailboxes.insert(id, tx);
        rx
    }

    pub fn subscribe(&self, id: SubscriberId, channel: Bytes) {
        let mut inner = self.inner.lock();
        inner.channels.entry(channel).or_default().insert(id);
    }

    pub fn unsubscribe(&self, id: SubscriberId, channel: &[u8]) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.channels.get_mut(channel) {
            subs.remove(&id);
            if subs.is_empty() {
                inner.channels.remove(channel);
            }
        }
    }

    pub fn psubscribe(&self, id: SubscriberId, pattern: Bytes) {
        let mut inner = self.inner.lock();
        let newly_indexed = !inner.patterns.contains_key(&pattern);
        inner
            .patterns
            .entry(pattern.clone())
            .or_insert_with(|| (PatternMatcher { pattern: pattern.clone() }, Set::default()))
            .1
            .insert(id);
        if newly_indexed {
            let prefix = literal_prefix(&pattern).to_vec();
            inner.trie.insert(&prefix, pattern);
        }
    }

    pub fn punsubscribe(&self, id: SubscriberId, pattern: &[u8]) {
        let mut inner = self.inner.lock();
        let purge = match inner.patterns.get_mut(pattern) {
            Some((_, subs)) => {
                subs.remove(&id);
                subs.is_empty()
            }
            None => false,
        };
        if purge {
            // Last subscriber gone: purge matcher and trie entry together.
            inner.patterns.remove(pattern);
            let prefix = literal_prefix(pattern).to_vec();
            inner.trie.remove(&prefix, pattern);
        }
    }

    /// Drop every subscription and the mailbox of `id`.
    pub fn disconnect(&self, id: SubscriberId) {
        let (channels, patterns): (Vec<Bytes>, Vec<Bytes>) = {
            let inner = self.inner.lock();
            (
                inner
                    .channels
                    .iter()
                    .filter(|(_, subs)| subs.contains(&id))
                    .map(|(c, _)| c.clone())
                    .collect(),
                inner
                    .patterns
                    .iter()
                    .filter(|(_, (_, subs))| subs.contains(&id))
                    .map(|(p, _)| p.clone())
                    .collect(),
            )
        };
        for channel in channels {
            self.unsubscribe(id, &channel);
        }
        for pattern in patterns {
            self.punsubscribe(id, &pattern);
        }
        self.inner.lock().mailboxes.remove(&id);
    }

    /// Deliver `payload` to every channel and pattern subscriber. Returns
    /// the number of mailboxes the message actually reached; full mailboxes
    /// are skipped silently.
    pub fn publish(&self, channel: &[u8], payload: &Bytes) -> usize {
        let inner = self.inner.lock();
        let mut delivered = 0;

        if let Some(subs) = inner.channels.get(channel) {
            let message = PubSubMessage::Message {
                channel: Bytes::copy_from_slice(channel),
                payload: payload.clone(),
            };
            for id in subs {
                if let Some(mailbox) = inner.mailboxes.get(id) {
                    match mailbox.try_send(message.clone()) {
                        Ok(()) => delivered += 1,
                        Err(_) => trace!(client = id.0, "pub/sub mailbox full, dropping"),
                    }
                }
            }
        }

        let mut candidates = Vec::new();
        inner.trie.collect_along(channel, &mut candidates);
        for pattern in candidates {
            let Some((matcher, subs)) = inner.patterns.get(pattern) else {
                continue;
            };
            if !matcher.matches(channel) {
                continue;
            }
            let message = PubSubMessage::PatternMessage {
                pattern: pattern.clone(),
                channel: Bytes::copy_from_slice(channel),
                payload: payload.clone(),
            };
            for id in subs {
                if let Some(mailbox) = inner.mailboxes.get(id) {
                    match mailbox.try_send(message.clone()) {
                        Ok(()) => delivered += 1,
                        Err(_) => trace!(client = id.0, "pub/sub mailbox full, dropping"),
                    }
                }
            }
        }
        delivered
    }

    /// `PUBSUB CHANNELS [pattern]`.
    pub fn active_channels(&self, filter: Option<&[u8]>) -> Vec<Bytes> {
        let inner = self.inner.lock();
        inner
            .channels
            .keys()
            .filter(|channel| filter.map(|p| glob_match(p, channel)).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// `PUBSUB NUMSUB`.
    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.inner
            .lock()
            .channels
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// `PUBSUB NUMPAT`.
    pub fn pattern_count(&self) -> usize {
        self.inner.lock().patterns.len()
    }
}
