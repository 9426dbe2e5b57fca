//! The slow log: newest-first ring of commands that exceeded the latency
//! threshold, with monotonic ids.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use resp_srv::RespValue;

#[derive(Debug, Clone)]
pub struct SlowLogEntry {
    pub id: u64,
    pub unix_time_s: u64,
    pub duration_us: u64,
    pub command: Vec<Bytes>,
}

impl SlowLogEntry {
    /// The nested array shape of one `SLOWLOG GET` element.
    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(vec![
            RespValue::Integer(self.id as i64),
            RespValue::Integer(self.unix_time_s as i64),
            RespValue::Integer(self.duration_us as i64),
            RespValue::Array(self.command.iter().cloned().map(RespValue::Bulk).collect()),
        ])
    }
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<SlowLogEntry>,
    next_id: u64,
}

#[derive(Debug)]
pub struct SlowLog {
    inner: Mutex<Inner>,
    threshold: Duration,
    max_len: usize,
}

impl SlowLog {
    pub fn new(threshold: Duration, max_len: usize) -> Self {
        SlowLog {
            inner: Mutex::new(Inner { entries: VecDeque::new(), next_id: 0 }),
            threshold,
            max_len,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Record a command's duration. Returns whether it counted as slow.
    pub fn observe(&self, command: &[Bytes], duration: Duration) -> bool {
        if duration < self.threshold {
            return false;
        }
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push_front(SlowLogEntry {
            id,
            unix_time_s: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            duration_us: duration.as_micros() as u64,
            command: command.to_vec(),
        });
        // Overflow drops the oldest.
        while inner.entries.len() > self.max_len {
            inner.entries.pop_back();
        }
        true
    }

    /// Newest-first entries, at most `count`.
    pub fn get(&self, count: Option<usize>) -> Vec<SlowLogEntry> {
        let inner = self.inner.lock();
        let take = count.unwrap_or(10).min(inner.entries.len());
        inner.entries.iter().take(take).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.inner.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cmd(name: &str) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(name.as_bytes())]
    }

    #[test]
    fn below_threshold_is_ignored() {
        let log = SlowLog::new(Duration::from_millis(100), 8);
        assert!(!log.observe(&cmd("GET"), Duration::from_millis(5)));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn newest_first_with_monotonic_ids() {
        let log = SlowLog::new(Duration::from_millis(1), 8);
        for i in 0..3 {
            log.observe(&cmd(&format!("CMD{i}")), Duration::from_millis(10));
        }
        let entries = log.get(None);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, 2);
        assert_eq!(entries[0].command, cmd("CMD2"));
        assert_eq!(entries[2].id, 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let log = SlowLog::new(Duration::ZERO, 2);
        for i in 0..5 {
            log.observe(&cmd(&format!("CMD{i}")), Duration::from_millis(1));
        }
        let entries = log.get(Some(10));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, 4);
        assert_eq!(entries[1].id, 3);
    }

    #[test]
    fn reset_keeps_id_counter() {
        let log = SlowLog::new(Duration::ZERO, 8);
        log.observe(&cmd("A"), Duration::from_millis(1));
        log.reset();
        assert!(log.is_empty());
        log.observe(&cmd("B"), Duration::from_millis(1));
        assert_eq!(log.get(None)[0].id, 1);
    }
}
