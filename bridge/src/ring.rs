//! Age-bounded in-memory history of recent messages, per topic.
//!
//! One ring per target. The target's connector is the only writer; client
//! sessions read through [`RingBuffer::snapshot`], which copies the current
//! entries out so iteration never blocks the writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;

use common::Clock;

/// One buffered message.
#[derive(Debug, Clone, PartialEq)]
pub struct RingEntry {
    pub log_time_ns: u64,
    pub payload: Bytes,
}

/// Per-topic, insertion-ordered queue bounded by entry age.
pub struct RingBuffer {
    max_age: Duration,
    clock: Arc<dyn Clock>,
    topics: RwLock<HashMap<String, Vec<RingEntry>>>,
}

impl RingBuffer {
    pub fn new(max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_age,
            clock,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// The configured age bound.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Appends an entry, then evicts everything on that topic older than
    /// the age bound (sampled after the append).
    pub fn push(&self, topic: &str, log_time_ns: u64, payload: Bytes) {
        let cutoff = self
            .clock
            .now_nanos()
            .saturating_sub(self.max_age.as_nanos() as u64);

        let mut topics = self.topics.write();
        let entries = topics.entry(topic.to_string()).or_default();
        entries.push(RingEntry {
            log_time_ns,
            payload,
        });

        let keep_from = entries
            .iter()
            .position(|e| e.log_time_ns >= cutoff)
            .unwrap_or(entries.len());
        if keep_from > 0 {
            entries.drain(..keep_from);
        }
    }

    /// Copies out the current entries for a topic, in insertion order.
    pub fn snapshot(&self, topic: &str) -> Vec<RingEntry> {
        self.topics
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Timestamp of the oldest retained entry for a topic.
    pub fn earliest(&self, topic: &str) -> Option<u64> {
        self.topics
            .read()
            .get(topic)
            .and_then(|entries| entries.first())
            .map(|e| e.log_time_ns)
    }

    /// Drops all buffered history. Used on manager teardown.
    pub fn clear(&self) {
        self.topics.write().clear();
    }
}
