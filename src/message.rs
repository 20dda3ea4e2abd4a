//! Log message and snapshot payload types.
//!
//! A [`LogMessage`] is the immutable unit the backend pushes at us; a
//! [`SystemSnapshot`] is the backend's own point-in-time status payload,
//! which we store and forward without interpreting its structure. The
//! [`LogBuffer`] keeps the most recent messages in a bounded ring so the
//! live buffer can never grow without limit between operator clears.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// A single log event emitted by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogMessage {
    pub timestamp: Timestamp,
    pub message: String,
    pub is_developer_facing: bool,
}

impl LogMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Timestamp::now(),
            message: message.into(),
            is_developer_facing: false,
        }
    }

    pub fn developer_facing(message: impl Into<String>) -> Self {
        Self {
            timestamp: Timestamp::now(),
            message: message.into(),
            is_developer_facing: true,
        }
    }
}

impl std::fmt::Display for LogMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.timestamp, self.message)
    }
}

/// Opaque point-in-time status payload from the distributed backend.
///
/// The node stores and forwards the payload as-is; it never looks inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SystemSnapshot(pub serde_json::Value);

impl SystemSnapshot {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for SystemSnapshot {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Bounded ring of recent log messages, insertion order preserved.
///
/// When the ring is full the oldest message is evicted and counted. The
/// eviction count is how many messages left the buffer without being
/// drained or cleared by a client.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    messages: VecDeque<LogMessage>,
    capacity: usize,
    evicted: u64,
}

impl LogBuffer {
    /// A capacity of zero is clamped to one: the ring always holds at
    /// least the newest message.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Appends a message, evicting the oldest entries while the ring is at
    /// capacity.
    pub fn push(&mut self, message: LogMessage) {
        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
            self.evicted += 1;
        }
        self.messages.push_back(message);
    }

    /// Replaces the contents wholesale, keeping the eviction counter.
    /// Input beyond capacity evicts oldest as usual.
    pub fn replace(&mut self, messages: Vec<LogMessage>) {
        self.messages.clear();
        for message in messages {
            self.push(message);
        }
    }

    /// Empties the buffer, discarding contents.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Empties the buffer and returns the captured contents in order.
    pub fn drain(&mut self) -> Vec<LogMessage> {
        self.messages.drain(..).collect()
    }

    pub fn to_vec(&self) -> Vec<LogMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of messages evicted by ring overflow since construction.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogMessage> {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn msg(text: &str) -> LogMessage {
        LogMessage::new(text)
    }

    #[test]
    fn test_push_preserves_insertion_order() {
        let mut buffer = LogBuffer::new(8);
        buffer.push(msg("m1"));
        buffer.push(msg("m2"));
        buffer.push(msg("m3"));

        let texts: Vec<_> = buffer.iter().map(|m| m.message.clone()).collect();
        assert_eq!(texts, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(msg("m1"));
        buffer.push(msg("m2"));
        buffer.push(msg("m3"));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.evicted(), 1);
        let texts: Vec<_> = buffer.iter().map(|m| m.message.clone()).collect();
        assert_eq!(texts, vec!["m2", "m3"]);
    }

    #[test]
    fn test_zero_capacity_stays_bounded() {
        let mut buffer = LogBuffer::new(0);
        for i in 0..100 {
            buffer.push(msg(&format!("m{}", i)));
        }

        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.evicted(), 99);
        assert_eq!(buffer.iter().next().unwrap().message, "m99");
    }

    #[test]
    fn test_replace_keeps_eviction_count() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(msg("m1"));
        buffer.push(msg("m2"));
        buffer.push(msg("m3"));
        assert_eq!(buffer.evicted(), 1);

        buffer.replace(vec![msg("r1")]);

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.evicted(), 1);
        assert_eq!(buffer.iter().next().unwrap().message, "r1");
    }

    #[test]
    fn test_drain_empties_and_returns_contents() {
        let mut buffer = LogBuffer::new(8);
        buffer.push(msg("m1"));
        buffer.push(msg("m2"));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message, "m1");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_discards_contents() {
        let mut buffer = LogBuffer::new(8);
        buffer.push(msg("m1"));
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.evicted(), 0);
    }

    #[test]
    fn test_snapshot_is_opaque_json() {
        let snapshot = SystemSnapshot::new(serde_json::json!({
            "workers": 4,
            "activeComputations": ["c1", "c2"],
        }));
        let serialized = serde_json::to_string(&snapshot).unwrap();
        let restored: SystemSnapshot = serde_json::from_str(&serialized).unwrap();
        assert_eq!(snapshot, restored);
    }

    #[test]
    fn test_log_message_serde() {
        let message = LogMessage::developer_facing("compiler cache miss");
        let serialized = serde_json::to_string(&message).unwrap();
        let restored: LogMessage = serde_json::from_str(&serialized).unwrap();
        assert!(restored.is_developer_facing);
        assert_eq!(restored.message, "compiler cache miss");
    }
}
