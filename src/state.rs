//! # StateNode
//!
//! The server-side mutable aggregate of live status fields. All mutations
//! go through one mutex, so a reader always observes either the value
//! before a write or the value after it, never a mix. Each field carries a
//! version counter incremented on every write; the version is what change
//! notifications carry.
//!
//! The mutex is a `std::sync::Mutex` held only for the field update itself
//! and never across an await point: getters stay synchronous and never
//! block on I/O, and client-invoked mutators never perform network I/O
//! inside the critical section. Change events are enqueued after the lock
//! is released.

use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing::trace;

use crate::config::NodeConfig;
use crate::message::{LogBuffer, LogMessage, SystemSnapshot};
use crate::update_queue::{ChangeEvent, UpdateSink};

/// The declared field set. Names follow the wire-facing camelCase the
/// remote surface uses.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum Field {
    #[strum(serialize = "recentMessages")]
    RecentMessages,
    #[strum(serialize = "totalMessageCount")]
    TotalMessageCount,
    #[strum(serialize = "systemView")]
    SystemView,
}

impl Field {
    /// Parses a declared field name; unknown names are an
    /// [`StateError::InvalidField`].
    pub fn parse(name: &str) -> StateResult<Self> {
        Field::from_str(name).map_err(|_| StateError::InvalidField {
            name: name.to_string(),
        })
    }
}

/// A field's current value, typed per field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Messages(Vec<LogMessage>),
    Count(u64),
    Snapshot(SystemSnapshot),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Messages(_) => "messages",
            FieldValue::Count(_) => "count",
            FieldValue::Snapshot(_) => "snapshot",
        }
    }
}

/// Value plus the version the read observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("not a declared field: {name}")]
    InvalidField { name: String },

    #[error("field {field} holds {expected}, got {got}")]
    TypeMismatch {
        field: Field,
        expected: &'static str,
        got: &'static str,
    },
}

pub type StateResult<T> = Result<T, StateError>;

struct Slot<T> {
    value: T,
    version: u64,
}

impl<T> Slot<T> {
    fn new(value: T) -> Self {
        Self { value, version: 0 }
    }

    fn write(&mut self, value: T) -> u64 {
        self.value = value;
        self.version += 1;
        self.version
    }
}

struct Inner {
    recent_messages: Slot<LogBuffer>,
    total_message_count: Slot<u64>,
    system_view: Slot<SystemSnapshot>,
}

/// One StateNode per running service process: created at startup, passed
/// by `Arc` to collaborators, discarded at shutdown.
pub struct StateNode {
    inner: Mutex<Inner>,
    sink: UpdateSink,
}

impl StateNode {
    pub fn new(config: &NodeConfig, sink: UpdateSink) -> Self {
        Self {
            inner: Mutex::new(Inner {
                recent_messages: Slot::new(LogBuffer::new(config.message_buffer_capacity)),
                total_message_count: Slot::new(0),
                system_view: Slot::new(SystemSnapshot::default()),
            }),
            sink,
        }
    }

    /// Overwrites a field and increments its version atomically. The new
    /// value must match the field's declared type.
    pub fn set_field(&self, field: Field, value: FieldValue) -> StateResult<u64> {
        let version = {
            let mut inner = self.lock();
            match (field, value) {
                (Field::RecentMessages, FieldValue::Messages(messages)) => {
                    // Replace in place so the ring's eviction count
                    // survives the overwrite.
                    inner.recent_messages.value.replace(messages);
                    inner.recent_messages.version += 1;
                    inner.recent_messages.version
                }
                (Field::TotalMessageCount, FieldValue::Count(count)) => {
                    inner.total_message_count.write(count)
                }
                (Field::SystemView, FieldValue::Snapshot(snapshot)) => {
                    inner.system_view.write(snapshot)
                }
                (field, value) => {
                    return Err(StateError::TypeMismatch {
                        field,
                        expected: Self::expected_kind(field),
                        got: value.kind(),
                    })
                }
            }
        };
        self.notify(field, version);
        Ok(version)
    }

    /// Current value and version of a field. Never blocks on I/O.
    pub fn get_field(&self, field: Field) -> Versioned<FieldValue> {
        let inner = self.lock();
        match field {
            Field::RecentMessages => Versioned {
                value: FieldValue::Messages(inner.recent_messages.value.to_vec()),
                version: inner.recent_messages.version,
            },
            Field::TotalMessageCount => Versioned {
                value: FieldValue::Count(inner.total_message_count.value),
                version: inner.total_message_count.version,
            },
            Field::SystemView => Versioned {
                value: FieldValue::Snapshot(inner.system_view.value.clone()),
                version: inner.system_view.version,
            },
        }
    }

    /// Name-keyed variants for callers holding wire-facing field names.
    pub fn set_field_by_name(&self, name: &str, value: FieldValue) -> StateResult<u64> {
        self.set_field(Field::parse(name)?, value)
    }

    pub fn get_field_by_name(&self, name: &str) -> StateResult<Versioned<FieldValue>> {
        Ok(self.get_field(Field::parse(name)?))
    }

    /// Appends a message and increments the total counter by exactly one,
    /// both under the same critical section: no reader can observe the
    /// counter without the message or vice versa.
    pub fn push_message(&self, message: LogMessage) {
        let (messages_version, count_version) = {
            let mut inner = self.lock();
            let count = inner.total_message_count.value + 1;
            let count_version = inner.total_message_count.write(count);
            inner.recent_messages.value.push(message);
            inner.recent_messages.version += 1;
            (inner.recent_messages.version, count_version)
        };
        trace!(version = messages_version, "message pushed");
        self.notify(Field::RecentMessages, messages_version);
        self.notify(Field::TotalMessageCount, count_version);
    }

    /// Empties the live buffer. The total counter is unaffected.
    pub fn clear_messages(&self) {
        let version = {
            let mut inner = self.lock();
            inner.recent_messages.value.clear();
            inner.recent_messages.version += 1;
            inner.recent_messages.version
        };
        self.notify(Field::RecentMessages, version);
    }

    /// Atomically captures the buffer contents, empties it, and returns the
    /// capture. Shares the push critical section, so every pushed message
    /// is returned by exactly one drain or remains live, never both.
    pub fn drain_messages(&self) -> Vec<LogMessage> {
        let (messages, version) = {
            let mut inner = self.lock();
            let messages = inner.recent_messages.value.drain();
            inner.recent_messages.version += 1;
            (messages, inner.recent_messages.version)
        };
        self.notify(Field::RecentMessages, version);
        messages
    }

    /// Replaces the backend snapshot.
    pub fn set_system_view(&self, snapshot: SystemSnapshot) {
        let version = {
            let mut inner = self.lock();
            inner.system_view.write(snapshot)
        };
        self.notify(Field::SystemView, version);
    }

    pub fn recent_messages(&self) -> Vec<LogMessage> {
        self.lock().recent_messages.value.to_vec()
    }

    pub fn total_message_count(&self) -> u64 {
        self.lock().total_message_count.value
    }

    pub fn system_view(&self) -> SystemSnapshot {
        self.lock().system_view.value.clone()
    }

    /// Messages evicted from the ring by overflow, for observability.
    pub fn evicted_messages(&self) -> u64 {
        self.lock().recent_messages.value.evicted()
    }

    fn notify(&self, field: Field, version: u64) {
        // Outside the lock: enqueue is O(1) and takes no lock shared with
        // subscriber delivery.
        self.sink.enqueue(ChangeEvent { field, version });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expected_kind(field: Field) -> &'static str {
        match field {
            Field::RecentMessages => "messages",
            Field::TotalMessageCount => "count",
            Field::SystemView => "snapshot",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    use crate::update_queue::UpdateQueue;

    fn node() -> (StateNode, UpdateQueue, broadcast::Sender<()>) {
        let config = NodeConfig::default();
        let (shutdown_tx, _) = broadcast::channel(1);
        let queue = UpdateQueue::start(&config, shutdown_tx.subscribe());
        (StateNode::new(&config, queue.sink()), queue, shutdown_tx)
    }

    fn msg(text: &str) -> LogMessage {
        LogMessage::new(text)
    }

    #[tokio::test]
    async fn test_push_increments_counter_and_buffer_together() {
        let (node, _queue, _tx) = node();
        node.push_message(msg("m1"));
        node.push_message(msg("m2"));

        assert_eq!(node.total_message_count(), 2);
        assert_eq!(node.recent_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_drain_returns_contents_counter_unaffected() {
        let (node, _queue, _tx) = node();
        node.push_message(msg("m1"));
        node.push_message(msg("m2"));
        node.push_message(msg("m3"));

        let drained = node.drain_messages();
        let texts: Vec<_> = drained.iter().map(|m| m.message.clone()).collect();
        assert_eq!(texts, vec!["m1", "m2", "m3"]);
        assert_eq!(node.total_message_count(), 3);
        assert!(node.recent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_clear_then_push_keeps_counting() {
        let (node, _queue, _tx) = node();
        node.push_message(msg("m1"));
        node.push_message(msg("m2"));
        node.clear_messages();
        node.push_message(msg("m3"));

        assert_eq!(node.total_message_count(), 3);
        let texts: Vec<_> = node
            .recent_messages()
            .iter()
            .map(|m| m.message.clone())
            .collect();
        assert_eq!(texts, vec!["m3"]);
    }

    #[tokio::test]
    async fn test_versions_increase_per_write() {
        let (node, _queue, _tx) = node();
        let before = node.get_field(Field::RecentMessages).version;
        node.push_message(msg("m1"));
        node.push_message(msg("m2"));
        let after = node.get_field(Field::RecentMessages).version;
        assert_eq!(after, before + 2);
    }

    #[tokio::test]
    async fn test_set_field_keeps_eviction_count() {
        let mut config = NodeConfig::default();
        config.message_buffer_capacity = 2;
        let (shutdown_tx, _) = broadcast::channel(1);
        let queue = UpdateQueue::start(&config, shutdown_tx.subscribe());
        let node = StateNode::new(&config, queue.sink());

        node.push_message(msg("m1"));
        node.push_message(msg("m2"));
        node.push_message(msg("m3"));
        assert_eq!(node.evicted_messages(), 1);

        node.set_field(Field::RecentMessages, FieldValue::Messages(vec![msg("r1")]))
            .unwrap();

        assert_eq!(node.evicted_messages(), 1);
        assert_eq!(node.recent_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_set_field_type_mismatch() {
        let (node, _queue, _tx) = node();
        let result = node.set_field(Field::TotalMessageCount, FieldValue::Messages(vec![]));
        assert!(matches!(result, Err(StateError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_unknown_field_name_rejected() {
        let (node, _queue, _tx) = node();
        let result = node.get_field_by_name("noSuchField");
        assert!(matches!(result, Err(StateError::InvalidField { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_stored_opaquely() {
        let (node, _queue, _tx) = node();
        let snapshot = SystemSnapshot::new(serde_json::json!({"workers": 3}));
        node.set_system_view(snapshot.clone());
        assert_eq!(node.system_view(), snapshot);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pushes_lose_nothing() {
        let (node, _queue, _tx) = node();
        let node = Arc::new(node);

        let mut handles = Vec::new();
        for producer in 0..8 {
            let node = node.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    node.push_message(LogMessage::new(format!("p{}-{}", producer, i)));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(node.total_message_count(), 200);
        assert_eq!(node.recent_messages().len(), 200);
    }
}
