//! Consumed sink events.

use serde_json::Value;

/// One message consumed from a topic, decoded and ready for a strategy.
///
/// The payload is `None` for tombstone records; strategies that have no
/// tombstone semantics skip those.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkEvent {
    /// Topic the message was consumed from.
    pub topic: String,
    /// Partition the message was consumed from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Record key, if present and valid UTF-8.
    pub key: Option<String>,
    /// Decoded JSON payload; `None` for tombstones.
    pub payload: Option<Value>,
}

impl SinkEvent {
    /// Convenience constructor for tests and in-process producers.
    #[must_use]
    pub fn new(topic: impl Into<String>, offset: i64, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset,
            key: None,
            payload: Some(payload),
        }
    }
}
