//! Dead-letter routing for failed events.
//!
//! Under the `dlq` error policy every event that cannot be applied is
//! forwarded to a configured dead-letter topic together with enough
//! context to diagnose it later: origin coordinates and the error text,
//! carried as record headers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::debug;

use graphsink_config::{ErrorPolicy, SinkSettings};

use crate::error::SinkError;
use crate::event::SinkEvent;

/// Header prefix on dead-lettered records.
const HEADER_PREFIX: &str = "__streams.errors.";

/// Send timeout for dead-letter publishes.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A failed event plus its failure context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Topic the event was consumed from.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Source offset.
    pub offset: i64,
    /// Original record key.
    pub key: Option<String>,
    /// Original payload, re-serialized.
    pub payload: Option<String>,
    /// Why the event could not be applied.
    pub error: String,
}

impl DeadLetterRecord {
    /// Captures `event` and the error that rejected it.
    #[must_use]
    pub fn from_event(event: &SinkEvent, error: &SinkError) -> Self {
        Self {
            topic: event.topic.clone(),
            partition: event.partition,
            offset: event.offset,
            key: event.key.clone(),
            payload: event.payload.as_ref().map(ToString::to_string),
            error: error.to_string(),
        }
    }
}

/// Where dead-lettered records go.
#[async_trait]
pub trait DeadLetterDestination: Send + Sync {
    /// Forwards one failed record. Errors here are the caller's to log;
    /// they must not take the pipeline down.
    async fn publish(&self, record: DeadLetterRecord) -> Result<(), SinkError>;
}

/// Keeps dead letters in memory. For tests and broker-less setups.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetters {
    records: tokio::sync::Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetters {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything dead-lettered so far.
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterDestination for InMemoryDeadLetters {
    async fn publish(&self, record: DeadLetterRecord) -> Result<(), SinkError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// Publishes dead letters to a Kafka topic.
pub struct KafkaDeadLetters {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetters {
    /// Builds the destination when the settings select the `dlq` policy;
    /// `None` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Transport`] when the producer cannot be
    /// created from the configured transport properties.
    pub fn from_settings(settings: &SinkSettings) -> Result<Option<Self>, SinkError> {
        if settings.error_policy != ErrorPolicy::DeadLetter {
            return Ok(None);
        }
        // Settings parsing guarantees the topic is present for this policy.
        let Some(topic) = settings.dlq_topic.clone() else {
            return Ok(None);
        };

        let mut config = ClientConfig::new();
        for (key, value) in &settings.kafka_properties {
            config.set(key, value);
        }
        let producer: FutureProducer = config
            .create()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(Some(Self { producer, topic }))
    }
}

#[async_trait]
impl DeadLetterDestination for KafkaDeadLetters {
    async fn publish(&self, record: DeadLetterRecord) -> Result<(), SinkError> {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: &format!("{HEADER_PREFIX}topic"),
                value: Some(record.topic.as_str()),
            })
            .insert(Header {
                key: &format!("{HEADER_PREFIX}partition"),
                value: Some(record.partition.to_string().as_str()),
            })
            .insert(Header {
                key: &format!("{HEADER_PREFIX}offset"),
                value: Some(record.offset.to_string().as_str()),
            })
            .insert(Header {
                key: &format!("{HEADER_PREFIX}message"),
                value: Some(record.error.as_str()),
            });

        let payload = record.payload.clone().unwrap_or_default();
        let mut outgoing: FutureRecord<'_, String, String> =
            FutureRecord::to(&self.topic).payload(&payload).headers(headers);
        if let Some(key) = &record.key {
            outgoing = outgoing.key(key);
        }

        match self.producer.send(outgoing, Timeout::After(SEND_TIMEOUT)).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %self.topic,
                    partition,
                    offset,
                    source_topic = %record.topic,
                    "dead-lettered record"
                );
                Ok(())
            }
            Err((e, _)) => Err(SinkError::Transport(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_destination_collects_records() {
        let destination = InMemoryDeadLetters::new();
        let event = SinkEvent::new("orders", 42, json!({"id": 1}));
        let error = SinkError::InvalidEvent {
            topic: "orders".to_string(),
            reason: "missing key".to_string(),
        };
        destination
            .publish(DeadLetterRecord::from_event(&event, &error))
            .await
            .unwrap();

        let records = destination.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 42);
        assert!(records[0].error.contains("missing key"));
    }

    #[test]
    fn fail_policy_builds_no_destination() {
        let settings = SinkSettings::from_snapshot(
            &graphsink_config::ConfigurationSnapshot::from_properties(
                "kafka.bootstrap.servers=k:9092\n",
            ),
            "graph",
        )
        .unwrap();
        assert!(KafkaDeadLetters::from_settings(&settings).unwrap().is_none());
    }
}
