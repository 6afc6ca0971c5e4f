//! Event consumer seam and the Kafka implementation.
//!
//! The pipeline talks to a [`EventConsumer`] trait object so tests can
//! script batches without a broker. Implementations are resolved by name
//! through the [`ConsumerFactoryRegistry`]; the configuration's
//! `streams.sink` value picks the factory, and an unknown name fails
//! loudly instead of silently running the default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tokio::time::Instant;
use tracing::{debug, warn};

use graphsink_config::{ConfigError, SinkSettings};

use crate::error::SinkError;
use crate::event::SinkEvent;

/// Largest number of events returned by one poll.
const BATCH_LIMIT: usize = 500;

/// Metadata fetch timeout used to detect unknown topics at startup.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// A source of sink events.
#[async_trait]
pub trait EventConsumer: Send {
    /// Connects and subscribes. Must be called exactly once, first.
    async fn start(&mut self) -> Result<(), SinkError>;

    /// Returns the next batch, waiting at most `timeout`. An empty vec
    /// means the timeout elapsed with nothing to consume.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<SinkEvent>, SinkError>;

    /// Commits everything consumed so far.
    async fn commit(&mut self) -> Result<(), SinkError>;

    /// Unsubscribes and releases the transport.
    async fn stop(&mut self);

    /// Subscribed topics that do not exist at the broker, detected at
    /// start. Informational only.
    fn invalid_topics(&self) -> &[String] {
        &[]
    }
}

impl std::fmt::Debug for dyn EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn EventConsumer")
    }
}

/// Builds consumers for one implementation name.
pub trait ConsumerFactory: Send + Sync {
    /// Name the configuration selects this factory by.
    fn name(&self) -> &'static str;

    /// Creates an unstarted consumer subscribed to `topics`.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] when the settings are unusable for this
    /// implementation.
    fn create(
        &self,
        settings: &SinkSettings,
        topics: &[String],
    ) -> Result<Box<dyn EventConsumer>, SinkError>;
}

/// Name-indexed factory table.
///
/// Replaces dynamic class loading with an explicit registration step:
/// embedders add their factory before handing the registry to the
/// lifecycle manager.
#[derive(Default)]
pub struct ConsumerFactoryRegistry {
    factories: HashMap<&'static str, Arc<dyn ConsumerFactory>>,
}

impl ConsumerFactoryRegistry {
    /// Empty registry, for embedders that replace the transport entirely.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Kafka factory registered under `"kafka"`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(KafkaConsumerFactory));
        registry
    }

    /// Registers a factory, replacing any previous one with the same name.
    pub fn register(&mut self, factory: Arc<dyn ConsumerFactory>) {
        self.factories.insert(factory.name(), factory);
    }

    /// Registered implementation names.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Creates a consumer through the named factory.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::UnknownImplementation`] for an unregistered
    /// name, or whatever the factory itself rejects.
    pub fn create(
        &self,
        name: &str,
        settings: &SinkSettings,
        topics: &[String],
    ) -> Result<Box<dyn EventConsumer>, SinkError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SinkError::UnknownImplementation(name.to_string()))?;
        factory.create(settings, topics)
    }
}

/// Factory for [`KafkaEventConsumer`].
pub struct KafkaConsumerFactory;

impl ConsumerFactory for KafkaConsumerFactory {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn create(
        &self,
        settings: &SinkSettings,
        topics: &[String],
    ) -> Result<Box<dyn EventConsumer>, SinkError> {
        if !settings.kafka_properties.contains_key("bootstrap.servers") {
            return Err(SinkError::Config(ConfigError::MissingKey(
                "kafka.bootstrap.servers".to_string(),
            )));
        }

        let mut config = ClientConfig::new();
        for (key, value) in &settings.kafka_properties {
            config.set(key, value);
        }
        if !settings.kafka_properties.contains_key("group.id") {
            config.set("group.id", format!("graphsink-{}", settings.database));
        }
        // Offsets are committed only after a batch was applied.
        config.set("enable.auto.commit", "false");

        Ok(Box::new(KafkaEventConsumer {
            config,
            topics: topics.to_vec(),
            consumer: None,
            invalid_topics: Vec::new(),
        }))
    }
}

/// Kafka-backed consumer over rdkafka's async stream consumer.
pub struct KafkaEventConsumer {
    config: ClientConfig,
    topics: Vec<String>,
    consumer: Option<StreamConsumer>,
    invalid_topics: Vec<String>,
}

#[async_trait]
impl EventConsumer for KafkaEventConsumer {
    async fn start(&mut self) -> Result<(), SinkError> {
        let consumer: StreamConsumer = self
            .config
            .create()
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        match consumer.fetch_metadata(None, METADATA_TIMEOUT) {
            Ok(metadata) => {
                let existing: Vec<&str> =
                    metadata.topics().iter().map(|t| t.name()).collect();
                self.invalid_topics = self
                    .topics
                    .iter()
                    .filter(|t| !existing.contains(&t.as_str()))
                    .cloned()
                    .collect();
            }
            Err(e) => debug!(error = %e, "metadata fetch failed, skipping topic check"),
        }

        let names: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<SinkEvent>, SinkError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| SinkError::Pipeline("consumer not started".to_string()))?;

        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while events.len() < BATCH_LIMIT {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(SinkError::Transport(e.to_string())),
                Ok(Ok(message)) => {
                    if let Some(event) = decode(&message) {
                        events.push(event);
                    }
                }
            }
        }
        Ok(events)
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| SinkError::Pipeline("consumer not started".to_string()))?;
        consumer
            .commit_consumer_state(CommitMode::Async)
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn stop(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
    }

    fn invalid_topics(&self) -> &[String] {
        &self.invalid_topics
    }
}

/// Decodes one Kafka message. Undecodable payloads are logged and dropped;
/// they never reach a strategy.
fn decode(message: &rdkafka::message::BorrowedMessage<'_>) -> Option<SinkEvent> {
    let key = message
        .key()
        .map(|k| String::from_utf8_lossy(k).into_owned());
    let payload = match message.payload() {
        None => None,
        Some(bytes) => match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    error = %e,
                    "payload is not valid JSON, dropping record"
                );
                return None;
            }
        },
    };
    Some(SinkEvent {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsink_config::ConfigurationSnapshot;

    fn settings(text: &str) -> SinkSettings {
        SinkSettings::from_snapshot(&ConfigurationSnapshot::from_properties(text), "graph")
            .unwrap()
    }

    #[test]
    fn unknown_implementation_is_an_error() {
        let registry = ConsumerFactoryRegistry::with_defaults();
        let err = registry
            .create("pulsar", &settings("kafka.bootstrap.servers=k:9092\n"), &[])
            .unwrap_err();
        assert!(matches!(err, SinkError::UnknownImplementation(name) if name == "pulsar"));
    }

    #[test]
    fn kafka_factory_requires_bootstrap_servers() {
        let registry = ConsumerFactoryRegistry::with_defaults();
        let err = registry
            .create("kafka", &settings(""), &["t".to_string()])
            .unwrap_err();
        assert!(matches!(
            err,
            SinkError::Config(ConfigError::MissingKey(key)) if key == "kafka.bootstrap.servers"
        ));
    }

    #[test]
    fn default_registry_knows_kafka() {
        let registry = ConsumerFactoryRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["kafka"]);
    }
}
