//! Graph write seam.
//!
//! Strategies produce [`CypherStatement`]s; a [`GraphWriter`] applies them
//! to whatever graph backend the process embeds. The engine in between
//! resolves the topic's strategy and keeps the counters honest.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::event::SinkEvent;
use crate::metrics::SinkMetrics;
use crate::registry::TopicRegistry;

/// One parameterized Cypher statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CypherStatement {
    /// Query text.
    pub query: String,
    /// Parameter map, always a JSON object.
    pub parameters: Value,
}

impl CypherStatement {
    /// Statement whose only parameter is an `events` batch list.
    #[must_use]
    pub fn new(query: impl Into<String>, events: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            parameters: json!({ "events": events }),
        }
    }

    /// Statement with an explicit parameter object.
    #[must_use]
    pub fn with_parameters(query: impl Into<String>, parameters: Value) -> Self {
        Self {
            query: query.into(),
            parameters,
        }
    }
}

/// Applies statements to a graph database.
///
/// All statements of one call belong to one consumed batch and should be
/// applied in order, ideally in a single transaction.
#[async_trait]
pub trait GraphWriter: Send + Sync {
    /// Executes `statements` against the graph.
    async fn write(&self, database: &str, statements: &[CypherStatement]) -> Result<(), SinkError>;
}

/// Collects statements instead of executing them. For tests and for
/// running the sink without a graph backend attached.
#[derive(Debug, Default)]
pub struct InMemoryGraphWriter {
    written: tokio::sync::Mutex<Vec<CypherStatement>>,
}

impl InMemoryGraphWriter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything written so far, in execution order.
    pub async fn written(&self) -> Vec<CypherStatement> {
        self.written.lock().await.clone()
    }
}

#[async_trait]
impl GraphWriter for InMemoryGraphWriter {
    async fn write(&self, _database: &str, statements: &[CypherStatement]) -> Result<(), SinkError> {
        self.written.lock().await.extend_from_slice(statements);
        Ok(())
    }
}

/// Resolves strategies and drives the writer.
pub struct QueryEngine {
    database: String,
    registry: Arc<TopicRegistry>,
    writer: Arc<dyn GraphWriter>,
    metrics: Arc<SinkMetrics>,
}

impl QueryEngine {
    #[must_use]
    pub fn new(
        database: impl Into<String>,
        registry: Arc<TopicRegistry>,
        writer: Arc<dyn GraphWriter>,
        metrics: Arc<SinkMetrics>,
    ) -> Self {
        Self {
            database: database.into(),
            registry,
            writer,
            metrics,
        }
    }

    /// Applies a batch of events from one topic.
    ///
    /// Events on a topic with no registered strategy are dropped silently;
    /// subscription and registration are built from the same definitions,
    /// so this only happens in a brief window around a restart.
    ///
    /// Returns the number of events applied.
    ///
    /// # Errors
    ///
    /// Propagates translation and write failures without committing any
    /// counter beyond `failed`.
    pub async fn process(&self, topic: &str, events: &[SinkEvent]) -> Result<usize, SinkError> {
        let Some(strategy) = self.registry.strategy_for(topic) else {
            debug!(topic, count = events.len(), "no strategy for topic, dropping batch");
            return Ok(0);
        };

        let statements = match strategy.build(events) {
            Ok(statements) => statements,
            Err(e) => {
                self.metrics.record_failed(events.len() as u64);
                return Err(e);
            }
        };
        if statements.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.writer.write(&self.database, &statements).await {
            self.metrics.record_failed(events.len() as u64);
            warn!(topic, error = %e, "graph write failed");
            return Err(e);
        }
        self.metrics.record_applied(events.len() as u64);
        Ok(events.len())
    }

    /// Applies a single event, for per-event error routing.
    ///
    /// # Errors
    ///
    /// Same as [`Self::process`], scoped to one event.
    pub async fn process_single(&self, event: &SinkEvent) -> Result<(), SinkError> {
        self.process(&event.topic, std::slice::from_ref(event))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsink_config::TopicDefinitions;
    use serde_json::json;

    fn engine_with(writer: Arc<InMemoryGraphWriter>) -> QueryEngine {
        let mut definitions = TopicDefinitions::default();
        definitions
            .cypher
            .insert("orders".to_string(), "MERGE (o:Order {id: event.id})".to_string());
        let registry = Arc::new(TopicRegistry::new());
        registry.replace(&definitions).unwrap();
        QueryEngine::new("graph", registry, writer, Arc::new(SinkMetrics::default()))
    }

    #[tokio::test]
    async fn applies_batch_through_writer() {
        let writer = InMemoryGraphWriter::new();
        let engine = engine_with(writer.clone());
        let events = vec![SinkEvent::new("orders", 0, json!({"id": 1}))];
        assert_eq!(engine.process("orders", &events).await.unwrap(), 1);
        assert_eq!(writer.written().await.len(), 1);
    }

    #[tokio::test]
    async fn unassigned_topic_is_dropped_silently() {
        let writer = InMemoryGraphWriter::new();
        let engine = engine_with(writer.clone());
        let events = vec![SinkEvent::new("unknown", 0, json!({"id": 1}))];
        assert_eq!(engine.process("unknown", &events).await.unwrap(), 0);
        assert!(writer.written().await.is_empty());
    }
}
