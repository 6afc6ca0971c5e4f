//! Configuration-driven sink lifecycle.
//!
//! The lifecycle manager owns the reconciliation loop: every configuration
//! snapshot is compared against the last applied one, and on a relevant
//! change the running pipeline is torn down and a fresh one is built from
//! scratch. Pipelines are never reconfigured in place.
//!
//! Reconciliation never propagates errors to the watcher: a broken
//! configuration leaves the sink stopped and logged, and the next edit
//! gets a clean attempt.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{info, warn};

use graphsink_config::{
    restart_decision, ConfigurationSnapshot, RestartDecision, SinkSettings,
};

use crate::cluster::{ClusterView, Eligibility, LeaderGate};
use crate::consumer::ConsumerFactoryRegistry;
use crate::dlq::{DeadLetterDestination, KafkaDeadLetters};
use crate::error::SinkError;
use crate::graph::{GraphWriter, QueryEngine};
use crate::metrics::SinkMetrics;
use crate::pipeline::{PipelineStatus, SinkPipeline};
use crate::registry::TopicRegistry;

/// Database → current pipeline handle.
///
/// Shared with the procedure facade so external callers always resolve
/// the pipeline the last reconciliation produced.
#[derive(Default)]
pub struct SinkRegistry {
    pipelines: RwLock<HashMap<String, Arc<SinkPipeline>>>,
}

impl SinkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `pipeline` as the current one for its database,
    /// superseding any previous handle.
    pub fn insert(&self, pipeline: Arc<SinkPipeline>) {
        self.pipelines
            .write()
            .expect("registry lock poisoned")
            .insert(pipeline.database().to_string(), pipeline);
    }

    #[must_use]
    pub fn get(&self, database: &str) -> Option<Arc<SinkPipeline>> {
        self.pipelines
            .read()
            .expect("registry lock poisoned")
            .get(database)
            .cloned()
    }

    pub fn remove(&self, database: &str) -> Option<Arc<SinkPipeline>> {
        self.pipelines
            .write()
            .expect("registry lock poisoned")
            .remove(database)
    }

    /// Status of the registered pipeline, `Unknown` when there is none.
    #[must_use]
    pub fn status(&self, database: &str) -> PipelineStatus {
        self.get(database)
            .map_or(PipelineStatus::Unknown, |p| p.status())
    }
}

/// Everything a lifecycle manager needs injected.
#[derive(Clone)]
pub struct SinkContext {
    /// Shared pipeline registry.
    pub registry: Arc<SinkRegistry>,
    /// Consumer implementations by name.
    pub factories: Arc<ConsumerFactoryRegistry>,
    /// Shared topic strategy table.
    pub topics: Arc<TopicRegistry>,
    /// Graph backend.
    pub writer: Arc<dyn GraphWriter>,
    /// Topology view.
    pub cluster: Arc<dyn ClusterView>,
    /// Dead-letter destination override; when `None` a Kafka destination
    /// is built from the settings on demand.
    pub dead_letters: Option<Arc<dyn DeadLetterDestination>>,
}

struct LifecycleState {
    last_applied: Option<ConfigurationSnapshot>,
    settings: Option<SinkSettings>,
}

/// Reconciles the sink for one database against configuration changes.
pub struct SinkLifecycleManager {
    database: String,
    context: SinkContext,
    gate: LeaderGate,
    state: Mutex<LifecycleState>,
}

impl SinkLifecycleManager {
    #[must_use]
    pub fn new(database: impl Into<String>, context: SinkContext) -> Self {
        let gate = LeaderGate::new(context.cluster.clone());
        Self {
            database: database.into(),
            context,
            gate,
            state: Mutex::new(LifecycleState {
                last_applied: None,
                settings: None,
            }),
        }
    }

    /// Handles one configuration snapshot from the watcher.
    ///
    /// Never returns an error: reconciliation failures are logged and the
    /// sink is left stopped until the next change.
    pub async fn on_configuration_change(&self, snapshot: ConfigurationSnapshot) {
        let mut state = self.state.lock().await;
        let known = self.context.factories.names();
        match restart_decision(&snapshot, state.last_applied.as_ref(), &known) {
            RestartDecision::Skip => {}
            RestartDecision::Unchanged => {
                info!(database = %self.database, "configuration unchanged, sink kept running");
            }
            RestartDecision::Restart => {
                if let Err(e) = self.apply(&mut state, snapshot).await {
                    warn!(database = %self.database, error = %e, "cannot start the sink module");
                }
            }
        }
    }

    /// Rebuilds the pipeline from the last applied configuration. This is
    /// the procedure facade's start/restart path.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Pipeline`] when no configuration was ever
    /// applied, or whatever the rebuild itself fails with.
    pub async fn start(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        let Some(snapshot) = state.last_applied.clone() else {
            return Err(SinkError::Pipeline(
                "no configuration applied yet".to_string(),
            ));
        };
        self.apply(&mut state, snapshot).await
    }

    /// Stops the registered pipeline, keeping its handle for status
    /// queries. Idempotent.
    pub async fn stop(&self) {
        let _state = self.state.lock().await;
        self.shutdown_registered(false).await;
    }

    /// Stops the registered pipeline for process shutdown.
    pub async fn shutdown_for_close(&self) {
        let _state = self.state.lock().await;
        self.shutdown_registered(true).await;
    }

    /// Settings produced by the last applied configuration.
    pub async fn current_settings(&self) -> Option<SinkSettings> {
        self.state.lock().await.settings.clone()
    }

    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        self.context.registry.status(&self.database)
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    async fn apply(
        &self,
        state: &mut LifecycleState,
        snapshot: ConfigurationSnapshot,
    ) -> Result<(), SinkError> {
        self.shutdown_registered(false).await;

        let settings = match SinkSettings::from_snapshot(&snapshot, &self.database) {
            Ok(settings) => settings,
            Err(e) => {
                // Remember the broken snapshot so an identical re-read does
                // not retrigger the same failure on every poll.
                state.last_applied = Some(snapshot);
                return Err(e.into());
            }
        };
        state.last_applied = Some(snapshot);
        state.settings = Some(settings.clone());

        self.context.topics.replace(&settings.topics)?;

        if !settings.enabled {
            info!(database = %self.database, "sink disabled by configuration");
            return Ok(());
        }
        match self.gate.eligibility(&self.database, settings.cluster_only) {
            Eligibility::Eligible => {}
            Eligibility::NotLeader => {
                info!(
                    database = %self.database,
                    "not the leader for this database, sink not started"
                );
                return Ok(());
            }
            Eligibility::ClusterOnlyViolation => {
                warn!(
                    database = %self.database,
                    "streams.cluster.only is set but this instance is standalone, sink not started"
                );
                return Ok(());
            }
        }
        let subscription = self.context.topics.topics();
        if subscription.is_empty() {
            info!(database = %self.database, "no topics configured, sink idle");
            return Ok(());
        }

        let available = self
            .gate
            .wait_until_available(
                &self.database,
                settings.instance_wait_timeout,
                settings.writeable_check_interval,
            )
            .await;
        if !available {
            return Err(SinkError::Pipeline(format!(
                "database '{}' did not become available within {:?}",
                self.database, settings.instance_wait_timeout
            )));
        }

        let consumer =
            self.context
                .factories
                .create(&settings.implementation, &settings, &subscription)?;
        let dead_letters = match &self.context.dead_letters {
            Some(destination) => Some(destination.clone()),
            None => KafkaDeadLetters::from_settings(&settings)?
                .map(|d| Arc::new(d) as Arc<dyn DeadLetterDestination>),
        };
        let metrics = Arc::new(SinkMetrics::default());
        let engine = Arc::new(QueryEngine::new(
            self.database.clone(),
            self.context.topics.clone(),
            self.context.writer.clone(),
            metrics.clone(),
        ));
        let pipeline = Arc::new(SinkPipeline::new(
            &settings,
            consumer,
            engine,
            dead_letters,
            metrics,
        ));

        if let Err(e) = pipeline.start().await {
            self.context.registry.remove(&self.database);
            return Err(e);
        }
        self.context.registry.insert(pipeline);
        info!(
            database = %self.database,
            topics = subscription.len(),
            implementation = %settings.implementation,
            "sink reconciled and started"
        );
        Ok(())
    }

    /// Stops the registered pipeline if it is running. Logs the transition
    /// exactly once; repeated shutdowns of an already stopped sink are
    /// silent.
    async fn shutdown_registered(&self, close: bool) {
        let Some(pipeline) = self.context.registry.get(&self.database) else {
            return;
        };
        if pipeline.status() != PipelineStatus::Running {
            if close && pipeline.status() != PipelineStatus::Closed {
                pipeline.stop(true).await;
            }
            return;
        }
        info!(database = %self.database, "sink shutting down");
        pipeline.stop(close).await;
        info!(database = %self.database, "sink shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CypherStatement, InMemoryGraphWriter};
    use async_trait::async_trait;

    struct NullWriter;

    #[async_trait]
    impl GraphWriter for NullWriter {
        async fn write(
            &self,
            _database: &str,
            _statements: &[CypherStatement],
        ) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn registry_supersedes_by_database() {
        let registry = SinkRegistry::new();
        assert_eq!(registry.status("graph"), PipelineStatus::Unknown);
        assert!(registry.get("graph").is_none());
    }

    #[tokio::test]
    async fn start_without_configuration_fails() {
        let context = SinkContext {
            registry: Arc::new(SinkRegistry::new()),
            factories: Arc::new(ConsumerFactoryRegistry::new()),
            topics: Arc::new(TopicRegistry::new()),
            writer: Arc::new(NullWriter),
            cluster: Arc::new(crate::cluster::SingleInstance),
            dead_letters: None,
        };
        let manager = SinkLifecycleManager::new("graph", context);
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, SinkError::Pipeline(_)));
    }

    #[tokio::test]
    async fn broken_configuration_is_logged_not_propagated() {
        let writer = InMemoryGraphWriter::new();
        let context = SinkContext {
            registry: Arc::new(SinkRegistry::new()),
            factories: Arc::new(ConsumerFactoryRegistry::with_defaults()),
            topics: Arc::new(TopicRegistry::new()),
            writer,
            cluster: Arc::new(crate::cluster::SingleInstance),
            dead_letters: None,
        };
        let manager = SinkLifecycleManager::new("graph", context);

        // dlq policy without a topic is a parse error.
        let snapshot = ConfigurationSnapshot::from_properties("streams.sink.errors=dlq\n");
        manager.on_configuration_change(snapshot).await;
        assert_eq!(manager.status(), PipelineStatus::Unknown);
        assert_eq!(manager.current_settings().await.map(|s| s.enabled), None);
    }
}
