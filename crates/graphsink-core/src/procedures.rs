//! Control and read procedures for the running sink.
//!
//! These are the operations an operator calls against a live process:
//! start/stop/restart the pipeline, inspect status and effective
//! configuration, and ad-hoc consume a topic. On a clustered deployment
//! only the writeable instance acts; every other instance answers with an
//! informational record instead of failing the call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use graphsink_config::{ConfigError, SinkSettings};

use crate::cluster::LeaderGate;
use crate::error::SinkError;
use crate::event::SinkEvent;
use crate::lifecycle::{SinkContext, SinkLifecycleManager};

/// Default ad-hoc consume window.
const CONSUME_TIMEOUT_DEFAULT: Duration = Duration::from_millis(1000);

/// Longest single wait inside the consume loop, so a dropped stream is
/// noticed promptly.
const CONSUME_POLL_SLICE: Duration = Duration::from_millis(100);

/// Buffered events between the consume task and the reader.
const CONSUME_BUFFER: usize = 1000;

/// One name/value row of procedure output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub name: String,
    pub value: String,
}

impl KeyValue {
    fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Finite stream of ad-hoc consumed events.
///
/// The producing task stops at the timeout or when the stream is dropped;
/// either way the channel closes and [`next`](Self::next) returns `None`.
pub struct ConsumeStream {
    rx: mpsc::Receiver<SinkEvent>,
}

impl ConsumeStream {
    fn empty() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self { rx }
    }

    /// Next consumed event, `None` at end of stream.
    pub async fn next(&mut self) -> Option<SinkEvent> {
        self.rx.recv().await
    }

    /// Drains the stream to completion.
    pub async fn drain(mut self) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// The sink's externally callable control surface.
pub struct ProcedureFacade {
    manager: Arc<SinkLifecycleManager>,
    context: SinkContext,
    gate: LeaderGate,
}

impl ProcedureFacade {
    #[must_use]
    pub fn new(manager: Arc<SinkLifecycleManager>, context: SinkContext) -> Self {
        let gate = LeaderGate::new(context.cluster.clone());
        Self {
            manager,
            context,
            gate,
        }
    }

    /// Rebuilds and starts the pipeline from the current configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::ProceduresDisabled`] when the facade is turned
    /// off. Start failures are reported as records, not errors.
    pub async fn start(&self) -> Result<Vec<KeyValue>, SinkError> {
        self.guard().await?;
        if let Some(records) = self.read_only_records() {
            return Ok(records);
        }
        match self.manager.start().await {
            Ok(()) => Ok(self.status_records()),
            Err(e) => {
                let mut records = self.status_records();
                records.push(KeyValue::new("exception", e.to_string()));
                Ok(records)
            }
        }
    }

    /// Stops the pipeline, keeping its status queryable.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::ProceduresDisabled`] when the facade is turned
    /// off.
    pub async fn stop(&self) -> Result<Vec<KeyValue>, SinkError> {
        self.guard().await?;
        if let Some(records) = self.read_only_records() {
            return Ok(records);
        }
        self.manager.stop().await;
        Ok(self.status_records())
    }

    /// Stop followed by a fresh start.
    ///
    /// # Errors
    ///
    /// Same as [`Self::start`].
    pub async fn restart(&self) -> Result<Vec<KeyValue>, SinkError> {
        self.guard().await?;
        if let Some(records) = self.read_only_records() {
            return Ok(records);
        }
        self.manager.stop().await;
        match self.manager.start().await {
            Ok(()) => Ok(self.status_records()),
            Err(e) => {
                let mut records = self.status_records();
                records.push(KeyValue::new("exception", e.to_string()));
                Ok(records)
            }
        }
    }

    /// Pipeline status plus counters.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::ProceduresDisabled`] when the facade is turned
    /// off.
    pub async fn status(&self) -> Result<Vec<KeyValue>, SinkError> {
        self.guard().await?;
        if let Some(records) = self.read_only_records() {
            return Ok(records);
        }
        Ok(self.status_records())
    }

    /// Effective configuration and topic assignments.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::ProceduresDisabled`] when the facade is turned
    /// off.
    pub async fn config(&self) -> Result<Vec<KeyValue>, SinkError> {
        self.guard().await?;
        if let Some(records) = self.read_only_records() {
            return Ok(records);
        }
        let mut records = Vec::new();
        if let Some(settings) = self.manager.current_settings().await {
            for (name, value) in settings.as_pairs() {
                records.push(KeyValue::new(name, value));
            }
        }
        for (topic, kind) in self.context.topics.assignments() {
            records.push(KeyValue::new(format!("topic.{topic}"), kind));
        }
        Ok(records)
    }

    /// Ad-hoc consumes `topic` for a bounded window, independent of the
    /// pipeline.
    ///
    /// `options` override the effective configuration for this call only
    /// (short key aliases allowed); the special key `timeout` bounds the
    /// window in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for unusable options and
    /// [`SinkError::ProceduresDisabled`] when the facade is turned off.
    pub async fn consume(
        &self,
        topic: &str,
        mut options: BTreeMap<String, String>,
    ) -> Result<ConsumeStream, SinkError> {
        self.guard().await?;
        if topic.trim().is_empty() {
            return Ok(ConsumeStream::empty());
        }

        let timeout = match options.remove("timeout") {
            None => CONSUME_TIMEOUT_DEFAULT,
            Some(raw) => Duration::from_millis(raw.parse().map_err(|_| {
                SinkError::Config(ConfigError::InvalidValue {
                    key: "timeout".to_string(),
                    value: raw,
                    reason: "expected a millisecond count".to_string(),
                })
            })?),
        };

        let base = self
            .manager
            .current_settings()
            .await
            .map(|s| s.snapshot)
            .unwrap_or_default();
        let merged = base.merged_with(options);
        let settings = SinkSettings::from_snapshot(&merged, self.manager.database())?;
        let mut consumer = self.context.factories.create(
            &settings.implementation,
            &settings,
            &[topic.to_string()],
        )?;

        let (tx, rx) = mpsc::channel(CONSUME_BUFFER);
        let topic = topic.to_string();
        tokio::spawn(async move {
            if let Err(e) = consumer.start().await {
                warn!(topic, error = %e, "ad-hoc consume failed to start");
                return;
            }
            let deadline = Instant::now() + timeout;
            'consume: loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match consumer.poll(remaining.min(CONSUME_POLL_SLICE)).await {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                // Reader went away; stop consuming.
                                break 'consume;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(topic, error = %e, "ad-hoc consume failed");
                        break;
                    }
                }
            }
            consumer.stop().await;
        });
        Ok(ConsumeStream { rx })
    }

    async fn guard(&self) -> Result<(), SinkError> {
        let enabled = self
            .manager
            .current_settings()
            .await
            .map_or(true, |s| s.procedures_enabled);
        if enabled {
            Ok(())
        } else {
            Err(SinkError::ProceduresDisabled)
        }
    }

    /// `Some` with an informational record when this instance must not
    /// mutate the sink.
    fn read_only_records(&self) -> Option<Vec<KeyValue>> {
        if self.gate.is_writeable(self.manager.database()) {
            return None;
        }
        Some(vec![KeyValue::new(
            "error",
            "You can use this procedure only on the leader or in a \
             single instance configuration.",
        )])
    }

    fn status_records(&self) -> Vec<KeyValue> {
        let mut records = vec![KeyValue::new("status", self.manager.status().as_str())];
        if let Some(pipeline) = self.context.registry.get(self.manager.database()) {
            let metrics = pipeline.metrics();
            records.push(KeyValue::new("events.received", metrics.received.to_string()));
            records.push(KeyValue::new("events.applied", metrics.applied.to_string()));
            records.push(KeyValue::new("events.failed", metrics.failed.to_string()));
            records.push(KeyValue::new(
                "events.dead_lettered",
                metrics.dead_lettered.to_string(),
            ));
        }
        records
    }
}
