//! The sink pipeline: consume, translate, write, commit.
//!
//! A pipeline is built for one configuration and runs until stopped; a
//! configuration change never mutates a running pipeline, it builds a new
//! one. Start consumes the injected consumer, so a pipeline object can
//! only go through its lifecycle once.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use graphsink_config::{ErrorPolicy, SinkSettings};

use crate::consumer::EventConsumer;
use crate::dlq::{DeadLetterDestination, DeadLetterRecord};
use crate::error::SinkError;
use crate::event::SinkEvent;
use crate::graph::QueryEngine;
use crate::metrics::{MetricsSnapshot, SinkMetrics};

/// How long a stop waits for the consume loop to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Externally visible pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineStatus {
    /// Built but never started, or no pipeline registered at all.
    Unknown = 0,
    /// Consume loop is running.
    Running = 1,
    /// Stopped; a new pipeline may take its place.
    Stopped = 2,
    /// Stopped for process shutdown; nothing will replace it.
    Closed = 3,
}

impl PipelineStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Stopped,
            3 => Self::Closed,
            _ => Self::Unknown,
        }
    }

    /// Lowercase name for status records and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Default)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn get(&self) -> PipelineStatus {
        PipelineStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, status: PipelineStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

struct PipelineInner {
    consumer: Option<Box<dyn EventConsumer>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// One consume-and-write pipeline for one database.
pub struct SinkPipeline {
    database: String,
    poll_interval: Duration,
    error_policy: ErrorPolicy,
    status: Arc<StatusCell>,
    metrics: Arc<SinkMetrics>,
    engine: Arc<QueryEngine>,
    dead_letters: Option<Arc<dyn DeadLetterDestination>>,
    inner: Mutex<PipelineInner>,
}

impl SinkPipeline {
    /// Builds an unstarted pipeline around `consumer`.
    #[must_use]
    pub fn new(
        settings: &SinkSettings,
        consumer: Box<dyn EventConsumer>,
        engine: Arc<QueryEngine>,
        dead_letters: Option<Arc<dyn DeadLetterDestination>>,
        metrics: Arc<SinkMetrics>,
    ) -> Self {
        Self {
            database: settings.database.clone(),
            poll_interval: settings.poll_interval,
            error_policy: settings.error_policy,
            status: Arc::new(StatusCell::default()),
            metrics,
            engine,
            dead_letters,
            inner: Mutex::new(PipelineInner {
                consumer: Some(consumer),
                shutdown: None,
                task: None,
            }),
        }
    }

    /// Starts the consume loop.
    ///
    /// Calling start on a pipeline that is already running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Pipeline`] when this pipeline already ran its
    /// lifecycle, or the consumer's own start failure. Either way no loop
    /// is left behind.
    pub async fn start(&self) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().await;
        if self.status.get() == PipelineStatus::Running {
            return Ok(());
        }
        let mut consumer = inner.consumer.take().ok_or_else(|| {
            SinkError::Pipeline("pipeline already ran; build a new one".to_string())
        })?;

        if let Err(e) = consumer.start().await {
            self.status.set(PipelineStatus::Stopped);
            return Err(e);
        }
        for topic in consumer.invalid_topics() {
            warn!(database = %self.database, topic, "subscribed topic does not exist");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            consumer,
            self.engine.clone(),
            self.error_policy,
            self.poll_interval,
            self.dead_letters.clone(),
            self.metrics.clone(),
            self.status.clone(),
            self.database.clone(),
            shutdown_rx,
        ));
        inner.shutdown = Some(shutdown_tx);
        inner.task = Some(task);
        self.status.set(PipelineStatus::Running);
        info!(database = %self.database, "sink pipeline started");
        Ok(())
    }

    /// Stops the consume loop and marks the pipeline [`PipelineStatus::Stopped`],
    /// or [`PipelineStatus::Closed`] when `close` is set.
    pub async fn stop(&self, close: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(shutdown) = inner.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = inner.task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!(database = %self.database, "consume loop did not stop in time");
            }
        }
        if close {
            // A closed pipeline will never be restarted; release the
            // consumer if start was never called.
            inner.consumer = None;
        }
        self.status.set(if close {
            PipelineStatus::Closed
        } else {
            PipelineStatus::Stopped
        });
    }

    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        self.status.get()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut consumer: Box<dyn EventConsumer>,
    engine: Arc<QueryEngine>,
    error_policy: ErrorPolicy,
    poll_interval: Duration,
    dead_letters: Option<Arc<dyn DeadLetterDestination>>,
    metrics: Arc<SinkMetrics>,
    status: Arc<StatusCell>,
    database: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            batch = consumer.poll(poll_interval) => batch,
        };
        let events = match batch {
            Ok(events) => events,
            Err(e) => {
                warn!(database = %database, error = %e, "consume failed, retrying");
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    () = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            }
        };
        if events.is_empty() {
            continue;
        }

        metrics.record_received(events.len() as u64);
        metrics.record_batch();
        let applied = apply_batch(
            &engine,
            error_policy,
            dead_letters.as_deref(),
            &metrics,
            events,
        )
        .await;
        if applied {
            if let Err(e) = consumer.commit().await {
                warn!(database = %database, error = %e, "offset commit failed");
            }
        } else {
            // A later commit would cover the failed batch's offsets too,
            // so the loop must not keep consuming past the failure.
            warn!(database = %database, "batch failed, stopping pipeline");
            status.set(PipelineStatus::Stopped);
            break;
        }
    }
    consumer.stop().await;
}

/// Applies one batch. Returns `true` when its offsets may be committed.
async fn apply_batch(
    engine: &QueryEngine,
    error_policy: ErrorPolicy,
    dead_letters: Option<&dyn DeadLetterDestination>,
    metrics: &SinkMetrics,
    events: Vec<SinkEvent>,
) -> bool {
    for (topic, events) in group_by_topic(events) {
        match error_policy {
            ErrorPolicy::Fail => {
                if let Err(e) = engine.process(&topic, &events).await {
                    warn!(topic, error = %e, "batch failed, offsets stay uncommitted");
                    return false;
                }
            }
            ErrorPolicy::DeadLetter => {
                for event in &events {
                    let Err(e) = engine.process_single(event).await else {
                        continue;
                    };
                    match dead_letters {
                        Some(destination) => {
                            let record = DeadLetterRecord::from_event(event, &e);
                            if let Err(publish_error) = destination.publish(record).await {
                                warn!(
                                    topic,
                                    error = %publish_error,
                                    "dead-letter publish failed, dropping record"
                                );
                            } else {
                                metrics.record_dead_lettered(1);
                            }
                        }
                        None => {
                            warn!(topic, error = %e, "no dead-letter destination, dropping record");
                        }
                    }
                }
            }
        }
    }
    true
}

/// Groups a batch by topic, keeping first-seen topic order and the event
/// order within each topic.
fn group_by_topic(events: Vec<SinkEvent>) -> Vec<(String, Vec<SinkEvent>)> {
    let mut groups: Vec<(String, Vec<SinkEvent>)> = Vec::new();
    for event in events {
        match groups.iter_mut().find(|(topic, _)| *topic == event.topic) {
            Some((_, group)) => group.push(event),
            None => groups.push((event.topic.clone(), vec![event])),
        }
    }
    groups
}
