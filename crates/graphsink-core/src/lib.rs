//! # graphsink core
//!
//! The sink engine: consumes events from a message transport, translates
//! them into Cypher through per-topic strategies, and applies them to a
//! graph database behind the [`graph::GraphWriter`] seam.
//!
//! The moving parts:
//!
//! - [`strategy`] and [`registry`]: how each topic's payloads become
//!   statements, and the atomically replaceable topic → strategy table.
//! - [`consumer`]: the transport seam and its Kafka implementation.
//! - [`pipeline`]: one consume-translate-write-commit loop per database.
//! - [`lifecycle`]: reconciliation of the pipeline against configuration
//!   snapshots, including leader gating on clustered deployments.
//! - [`procedures`]: the operator-facing control surface.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod event;
pub mod graph;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod procedures;
pub mod registry;
pub mod strategy;

pub use cluster::{ClusterView, Eligibility, LeaderGate, SingleInstance, StaticClusterView};
pub use consumer::{ConsumerFactory, ConsumerFactoryRegistry, EventConsumer};
pub use dlq::{DeadLetterDestination, DeadLetterRecord, InMemoryDeadLetters, KafkaDeadLetters};
pub use error::SinkError;
pub use event::SinkEvent;
pub use graph::{CypherStatement, GraphWriter, InMemoryGraphWriter, QueryEngine};
pub use lifecycle::{SinkContext, SinkLifecycleManager, SinkRegistry};
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use pipeline::{PipelineStatus, SinkPipeline};
pub use procedures::{ConsumeStream, KeyValue, ProcedureFacade};
pub use registry::TopicRegistry;
pub use strategy::TopicStrategy;
