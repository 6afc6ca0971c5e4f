//! Error types for the sink module.

use thiserror::Error;

/// Errors raised by the sink pipeline, strategies and control surface.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Configuration could not be parsed.
    #[error(transparent)]
    Config(#[from] graphsink_config::ConfigError),

    /// The configured sink implementation is not registered.
    #[error("unknown sink implementation '{0}'")]
    UnknownImplementation(String),

    /// A topic pattern definition could not be parsed.
    #[error("invalid pattern '{pattern}' for topic '{topic}': {reason}")]
    InvalidPattern {
        /// Topic the pattern was configured for.
        topic: String,
        /// Pattern text as configured.
        pattern: String,
        /// What the parser expected.
        reason: String,
    },

    /// A consumed event does not match the shape its strategy expects.
    #[error("invalid event on topic '{topic}': {reason}")]
    InvalidEvent {
        /// Topic the event came from.
        topic: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Transport-level failure (broker unreachable, consume error, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// A graph write failed.
    #[error("graph write failed: {0}")]
    GraphWrite(String),

    /// Pipeline lifecycle violation or start/stop failure.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// The procedure facade is disabled by configuration.
    #[error("procedures are disabled; set streams.procedures.enabled=true to use them")]
    ProceduresDisabled,
}
