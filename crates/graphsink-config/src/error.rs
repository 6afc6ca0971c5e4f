//! Error types for configuration loading and parsing.

use thiserror::Error;

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration file '{path}': {source}")]
    Io {
        /// Path that failed to load.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A recognized key carries a value that cannot be parsed.
    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Raw value as read from the configuration.
        value: String,
        /// What the parser expected.
        reason: String,
    },

    /// A topic was assigned to more than one ingestion strategy.
    #[error("topic '{0}' is mapped to more than one strategy")]
    DuplicateTopic(String),

    /// A required key is missing.
    #[error("missing required configuration key '{0}'")]
    MissingKey(String),
}
