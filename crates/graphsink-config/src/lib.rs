//! # graphsink configuration
//!
//! Configuration handling for the graphsink service: snapshots of the
//! effective key/value configuration, a polling file watcher that emits new
//! snapshots on change, the parsed sink settings, and the change detector
//! that decides whether a configuration change warrants a pipeline restart.

#![warn(clippy::all, clippy::pedantic)]

pub mod diff;
pub mod error;
pub mod keys;
pub mod settings;
pub mod snapshot;
pub mod topics;
pub mod watcher;

pub use diff::{restart_decision, RestartDecision};
pub use error::ConfigError;
pub use settings::{ErrorPolicy, SinkSettings};
pub use snapshot::ConfigurationSnapshot;
pub use topics::TopicDefinitions;
pub use watcher::{ConfigWatcher, ConfigWatcherHandle};
