//! Parsed sink settings for one database.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::keys;
use crate::snapshot::ConfigurationSnapshot;
use crate::topics::TopicDefinitions;

/// What to do when applying a consumed message to the graph fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Abort the current batch on the first failure; offsets for the batch
    /// are not committed.
    #[default]
    Fail,
    /// Attempt every message; route failures to the dead-letter topic.
    DeadLetter,
}

/// The sink module's view of a configuration snapshot, parsed and typed.
///
/// Built fresh from every snapshot the reconciliation applies; the
/// snapshot itself is retained for change detection and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSettings {
    /// Database this sink writes to.
    pub database: String,
    /// Whether the sink module should run at all.
    pub enabled: bool,
    /// Whether the procedure facade is enabled.
    pub procedures_enabled: bool,
    /// Whether the module must refuse to run outside a cluster.
    pub cluster_only: bool,
    /// Startup wait for instance readiness.
    pub instance_wait_timeout: Duration,
    /// Startup wait for the metadata store.
    pub system_db_wait_timeout: Duration,
    /// Interval between leader/availability readiness checks.
    pub writeable_check_interval: Duration,
    /// Interval between consumer polls.
    pub poll_interval: Duration,
    /// Sink implementation name, resolved via the factory registry.
    pub implementation: String,
    /// Write-error policy.
    pub error_policy: ErrorPolicy,
    /// Dead-letter topic; present iff the policy is [`ErrorPolicy::DeadLetter`].
    pub dlq_topic: Option<String>,
    /// Topic-to-strategy assignments.
    pub topics: TopicDefinitions,
    /// Transport properties handed through to the Kafka client.
    pub kafka_properties: BTreeMap<String, String>,
    /// The snapshot these settings were parsed from.
    pub snapshot: ConfigurationSnapshot,
}

impl SinkSettings {
    /// Parses settings for `database` out of a snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for malformed values, duplicate topic
    /// assignments, or a dead-letter policy without a topic.
    pub fn from_snapshot(
        snapshot: &ConfigurationSnapshot,
        database: &str,
    ) -> Result<Self, ConfigError> {
        let global_enabled = snapshot.get_bool(keys::SINK_ENABLED, false);
        let enabled = snapshot.get_bool(
            &format!("{}{database}", keys::SINK_ENABLED_TO_PREFIX),
            global_enabled,
        );
        let procedures_global = snapshot.get_bool(keys::PROCEDURES_ENABLED, true);
        let procedures_enabled = snapshot.get_bool(
            &format!("{}{database}", keys::PROCEDURES_ENABLED_PREFIX),
            procedures_global,
        );

        let error_policy = match snapshot.get_or(keys::SINK_ERRORS, "fail") {
            "fail" => ErrorPolicy::Fail,
            "dlq" => ErrorPolicy::DeadLetter,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: keys::SINK_ERRORS.to_string(),
                    value: other.to_string(),
                    reason: "expected 'fail' or 'dlq'".to_string(),
                })
            }
        };
        let dlq_topic = snapshot.get(keys::SINK_ERRORS_DLQ_TOPIC).map(str::to_string);
        if error_policy == ErrorPolicy::DeadLetter && dlq_topic.is_none() {
            return Err(ConfigError::MissingKey(
                keys::SINK_ERRORS_DLQ_TOPIC.to_string(),
            ));
        }

        Ok(Self {
            database: database.to_string(),
            enabled,
            procedures_enabled,
            cluster_only: snapshot.get_bool(keys::CLUSTER_ONLY, false),
            instance_wait_timeout: Duration::from_millis(snapshot.get_millis(
                keys::INSTANCE_WAIT_TIMEOUT,
                keys::INSTANCE_WAIT_TIMEOUT_DEFAULT_MS,
            )?),
            system_db_wait_timeout: Duration::from_millis(snapshot.get_millis(
                keys::SYSTEM_DB_WAIT_TIMEOUT,
                keys::SYSTEM_DB_WAIT_TIMEOUT_DEFAULT_MS,
            )?),
            writeable_check_interval: Duration::from_millis(snapshot.get_millis(
                keys::WRITEABLE_CHECK_INTERVAL,
                keys::WRITEABLE_CHECK_INTERVAL_DEFAULT_MS,
            )?),
            poll_interval: Duration::from_millis(snapshot.get_millis(
                keys::SINK_POLL_INTERVAL,
                keys::SINK_POLL_INTERVAL_DEFAULT_MS,
            )?),
            implementation: snapshot
                .get_or(keys::SINK_IMPLEMENTATION, keys::SINK_IMPLEMENTATION_DEFAULT)
                .to_string(),
            error_policy,
            dlq_topic,
            topics: TopicDefinitions::from_snapshot(snapshot)?,
            kafka_properties: snapshot.with_prefix(keys::KAFKA_PREFIX),
            snapshot: snapshot.clone(),
        })
    }

    /// Effective configuration as name/value pairs, for diagnostics.
    #[must_use]
    pub fn as_pairs(&self) -> Vec<(String, String)> {
        self.snapshot
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
