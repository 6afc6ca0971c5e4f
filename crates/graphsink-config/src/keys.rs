//! Recognized configuration keys and key-renaming tables.
//!
//! All module settings live under the `streams.` namespace; transport
//! properties handed through to the Kafka client live under `kafka.`.
//! Short aliases accepted in procedure configs and in the properties file
//! are renamed to their fully qualified form by [`rename_aliases`].

use std::collections::BTreeMap;

/// Global sink enable flag (default `false`).
pub const SINK_ENABLED: &str = "streams.sink.enabled";
/// Per-database sink enable prefix: `streams.sink.enabled.to.<db>`.
pub const SINK_ENABLED_TO_PREFIX: &str = "streams.sink.enabled.to.";
/// Global source enable flag. Recognized but irrelevant to the sink module.
pub const SOURCE_ENABLED: &str = "streams.source.enabled";
/// Prefix covering every source-side key, all ignored by change detection.
pub const SOURCE_PREFIX: &str = "streams.source.";
/// Global procedures enable flag (default `true`).
pub const PROCEDURES_ENABLED: &str = "streams.procedures.enabled";
/// Per-database procedures enable prefix: `streams.procedures.enabled.<db>`.
pub const PROCEDURES_ENABLED_PREFIX: &str = "streams.procedures.enabled.";

/// When `true` the sink must never run outside a cluster.
pub const CLUSTER_ONLY: &str = "streams.cluster.only";
/// Milliseconds to wait for instance readiness at startup.
pub const INSTANCE_WAIT_TIMEOUT: &str = "streams.instance.wait.timeout";
/// Default for [`INSTANCE_WAIT_TIMEOUT`].
pub const INSTANCE_WAIT_TIMEOUT_DEFAULT_MS: u64 = 120_000;
/// Milliseconds to wait for the metadata store at startup.
pub const SYSTEM_DB_WAIT_TIMEOUT: &str = "streams.systemdb.wait.timeout";
/// Default for [`SYSTEM_DB_WAIT_TIMEOUT`].
pub const SYSTEM_DB_WAIT_TIMEOUT_DEFAULT_MS: u64 = 10_000;
/// Milliseconds between leader/availability readiness checks.
pub const WRITEABLE_CHECK_INTERVAL: &str = "streams.check.writeable.instance.interval";
/// Default for [`WRITEABLE_CHECK_INTERVAL`].
pub const WRITEABLE_CHECK_INTERVAL_DEFAULT_MS: u64 = 100;
/// Milliseconds between consumer polls in the sink pipeline.
pub const SINK_POLL_INTERVAL: &str = "streams.sink.poll.interval";
/// Default for [`SINK_POLL_INTERVAL`].
pub const SINK_POLL_INTERVAL_DEFAULT_MS: u64 = 100;

/// Sink implementation name, resolved through the consumer factory registry.
pub const SINK_IMPLEMENTATION: &str = "streams.sink";
/// Default sink implementation.
pub const SINK_IMPLEMENTATION_DEFAULT: &str = "kafka";

/// Write-error policy: `fail` (default) or `dlq`.
pub const SINK_ERRORS: &str = "streams.sink.errors";
/// Dead-letter topic, required when the error policy is `dlq`.
pub const SINK_ERRORS_DLQ_TOPIC: &str = "streams.sink.errors.deadletter.topic";

/// Cypher template strategy prefix: `streams.sink.topic.cypher.<topic>`.
pub const TOPIC_CYPHER_PREFIX: &str = "streams.sink.topic.cypher.";
/// Node pattern strategy prefix: `streams.sink.topic.pattern.node.<topic>`.
pub const TOPIC_PATTERN_NODE_PREFIX: &str = "streams.sink.topic.pattern.node.";
/// Relationship pattern strategy prefix.
pub const TOPIC_PATTERN_REL_PREFIX: &str = "streams.sink.topic.pattern.relationship.";
/// CDC schema strategy: semicolon-separated topic list.
pub const TOPIC_CDC_SCHEMA: &str = "streams.sink.topic.cdc.schema";
/// CDC source-id strategy: semicolon-separated topic list.
pub const TOPIC_CDC_SOURCE_ID: &str = "streams.sink.topic.cdc.sourceId";
/// CUD strategy: semicolon-separated topic list.
pub const TOPIC_CUD: &str = "streams.sink.topic.cud";

/// Prefix for transport properties handed through to the Kafka client.
pub const KAFKA_PREFIX: &str = "kafka.";

/// Environment variable holding the full path of the configuration file.
pub const CONF_FILE_ENV: &str = "STREAMS_CONF_FILE";
/// Environment variable holding the configuration directory.
pub const CONF_DIR_ENV: &str = "STREAMS_CONF";
/// File name looked up inside the configuration directory.
pub const CONF_FILE_NAME: &str = "streams.conf";

/// Short aliases accepted in procedure configs, with their qualified names.
const ALIASES: &[(&str, &str)] = &[
    ("broker", "kafka.bootstrap.servers"),
    ("from", "kafka.auto.offset.reset"),
    ("autoCommit", "kafka.enable.auto.commit"),
    ("groupId", "kafka.group.id"),
    ("schemaRegistryUrl", "kafka.schema.registry.url"),
];

/// Transport keys that only affect the producing (source) side.
///
/// The sink change detector ignores these: the Confluent-side producer
/// tuning cannot alter how consumed messages are applied to the graph.
const PRODUCER_ONLY: &[&str] = &[
    "kafka.transactional.id",
    "kafka.enable.idempotence",
    "kafka.acks",
    "kafka.linger.ms",
    "kafka.batch.size",
    "kafka.compression.type",
    "kafka.delivery.timeout.ms",
];

/// Returns the qualified form of `key`, resolving short aliases.
#[must_use]
pub fn qualify(key: &str) -> String {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map_or_else(|| key.to_string(), |(_, full)| (*full).to_string())
}

/// Renames every aliased key in `map` to its fully qualified form.
#[must_use]
pub fn rename_aliases(map: BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter().map(|(k, v)| (qualify(&k), v)).collect()
}

/// Returns `true` for keys the sink change detector must ignore.
#[must_use]
pub fn is_irrelevant_to_sink(key: &str) -> bool {
    key.starts_with(SOURCE_PREFIX) || PRODUCER_ONLY.contains(&key)
}
