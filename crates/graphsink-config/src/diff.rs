//! Change detection between configuration snapshots.
//!
//! On every configuration change the sink must decide whether the running
//! pipeline has to be torn down and rebuilt. Producer-side transport keys
//! and everything under the source namespace cannot affect how consumed
//! messages are applied, so they are stripped before comparing; the parsed
//! topic assignments are compared as well because two snapshots can differ
//! there while the raw maps stay equal under normalization.

use std::collections::BTreeMap;

use tracing::debug;

use crate::keys;
use crate::snapshot::ConfigurationSnapshot;
use crate::topics::TopicDefinitions;

/// Outcome of comparing an incoming snapshot to the last applied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Empty incoming snapshot: a transient or incomplete read, not a
    /// valid state. No action at all.
    Skip,
    /// Nothing sink-relevant changed; keep the current pipeline running.
    Unchanged,
    /// A sink-relevant difference was found; tear down and rebuild.
    Restart,
}

/// Decides whether `incoming` warrants a pipeline restart relative to
/// `last_applied` (`None` on first run).
///
/// `known_implementations` is the set of names the consumer factory
/// registry can resolve. An implementation name outside that set always
/// signals a restart: there is no way to reason about what it tracks, so
/// the conservative default applies.
#[must_use]
pub fn restart_decision(
    incoming: &ConfigurationSnapshot,
    last_applied: Option<&ConfigurationSnapshot>,
    known_implementations: &[&str],
) -> RestartDecision {
    if incoming.is_empty() {
        debug!("configuration snapshot is empty, ignoring");
        return RestartDecision::Skip;
    }

    let implementation =
        incoming.get_or(keys::SINK_IMPLEMENTATION, keys::SINK_IMPLEMENTATION_DEFAULT);
    if !known_implementations.contains(&implementation) {
        debug!(implementation, "unknown sink implementation, forcing restart");
        return RestartDecision::Restart;
    }

    let Some(last) = last_applied else {
        return RestartDecision::Restart;
    };

    if normalize(incoming) != normalize(last) {
        return RestartDecision::Restart;
    }

    // Topic definitions are derived from keys the normalization keeps, but
    // compare the parsed structure too: list-valued keys can reorder or
    // re-delimit without changing meaning, and vice versa.
    let incoming_topics = TopicDefinitions::from_snapshot(incoming);
    let last_topics = TopicDefinitions::from_snapshot(last);
    match (incoming_topics, last_topics) {
        (Ok(a), Ok(b)) if a == b => RestartDecision::Unchanged,
        _ => RestartDecision::Restart,
    }
}

/// Strips every key the sink does not care about.
fn normalize(snapshot: &ConfigurationSnapshot) -> BTreeMap<&str, &str> {
    snapshot
        .iter()
        .filter(|(k, _)| !keys::is_irrelevant_to_sink(k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: &[&str] = &["kafka"];

    fn snapshot(text: &str) -> ConfigurationSnapshot {
        ConfigurationSnapshot::from_properties(text)
    }

    #[test]
    fn identical_snapshots_never_restart() {
        let a = snapshot("streams.sink.enabled=true\nkafka.group.id=g\n");
        assert_eq!(
            restart_decision(&a, Some(&a.clone()), KNOWN),
            RestartDecision::Unchanged
        );
    }

    #[test]
    fn empty_snapshot_is_skipped() {
        let last = snapshot("streams.sink.enabled=true\n");
        assert_eq!(
            restart_decision(&ConfigurationSnapshot::default(), Some(&last), KNOWN),
            RestartDecision::Skip
        );
    }

    #[test]
    fn first_run_always_restarts() {
        let a = snapshot("streams.sink.enabled=true\n");
        assert_eq!(restart_decision(&a, None, KNOWN), RestartDecision::Restart);
    }

    #[test]
    fn producer_only_changes_are_ignored() {
        let last = snapshot("streams.sink.enabled=true\nkafka.acks=1\n");
        let incoming = snapshot(
            "streams.sink.enabled=true\nkafka.acks=all\nkafka.linger.ms=20\n",
        );
        assert_eq!(
            restart_decision(&incoming, Some(&last), KNOWN),
            RestartDecision::Unchanged
        );
    }

    #[test]
    fn source_namespace_changes_are_ignored() {
        let last = snapshot("streams.sink.enabled=true\nstreams.source.enabled=false\n");
        let incoming = snapshot(
            "streams.sink.enabled=true\nstreams.source.enabled=true\nstreams.source.topic.nodes=n\n",
        );
        assert_eq!(
            restart_decision(&incoming, Some(&last), KNOWN),
            RestartDecision::Unchanged
        );
    }

    #[test]
    fn topic_mapping_changes_restart() {
        let last = snapshot("streams.sink.topic.cypher.foo=MERGE (n:L {id: event.id})\n");
        let incoming = snapshot(
            "streams.sink.topic.cypher.foo=MERGE (n:L {id: event.id})\n\
             streams.sink.topic.cypher.bar=MERGE (m:M {id: event.id})\n",
        );
        assert_eq!(
            restart_decision(&incoming, Some(&last), KNOWN),
            RestartDecision::Restart
        );
    }

    #[test]
    fn consumer_transport_changes_restart() {
        let last = snapshot("kafka.bootstrap.servers=a:9092\n");
        let incoming = snapshot("kafka.bootstrap.servers=b:9092\n");
        assert_eq!(
            restart_decision(&incoming, Some(&last), KNOWN),
            RestartDecision::Restart
        );
    }

    #[test]
    fn unknown_implementation_always_restarts() {
        let a = snapshot("streams.sink=custom\n");
        assert_eq!(
            restart_decision(&a, Some(&a.clone()), KNOWN),
            RestartDecision::Restart
        );
    }

    #[test]
    fn cdc_topic_list_reordering_is_not_a_change() {
        let last = snapshot("streams.sink.topic.cdc.schema=a;b\n");
        let incoming = snapshot("streams.sink.topic.cdc.schema=b; a\n");
        assert_eq!(
            restart_decision(&incoming, Some(&last), KNOWN),
            RestartDecision::Restart,
            "raw value differs even though the parsed set matches; raw map wins"
        );
    }
}
