//! Per-topic ingestion strategy definitions.
//!
//! The configuration assigns every consumed topic to exactly one strategy.
//! This module only extracts and validates the raw definitions; compiling
//! a definition into an executable strategy happens in the core crate.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ConfigError;
use crate::keys;
use crate::snapshot::ConfigurationSnapshot;

/// Raw topic-to-strategy assignments extracted from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicDefinitions {
    /// Topic → Cypher query template.
    pub cypher: BTreeMap<String, String>,
    /// Topic → node pattern text.
    pub node_patterns: BTreeMap<String, String>,
    /// Topic → relationship pattern text.
    pub rel_patterns: BTreeMap<String, String>,
    /// Topics ingested through the schema-based CDC strategy.
    pub cdc_schema: BTreeSet<String>,
    /// Topics ingested through the source-id CDC strategy.
    pub cdc_source_id: BTreeSet<String>,
    /// Topics ingested through the CUD file format.
    pub cud: BTreeSet<String>,
}

impl TopicDefinitions {
    /// Extracts topic definitions from a configuration snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateTopic`] when a topic is assigned to
    /// more than one strategy.
    pub fn from_snapshot(snapshot: &ConfigurationSnapshot) -> Result<Self, ConfigError> {
        let mut defs = Self {
            cypher: prefixed(snapshot, keys::TOPIC_CYPHER_PREFIX),
            node_patterns: prefixed(snapshot, keys::TOPIC_PATTERN_NODE_PREFIX),
            rel_patterns: prefixed(snapshot, keys::TOPIC_PATTERN_REL_PREFIX),
            ..Self::default()
        };
        defs.cdc_schema = topic_list(snapshot.get(keys::TOPIC_CDC_SCHEMA));
        defs.cdc_source_id = topic_list(snapshot.get(keys::TOPIC_CDC_SOURCE_ID));
        defs.cud = topic_list(snapshot.get(keys::TOPIC_CUD));

        let mut seen = BTreeSet::new();
        for topic in defs.all_topics() {
            if !seen.insert(topic.clone()) {
                return Err(ConfigError::DuplicateTopic(topic));
            }
        }
        Ok(defs)
    }

    /// Every topic named by any strategy group, with repetitions.
    pub fn all_topics(&self) -> impl Iterator<Item = String> + '_ {
        self.cypher
            .keys()
            .chain(self.node_patterns.keys())
            .chain(self.rel_patterns.keys())
            .chain(self.cdc_schema.iter())
            .chain(self.cdc_source_id.iter())
            .chain(self.cud.iter())
            .cloned()
    }

    /// Returns `true` when no topic is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of configured topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cypher.len()
            + self.node_patterns.len()
            + self.rel_patterns.len()
            + self.cdc_schema.len()
            + self.cdc_source_id.len()
            + self.cud.len()
    }
}

fn prefixed(snapshot: &ConfigurationSnapshot, prefix: &str) -> BTreeMap<String, String> {
    snapshot.with_prefix(prefix)
}

fn topic_list(raw: Option<&str>) -> BTreeSet<String> {
    raw.map(|v| {
        v.split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect()
    })
    .unwrap_or_default()
}
