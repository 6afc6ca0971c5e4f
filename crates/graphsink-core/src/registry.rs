//! Compiled strategy registry.
//!
//! Maps each configured topic to its compiled [`TopicStrategy`]. The whole
//! table is replaced atomically on reconfiguration: compile everything
//! first, then clear and refill under one write lock, so readers never see
//! a half-applied mix of old and new assignments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use graphsink_config::TopicDefinitions;

use crate::error::SinkError;
use crate::strategy::{
    CdcStrategy, CudFormat, CypherTemplate, NodePattern, RelationshipPattern, SourceIdConfig,
    TopicStrategy,
};

/// Topic → strategy lookup shared between the pipeline and the procedures.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    strategies: RwLock<HashMap<String, Arc<TopicStrategy>>>,
}

impl TopicRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `definitions` and swaps them in as the complete new table.
    ///
    /// # Errors
    ///
    /// Returns the first compilation failure; in that case the previous
    /// table stays in place untouched.
    pub fn replace(&self, definitions: &TopicDefinitions) -> Result<(), SinkError> {
        let compiled = compile(definitions)?;
        let mut table = self.strategies.write().expect("strategy lock poisoned");
        table.clear();
        table.extend(compiled);
        Ok(())
    }

    /// Resolves the strategy for `topic`, if one is assigned.
    #[must_use]
    pub fn strategy_for(&self, topic: &str) -> Option<Arc<TopicStrategy>> {
        self.strategies
            .read()
            .expect("strategy lock poisoned")
            .get(topic)
            .cloned()
    }

    /// Every assigned topic, sorted. This is the subscription list.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .strategies
            .read()
            .expect("strategy lock poisoned")
            .keys()
            .cloned()
            .collect();
        topics.sort_unstable();
        topics
    }

    /// Topic → strategy kind pairs for status output.
    #[must_use]
    pub fn assignments(&self) -> Vec<(String, &'static str)> {
        let mut pairs: Vec<(String, &'static str)> = self
            .strategies
            .read()
            .expect("strategy lock poisoned")
            .iter()
            .map(|(topic, strategy)| (topic.clone(), strategy.kind()))
            .collect();
        pairs.sort_unstable();
        pairs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies
            .read()
            .expect("strategy lock poisoned")
            .is_empty()
    }
}

fn compile(
    definitions: &TopicDefinitions,
) -> Result<HashMap<String, Arc<TopicStrategy>>, SinkError> {
    let mut compiled = HashMap::with_capacity(definitions.len());
    for (topic, template) in &definitions.cypher {
        compiled.insert(
            topic.clone(),
            Arc::new(TopicStrategy::Cypher(CypherTemplate::parse(topic, template)?)),
        );
    }
    for (topic, text) in &definitions.node_patterns {
        compiled.insert(
            topic.clone(),
            Arc::new(TopicStrategy::NodePattern(NodePattern::parse(topic, text)?)),
        );
    }
    for (topic, text) in &definitions.rel_patterns {
        compiled.insert(
            topic.clone(),
            Arc::new(TopicStrategy::RelationshipPattern(RelationshipPattern::parse(
                topic, text,
            )?)),
        );
    }
    for topic in &definitions.cdc_schema {
        compiled.insert(
            topic.clone(),
            Arc::new(TopicStrategy::Cdc(CdcStrategy::Schema)),
        );
    }
    for topic in &definitions.cdc_source_id {
        compiled.insert(
            topic.clone(),
            Arc::new(TopicStrategy::Cdc(CdcStrategy::SourceId(
                SourceIdConfig::default(),
            ))),
        );
    }
    for topic in &definitions.cud {
        compiled.insert(topic.clone(), Arc::new(TopicStrategy::Cud(CudFormat)));
    }
    Ok(compiled)
}
