//! Topic strategies: how consumed events become graph statements.
//!
//! Each configured topic resolves to exactly one strategy. Template and
//! pattern strategies collapse a whole batch into a single `UNWIND`
//! statement; CDC and CUD payloads are self-describing and translate one
//! statement per event.

pub mod cdc;
pub mod cud;
pub mod cypher;
pub mod pattern;

pub use cdc::{CdcStrategy, SourceIdConfig};
pub use cud::CudFormat;
pub use cypher::CypherTemplate;
pub use pattern::{NodePattern, RelationshipPattern};

use crate::error::SinkError;
use crate::event::SinkEvent;
use crate::graph::CypherStatement;

/// The strategy assigned to one topic.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicStrategy {
    /// Operator-supplied query template.
    Cypher(CypherTemplate),
    /// `Label{!key,...}` node merge pattern.
    NodePattern(NodePattern),
    /// `Start{!k} TYPE End{!k}` relationship merge pattern.
    RelationshipPattern(RelationshipPattern),
    /// Change-data-capture envelope replication.
    Cdc(CdcStrategy),
    /// Imperative CUD messages.
    Cud(CudFormat),
}

impl TopicStrategy {
    /// Strategy name used in logs and status output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cypher(_) => "cypher",
            Self::NodePattern(_) => "node-pattern",
            Self::RelationshipPattern(_) => "relationship-pattern",
            Self::Cdc(CdcStrategy::SourceId(_)) => "cdc-source-id",
            Self::Cdc(CdcStrategy::Schema) => "cdc-schema",
            Self::Cud(_) => "cud",
        }
    }

    /// Translates a batch of events into statements, in batch order.
    ///
    /// # Errors
    ///
    /// Propagates the first translation failure; the caller decides whether
    /// that aborts the batch or routes the offender to the dead-letter
    /// destination by retrying events one at a time.
    pub fn build(&self, events: &[SinkEvent]) -> Result<Vec<CypherStatement>, SinkError> {
        match self {
            Self::Cypher(template) => Ok(template.build(events).into_iter().collect()),
            Self::NodePattern(pattern) => Ok(pattern.build(events)?.into_iter().collect()),
            Self::RelationshipPattern(pattern) => {
                Ok(pattern.build(events)?.into_iter().collect())
            }
            Self::Cdc(strategy) => events
                .iter()
                .filter_map(|e| strategy.build_event(e).transpose())
                .collect(),
            Self::Cud(format) => events
                .iter()
                .filter_map(|e| format.build_event(e).transpose())
                .collect(),
        }
    }
}
