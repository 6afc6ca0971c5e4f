//! Cypher template strategy.
//!
//! The operator configures a query fragment that consumes a variable named
//! `event`; the strategy prepends an `UNWIND` over the batch so the whole
//! poll is applied in one statement.

use serde_json::Value;

use crate::error::SinkError;
use crate::event::SinkEvent;
use crate::graph::CypherStatement;

/// Compiled Cypher template for a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CypherTemplate {
    template: String,
}

impl CypherTemplate {
    /// Validates and stores the template configured for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidPattern`] for a blank template.
    pub fn parse(topic: &str, template: &str) -> Result<Self, SinkError> {
        let template = template.trim();
        if template.is_empty() {
            return Err(SinkError::InvalidPattern {
                topic: topic.to_string(),
                pattern: template.to_string(),
                reason: "query template is empty".to_string(),
            });
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    /// Wraps the template in an `UNWIND` over the batch payloads.
    ///
    /// Tombstones carry nothing for the template to bind, so they are
    /// skipped; `None` means the whole batch was tombstones.
    pub fn build(&self, events: &[SinkEvent]) -> Option<CypherStatement> {
        let payloads: Vec<Value> = events
            .iter()
            .filter_map(|e| e.payload.clone())
            .collect();
        if payloads.is_empty() {
            return None;
        }
        let query = format!("UNWIND $events AS event\n{}", self.template);
        Some(CypherStatement::new(query, payloads))
    }
}
