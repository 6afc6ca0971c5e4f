//! Change-data-capture strategies.
//!
//! CDC topics carry an envelope describing a graph mutation that already
//! happened somewhere else: a `meta` block with the operation, a `payload`
//! block with the entity (node or relationship, before/after states) and an
//! optional `schema` block listing the uniqueness constraints that held at
//! capture time.
//!
//! Two replication flavors exist. The source-id flavor tags every imported
//! entity with the origin's internal id under a synthetic label, so the
//! origin graph is mirrored even when it has no constraints. The schema
//! flavor merges on the constrained key properties instead and produces a
//! graph free of synthetic bookkeeping.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::SinkError;
use crate::event::SinkEvent;
use crate::graph::CypherStatement;
use crate::strategy::pattern::{escape, label_fragment};

/// How CDC envelopes are replicated into the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdcStrategy {
    /// Merge on the origin's entity id stored as a property.
    SourceId(SourceIdConfig),
    /// Merge on the key properties named by the envelope's constraints.
    Schema,
}

/// Label and property used by the source-id flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdConfig {
    /// Synthetic label applied to every replicated entity.
    pub label: String,
    /// Property holding the origin's entity id.
    pub id_property: String,
}

impl Default for SourceIdConfig {
    fn default() -> Self {
        Self {
            label: "SourceEvent".to_string(),
            id_property: "sourceId".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CdcEvent {
    meta: CdcMeta,
    payload: CdcPayload,
    #[serde(default)]
    schema: CdcSchema,
}

#[derive(Debug, Deserialize)]
struct CdcMeta {
    operation: CdcOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CdcOperation {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CdcPayload {
    Node {
        id: String,
        before: Option<NodeState>,
        after: Option<NodeState>,
    },
    Relationship {
        id: String,
        label: String,
        start: RelationshipNode,
        end: RelationshipNode,
        before: Option<RelationshipState>,
        after: Option<RelationshipState>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct NodeState {
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RelationshipState {
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RelationshipNode {
    id: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    ids: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CdcSchema {
    #[serde(default)]
    constraints: Vec<CdcConstraint>,
}

#[derive(Debug, Deserialize)]
struct CdcConstraint {
    label: String,
    #[serde(default)]
    properties: Vec<String>,
}

impl CdcStrategy {
    /// Translates one CDC envelope into a statement.
    ///
    /// Tombstones produce `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidEvent`] when the payload does not
    /// deserialize as a CDC envelope or the operation lacks the state it
    /// needs (for example an update without an `after` block).
    pub fn build_event(
        &self,
        event: &SinkEvent,
    ) -> Result<Option<CypherStatement>, SinkError> {
        let Some(payload) = &event.payload else {
            return Ok(None);
        };
        let envelope: CdcEvent =
            serde_json::from_value(payload.clone()).map_err(|e| SinkError::InvalidEvent {
                topic: event.topic.clone(),
                reason: format!("not a CDC envelope: {e}"),
            })?;

        let statement = match self {
            Self::SourceId(config) => source_id_statement(&event.topic, &envelope, config)?,
            Self::Schema => schema_statement(&event.topic, &envelope)?,
        };
        Ok(Some(statement))
    }
}

fn source_id_statement(
    topic: &str,
    envelope: &CdcEvent,
    config: &SourceIdConfig,
) -> Result<CypherStatement, SinkError> {
    let label = escape(&config.label);
    let id_prop = escape(&config.id_property);
    match (&envelope.payload, envelope.meta.operation) {
        (CdcPayload::Node { id, after, before }, CdcOperation::Created | CdcOperation::Updated) => {
            let after = state_required(topic, after, "after")?;
            let added = label_fragment(&after.labels);
            let removed = removed_labels(before, after);
            let mut query = format!(
                "MERGE (n:{label} {{{id_prop}: $id}})\nSET n += $properties"
            );
            if !added.is_empty() {
                query.push_str(&format!("\nSET n{added}"));
            }
            if !removed.is_empty() {
                query.push_str(&format!("\nREMOVE n{}", label_fragment(&removed)));
            }
            Ok(CypherStatement::with_parameters(
                query,
                json!({"id": id, "properties": after.properties}),
            ))
        }
        (CdcPayload::Node { id, .. }, CdcOperation::Deleted) => Ok(
            CypherStatement::with_parameters(
                format!("MATCH (n:{label} {{{id_prop}: $id}})\nDETACH DELETE n"),
                json!({"id": id}),
            ),
        ),
        (
            CdcPayload::Relationship {
                id,
                label: rel_type,
                start,
                end,
                after,
                ..
            },
            CdcOperation::Created | CdcOperation::Updated,
        ) => {
            let properties = after
                .as_ref()
                .map(|s| s.properties.clone())
                .unwrap_or_default();
            let query = format!(
                "MERGE (start:{label} {{{id_prop}: $start}})\n\
                 MERGE (end:{label} {{{id_prop}: $end}})\n\
                 MERGE (start)-[r:{} {{{id_prop}: $id}}]->(end)\n\
                 SET r += $properties",
                escape(rel_type),
            );
            Ok(CypherStatement::with_parameters(
                query,
                json!({
                    "id": id,
                    "start": start.id,
                    "end": end.id,
                    "properties": properties,
                }),
            ))
        }
        (CdcPayload::Relationship { id, label: rel_type, .. }, CdcOperation::Deleted) => Ok(
            CypherStatement::with_parameters(
                format!(
                    "MATCH ()-[r:{} {{{id_prop}: $id}}]->()\nDELETE r",
                    escape(rel_type),
                ),
                json!({"id": id}),
            ),
        ),
    }
}

fn schema_statement(topic: &str, envelope: &CdcEvent) -> Result<CypherStatement, SinkError> {
    match (&envelope.payload, envelope.meta.operation) {
        (CdcPayload::Node { after, before, .. }, CdcOperation::Created | CdcOperation::Updated) => {
            let after = state_required(topic, after, "after")?;
            let keys = constrained_keys(&envelope.schema, &after.labels, &after.properties);
            let removed = removed_labels(before, after);
            let mut query = format!(
                "MERGE (n{} {{{}}})\nSET n = $properties",
                label_fragment(&after.labels),
                key_fragment(&keys),
            );
            if !removed.is_empty() {
                query.push_str(&format!("\nREMOVE n{}", label_fragment(&removed)));
            }
            Ok(CypherStatement::with_parameters(
                query,
                json!({
                    "keys": key_values(&keys, &after.properties),
                    "properties": after.properties,
                }),
            ))
        }
        (CdcPayload::Node { before, .. }, CdcOperation::Deleted) => {
            let before = state_required(topic, before, "before")?;
            let keys = constrained_keys(&envelope.schema, &before.labels, &before.properties);
            Ok(CypherStatement::with_parameters(
                format!(
                    "MATCH (n{} {{{}}})\nDETACH DELETE n",
                    label_fragment(&before.labels),
                    key_fragment(&keys),
                ),
                json!({"keys": key_values(&keys, &before.properties)}),
            ))
        }
        (
            CdcPayload::Relationship {
                label: rel_type,
                start,
                end,
                after,
                ..
            },
            operation,
        ) => {
            let start_match = endpoint_fragment("start", start);
            let end_match = endpoint_fragment("end", end);
            let parameters = json!({
                "start": start.ids,
                "end": end.ids,
                "properties": after
                    .as_ref()
                    .map(|s| s.properties.clone())
                    .unwrap_or_default(),
            });
            let query = match operation {
                CdcOperation::Deleted => format!(
                    "MATCH {start_match}\nMATCH {end_match}\n\
                     MATCH (start)-[r:{}]->(end)\nDELETE r",
                    escape(rel_type),
                ),
                _ => format!(
                    "MERGE {start_match}\nMERGE {end_match}\n\
                     MERGE (start)-[r:{}]->(end)\nSET r = $properties",
                    escape(rel_type),
                ),
            };
            Ok(CypherStatement::with_parameters(query, parameters))
        }
    }
}

/// Key properties to merge a node on: the properties named by a matching
/// constraint when one exists, every property otherwise.
fn constrained_keys(
    schema: &CdcSchema,
    labels: &[String],
    properties: &Map<String, Value>,
) -> Vec<String> {
    let mut keys: Vec<String> = schema
        .constraints
        .iter()
        .filter(|c| labels.iter().any(|l| *l == c.label))
        .flat_map(|c| c.properties.iter().cloned())
        .filter(|p| properties.contains_key(p))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    if keys.is_empty() {
        keys = properties.keys().cloned().collect();
    }
    keys
}

fn key_fragment(keys: &[String]) -> String {
    keys.iter()
        .map(|k| format!("{}: $keys.{}", escape(k), escape(k)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_values(keys: &[String], properties: &Map<String, Value>) -> Map<String, Value> {
    keys.iter()
        .filter_map(|k| properties.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

fn endpoint_fragment(side: &str, node: &RelationshipNode) -> String {
    let keys = node
        .ids
        .keys()
        .map(|k| format!("{}: ${side}.{}", escape(k), escape(k)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("({side}{} {{{keys}}})", label_fragment(&node.labels))
}

fn removed_labels(before: &Option<NodeState>, after: &NodeState) -> Vec<String> {
    before
        .as_ref()
        .map(|b| {
            b.labels
                .iter()
                .filter(|l| !after.labels.contains(l))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn state_required<'a, T>(
    topic: &str,
    state: &'a Option<T>,
    side: &str,
) -> Result<&'a T, SinkError> {
    state.as_ref().ok_or_else(|| SinkError::InvalidEvent {
        topic: topic.to_string(),
        reason: format!("CDC envelope is missing its '{side}' state"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_created() -> SinkEvent {
        SinkEvent::new(
            "cdc",
            0,
            json!({
                "meta": {"operation": "created"},
                "payload": {
                    "type": "node",
                    "id": "14",
                    "after": {
                        "labels": ["User"],
                        "properties": {"userId": 7, "name": "Ada"}
                    }
                },
                "schema": {
                    "constraints": [{"label": "User", "properties": ["userId"]}]
                }
            }),
        )
    }

    #[test]
    fn source_id_merges_on_origin_id() {
        let strategy = CdcStrategy::SourceId(SourceIdConfig::default());
        let statement = strategy.build_event(&node_created()).unwrap().unwrap();
        assert!(statement
            .query
            .contains("MERGE (n:`SourceEvent` {`sourceId`: $id})"));
        assert!(statement.query.contains("SET n:`User`"));
        assert_eq!(statement.parameters["id"], json!("14"));
    }

    #[test]
    fn schema_merges_on_constrained_keys() {
        let statement = CdcStrategy::Schema
            .build_event(&node_created())
            .unwrap()
            .unwrap();
        assert!(statement
            .query
            .contains("MERGE (n:`User` {`userId`: $keys.`userId`})"));
        assert_eq!(statement.parameters["keys"]["userId"], json!(7));
    }

    #[test]
    fn node_delete_detaches() {
        let event = SinkEvent::new(
            "cdc",
            0,
            json!({
                "meta": {"operation": "deleted"},
                "payload": {
                    "type": "node",
                    "id": "14",
                    "before": {"labels": ["User"], "properties": {"userId": 7}}
                }
            }),
        );
        let statement = CdcStrategy::Schema.build_event(&event).unwrap().unwrap();
        assert!(statement.query.contains("DETACH DELETE n"));
    }

    #[test]
    fn relationship_created_merges_endpoints() {
        let event = SinkEvent::new(
            "cdc",
            0,
            json!({
                "meta": {"operation": "created"},
                "payload": {
                    "type": "relationship",
                    "id": "3",
                    "label": "KNOWS",
                    "start": {"id": "1", "labels": ["User"], "ids": {"userId": 1}},
                    "end": {"id": "2", "labels": ["User"], "ids": {"userId": 2}},
                    "after": {"properties": {"since": 2020}}
                }
            }),
        );
        let statement = CdcStrategy::Schema.build_event(&event).unwrap().unwrap();
        assert!(statement.query.contains("MERGE (start:`User` {`userId`: $start.`userId`})"));
        assert!(statement.query.contains("[r:`KNOWS`]"));
        assert_eq!(statement.parameters["properties"]["since"], json!(2020));
    }

    #[test]
    fn malformed_envelope_is_rejected() {
        let event = SinkEvent::new("cdc", 0, json!({"not": "cdc"}));
        let err = CdcStrategy::Schema.build_event(&event).unwrap_err();
        assert!(matches!(err, SinkError::InvalidEvent { .. }));
    }

    #[test]
    fn update_without_after_is_rejected() {
        let event = SinkEvent::new(
            "cdc",
            0,
            json!({
                "meta": {"operation": "updated"},
                "payload": {"type": "node", "id": "1"}
            }),
        );
        let err = CdcStrategy::Schema.build_event(&event).unwrap_err();
        assert!(matches!(err, SinkError::InvalidEvent { .. }));
    }
}
