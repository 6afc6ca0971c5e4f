//! CUD format strategy.
//!
//! CUD messages are imperative graph operations: each payload names an
//! operation (`create`, `merge`, `update`, `delete`), an entity type, the
//! identifying properties and the payload properties. Relationship events
//! carry `from` and `to` endpoint descriptors plus a `rel_type`.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::SinkError;
use crate::event::SinkEvent;
use crate::graph::CypherStatement;
use crate::strategy::pattern::{escape, label_fragment};

/// Stateless translator for CUD payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CudFormat;

#[derive(Debug, Deserialize)]
struct CudEvent {
    op: CudOperation,
    #[serde(rename = "type")]
    entity: CudEntity,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    ids: Map<String, Value>,
    #[serde(default)]
    properties: Map<String, Value>,
    from: Option<CudEndpoint>,
    to: Option<CudEndpoint>,
    rel_type: Option<String>,
    #[serde(default = "default_detach")]
    detach: bool,
}

fn default_detach() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CudOperation {
    Create,
    Merge,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CudEntity {
    Node,
    Relationship,
}

#[derive(Debug, Deserialize)]
struct CudEndpoint {
    #[serde(default)]
    labels: Vec<String>,
    ids: Map<String, Value>,
    #[serde(default)]
    op: EndpointOperation,
}

/// How a relationship endpoint node is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EndpointOperation {
    #[default]
    Match,
    Merge,
}

impl CudFormat {
    /// Translates one CUD payload into a statement.
    ///
    /// Tombstones produce `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidEvent`] when the payload does not
    /// deserialize as a CUD message or required fields are missing for the
    /// operation (ids for matching, endpoints for relationships).
    pub fn build_event(
        &self,
        event: &SinkEvent,
    ) -> Result<Option<CypherStatement>, SinkError> {
        let Some(payload) = &event.payload else {
            return Ok(None);
        };
        let cud: CudEvent =
            serde_json::from_value(payload.clone()).map_err(|e| SinkError::InvalidEvent {
                topic: event.topic.clone(),
                reason: format!("not a CUD message: {e}"),
            })?;

        let statement = match cud.entity {
            CudEntity::Node => node_statement(&event.topic, &cud)?,
            CudEntity::Relationship => relationship_statement(&event.topic, &cud)?,
        };
        Ok(Some(statement))
    }
}

fn node_statement(topic: &str, cud: &CudEvent) -> Result<CypherStatement, SinkError> {
    let labels = label_fragment(&cud.labels);
    if cud.op != CudOperation::Create && cud.ids.is_empty() {
        return Err(invalid(topic, "node operation requires non-empty 'ids'"));
    }
    let ids = id_fragment(&cud.ids, "$ids");
    let query = match cud.op {
        CudOperation::Create => format!("CREATE (n{labels})\nSET n = $properties"),
        CudOperation::Merge => {
            format!("MERGE (n{labels} {{{ids}}})\nSET n += $properties")
        }
        CudOperation::Update => {
            format!("MATCH (n{labels} {{{ids}}})\nSET n += $properties")
        }
        CudOperation::Delete => {
            let delete = if cud.detach { "DETACH DELETE" } else { "DELETE" };
            format!("MATCH (n{labels} {{{ids}}})\n{delete} n")
        }
    };
    Ok(CypherStatement::with_parameters(
        query,
        json!({"ids": cud.ids, "properties": cud.properties}),
    ))
}

fn relationship_statement(topic: &str, cud: &CudEvent) -> Result<CypherStatement, SinkError> {
    let rel_type = cud
        .rel_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| invalid(topic, "relationship operation requires 'rel_type'"))?;
    let from = endpoint(topic, &cud.from, "from")?;
    let to = endpoint(topic, &cud.to, "to")?;

    let from_clause = endpoint_clause("from", from);
    let to_clause = endpoint_clause("to", to);
    let rel = escape(rel_type);
    let query = match cud.op {
        CudOperation::Create => format!(
            "{from_clause}\n{to_clause}\nCREATE (from)-[r:{rel}]->(to)\nSET r = $properties"
        ),
        CudOperation::Merge => format!(
            "{from_clause}\n{to_clause}\nMERGE (from)-[r:{rel}]->(to)\nSET r += $properties"
        ),
        CudOperation::Update => format!(
            "{from_clause}\n{to_clause}\nMATCH (from)-[r:{rel}]->(to)\nSET r += $properties"
        ),
        CudOperation::Delete => format!(
            "{from_clause}\n{to_clause}\nMATCH (from)-[r:{rel}]->(to)\nDELETE r"
        ),
    };
    Ok(CypherStatement::with_parameters(
        query,
        json!({
            "from": from.ids,
            "to": to.ids,
            "properties": cud.properties,
        }),
    ))
}

fn endpoint<'a>(
    topic: &str,
    endpoint: &'a Option<CudEndpoint>,
    side: &str,
) -> Result<&'a CudEndpoint, SinkError> {
    let endpoint = endpoint
        .as_ref()
        .ok_or_else(|| invalid(topic, &format!("relationship operation requires '{side}'")))?;
    if endpoint.ids.is_empty() {
        return Err(invalid(topic, &format!("'{side}.ids' must not be empty")));
    }
    Ok(endpoint)
}

fn endpoint_clause(side: &str, endpoint: &CudEndpoint) -> String {
    let verb = match endpoint.op {
        EndpointOperation::Match => "MATCH",
        EndpointOperation::Merge => "MERGE",
    };
    format!(
        "{verb} ({side}{} {{{}}})",
        label_fragment(&endpoint.labels),
        id_fragment(&endpoint.ids, &format!("${side}")),
    )
}

fn id_fragment(ids: &Map<String, Value>, accessor: &str) -> String {
    ids.keys()
        .map(|k| format!("{}: {accessor}.{}", escape(k), escape(k)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn invalid(topic: &str, reason: &str) -> SinkError {
    SinkError::InvalidEvent {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_merge_uses_ids() {
        let event = SinkEvent::new(
            "cud",
            0,
            json!({
                "op": "merge",
                "type": "node",
                "labels": ["User"],
                "ids": {"userId": 7},
                "properties": {"name": "Ada"}
            }),
        );
        let statement = CudFormat.build_event(&event).unwrap().unwrap();
        assert!(statement.query.contains("MERGE (n:`User` {`userId`: $ids.`userId`})"));
        assert_eq!(statement.parameters["properties"]["name"], json!("Ada"));
    }

    #[test]
    fn node_delete_detaches_by_default() {
        let event = SinkEvent::new(
            "cud",
            0,
            json!({"op": "delete", "type": "node", "labels": ["User"], "ids": {"userId": 7}}),
        );
        let statement = CudFormat.build_event(&event).unwrap().unwrap();
        assert!(statement.query.contains("DETACH DELETE n"));

        let plain = SinkEvent::new(
            "cud",
            1,
            json!({
                "op": "delete", "type": "node", "labels": ["User"],
                "ids": {"userId": 7}, "detach": false
            }),
        );
        let statement = CudFormat.build_event(&plain).unwrap().unwrap();
        assert!(!statement.query.contains("DETACH"));
    }

    #[test]
    fn node_update_requires_ids() {
        let event = SinkEvent::new(
            "cud",
            0,
            json!({"op": "update", "type": "node", "labels": ["User"], "properties": {}}),
        );
        let err = CudFormat.build_event(&event).unwrap_err();
        assert!(matches!(err, SinkError::InvalidEvent { .. }));
    }

    #[test]
    fn relationship_create_resolves_endpoints() {
        let event = SinkEvent::new(
            "cud",
            0,
            json!({
                "op": "create",
                "type": "relationship",
                "rel_type": "BOUGHT",
                "from": {"labels": ["User"], "ids": {"userId": 1}},
                "to": {"labels": ["Product"], "ids": {"productId": 9}, "op": "merge"},
                "properties": {"quantity": 2}
            }),
        );
        let statement = CudFormat.build_event(&event).unwrap().unwrap();
        assert!(statement.query.contains("MATCH (from:`User` {`userId`: $from.`userId`})"));
        assert!(statement.query.contains("MERGE (to:`Product` {`productId`: $to.`productId`})"));
        assert!(statement.query.contains("CREATE (from)-[r:`BOUGHT`]->(to)"));
    }

    #[test]
    fn relationship_requires_type_and_endpoints() {
        let event = SinkEvent::new(
            "cud",
            0,
            json!({"op": "create", "type": "relationship", "properties": {}}),
        );
        let err = CudFormat.build_event(&event).unwrap_err();
        assert!(matches!(err, SinkError::InvalidEvent { .. }));
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let event = SinkEvent::new(
            "cud",
            0,
            json!({"op": "upsert", "type": "node", "ids": {"id": 1}}),
        );
        let err = CudFormat.build_event(&event).unwrap_err();
        assert!(matches!(err, SinkError::InvalidEvent { .. }));
    }
}
