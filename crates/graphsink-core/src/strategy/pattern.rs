//! Pattern-based topic strategies.
//!
//! A node pattern looks like `LabelA:LabelB{!id,name}`: one or more
//! labels, then a brace block listing the merge keys (prefixed `!`) and the
//! properties to keep. `*` keeps everything, a leading `-` excludes a
//! property, a bare name includes it. Include and exclude cannot be mixed.
//!
//! A relationship pattern is two node patterns around a relationship type:
//! `UserCreated{!userId} BOUGHT ProductCreated{!productId}`. The consumed
//! payload carries `start`, `end` and `properties` objects; key properties
//! for the endpoints are looked up in `start` and `end`.

use serde_json::{Map, Value};

use crate::error::SinkError;
use crate::event::SinkEvent;
use crate::graph::CypherStatement;

/// Which non-key properties an event contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PropertyInclusion {
    /// Keep every property that is not a key.
    All,
    /// Keep only the listed properties.
    Include(Vec<String>),
    /// Keep everything except the listed properties.
    Exclude(Vec<String>),
}

impl PropertyInclusion {
    fn keeps(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Include(names) => names.iter().any(|n| n == name),
            Self::Exclude(names) => !names.iter().any(|n| n == name),
        }
    }
}

/// Compiled `Label{!key,...}` pattern for a node topic.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePattern {
    topic: String,
    labels: Vec<String>,
    keys: Vec<String>,
    inclusion: PropertyInclusion,
}

/// Compiled `Start{!k} TYPE End{!k}` pattern for a relationship topic.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipPattern {
    topic: String,
    start: NodePattern,
    rel_type: String,
    end: NodePattern,
    inclusion: PropertyInclusion,
}

impl NodePattern {
    /// Parses a node pattern configured for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidPattern`] when the text does not match
    /// the grammar or declares no key property.
    pub fn parse(topic: &str, text: &str) -> Result<Self, SinkError> {
        let invalid = |reason: &str| SinkError::InvalidPattern {
            topic: topic.to_string(),
            pattern: text.to_string(),
            reason: reason.to_string(),
        };

        let text = text.trim();
        let (head, body) = match text.find('{') {
            Some(open) if text.ends_with('}') => {
                (&text[..open], &text[open + 1..text.len() - 1])
            }
            _ => return Err(invalid("expected 'Label{!key,...}'")),
        };

        let labels: Vec<String> = head
            .split(':')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if labels.is_empty() {
            return Err(invalid("at least one label is required"));
        }

        let mut keys = Vec::new();
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        let mut all = false;
        for item in body.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            if let Some(key) = item.strip_prefix('!') {
                keys.push(key.trim().to_string());
            } else if let Some(excluded) = item.strip_prefix('-') {
                excludes.push(excluded.trim().to_string());
            } else if item == "*" {
                all = true;
            } else {
                includes.push(item.to_string());
            }
        }
        if keys.is_empty() {
            return Err(invalid("at least one '!key' property is required"));
        }
        if !includes.is_empty() && !excludes.is_empty() {
            return Err(invalid("cannot mix included and excluded properties"));
        }

        let inclusion = if !excludes.is_empty() {
            PropertyInclusion::Exclude(excludes)
        } else if !includes.is_empty() && !all {
            PropertyInclusion::Include(includes)
        } else {
            PropertyInclusion::All
        };

        Ok(Self {
            topic: topic.to_string(),
            labels,
            keys,
            inclusion,
        })
    }

    /// Builds a single `UNWIND`-based merge statement for `events`.
    ///
    /// Tombstone events are skipped; `None` is returned when nothing
    /// remains to write.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidEvent`] when a payload is not an object
    /// or is missing one of the key properties.
    pub fn build(&self, events: &[SinkEvent]) -> Result<Option<CypherStatement>, SinkError> {
        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            let Some(payload) = &event.payload else { continue };
            let object = as_object(&self.topic, payload)?;
            let (keys, properties) =
                split_properties(&self.topic, object, &self.keys, &self.inclusion)?;
            rows.push(Value::Object(Map::from_iter([
                ("keys".to_string(), Value::Object(keys)),
                ("properties".to_string(), Value::Object(properties)),
            ])));
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let merge_keys = key_fragment(&self.keys, "event.keys");
        let query = format!(
            "UNWIND $events AS event\nMERGE (n{} {{{merge_keys}}})\nSET n += event.properties",
            label_fragment(&self.labels),
        );
        Ok(Some(CypherStatement::new(query, rows)))
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl RelationshipPattern {
    /// Parses a relationship pattern configured for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidPattern`] when the text is not exactly
    /// `NodePattern TYPE NodePattern`. Property selection on the endpoint
    /// blocks applies to the relationship's own properties and must agree
    /// between the two blocks or be given on only one.
    pub fn parse(topic: &str, text: &str) -> Result<Self, SinkError> {
        let invalid = |reason: &str| SinkError::InvalidPattern {
            topic: topic.to_string(),
            pattern: text.to_string(),
            reason: reason.to_string(),
        };

        let parts = split_outside_braces(text);
        let [start_text, rel_type, end_text] = parts.as_slice() else {
            return Err(invalid("expected 'Start{!key} TYPE End{!key}'"));
        };
        if rel_type.is_empty() || rel_type.contains('{') {
            return Err(invalid("relationship type must be a bare identifier"));
        }

        let start = NodePattern::parse(topic, start_text)?;
        let end = NodePattern::parse(topic, end_text)?;
        // Relationship property selection comes from whichever endpoint
        // block narrowed it; `All` on both means keep everything.
        let inclusion = match (&start.inclusion, &end.inclusion) {
            (PropertyInclusion::All, other) => other.clone(),
            (other, PropertyInclusion::All) => other.clone(),
            (a, b) if a == b => a.clone(),
            _ => return Err(invalid("conflicting property selections on the endpoints")),
        };

        Ok(Self {
            topic: topic.to_string(),
            start,
            rel_type: rel_type.to_string(),
            end,
            inclusion,
        })
    }

    /// Builds a single `UNWIND`-based merge statement for `events`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidEvent`] when a payload lacks the
    /// `start`/`end` objects or a key property inside them.
    pub fn build(&self, events: &[SinkEvent]) -> Result<Option<CypherStatement>, SinkError> {
        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            let Some(payload) = &event.payload else { continue };
            let object = as_object(&self.topic, payload)?;
            let start = endpoint_keys(&self.topic, object, "start", self.start.keys())?;
            let end = endpoint_keys(&self.topic, object, "end", self.end.keys())?;
            let properties = match object.get("properties") {
                Some(Value::Object(map)) => map
                    .iter()
                    .filter(|(name, _)| self.inclusion.keeps(name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
                _ => Map::new(),
            };
            rows.push(Value::Object(Map::from_iter([
                ("start".to_string(), Value::Object(start)),
                ("end".to_string(), Value::Object(end)),
                ("properties".to_string(), Value::Object(properties)),
            ])));
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let query = format!(
            "UNWIND $events AS event\n\
             MERGE (start{} {{{}}})\n\
             MERGE (end{} {{{}}})\n\
             MERGE (start)-[r:{}]->(end)\n\
             SET r += event.properties",
            label_fragment(self.start.labels()),
            key_fragment(self.start.keys(), "event.start"),
            label_fragment(self.end.labels()),
            key_fragment(self.end.keys(), "event.end"),
            escape(&self.rel_type),
        );
        Ok(Some(CypherStatement::new(query, rows)))
    }
}

/// Backtick-quotes an identifier for interpolation into a query.
pub(crate) fn escape(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', ""))
}

pub(crate) fn label_fragment(labels: &[String]) -> String {
    labels
        .iter()
        .map(|l| format!(":{}", escape(l)))
        .collect::<String>()
}

fn key_fragment(keys: &[String], accessor: &str) -> String {
    keys.iter()
        .map(|k| format!("{}: {accessor}.{}", escape(k), escape(k)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn as_object<'a>(topic: &str, payload: &'a Value) -> Result<&'a Map<String, Value>, SinkError> {
    payload.as_object().ok_or_else(|| SinkError::InvalidEvent {
        topic: topic.to_string(),
        reason: "payload is not a JSON object".to_string(),
    })
}

fn split_properties(
    topic: &str,
    object: &Map<String, Value>,
    keys: &[String],
    inclusion: &PropertyInclusion,
) -> Result<(Map<String, Value>, Map<String, Value>), SinkError> {
    let mut key_values = Map::new();
    for key in keys {
        let value = object.get(key).ok_or_else(|| SinkError::InvalidEvent {
            topic: topic.to_string(),
            reason: format!("missing key property '{key}'"),
        })?;
        key_values.insert(key.clone(), value.clone());
    }
    let properties = object
        .iter()
        .filter(|(name, _)| !keys.iter().any(|k| k == *name) && inclusion.keeps(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Ok((key_values, properties))
}

fn endpoint_keys(
    topic: &str,
    object: &Map<String, Value>,
    side: &str,
    keys: &[String],
) -> Result<Map<String, Value>, SinkError> {
    let Some(Value::Object(endpoint)) = object.get(side) else {
        return Err(SinkError::InvalidEvent {
            topic: topic.to_string(),
            reason: format!("missing '{side}' object"),
        });
    };
    let mut key_values = Map::new();
    for key in keys {
        let value = endpoint.get(key).ok_or_else(|| SinkError::InvalidEvent {
            topic: topic.to_string(),
            reason: format!("missing key property '{key}' in '{side}'"),
        })?;
        key_values.insert(key.clone(), value.clone());
    }
    Ok(key_values)
}

/// Splits on whitespace, but never inside a brace block.
fn split_outside_braces(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
