//! Shared types for one reasoning step.
//!
//! These types define the stable contract between the loop controller, the
//! dispatcher and callers. They carry no I/O and are never mutated after
//! construction.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Immutable input to one loop step.
///
/// `depth` is tracked by the caller across steps; the core never increments it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub query: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub depth: u32,
}

impl Query {
    pub fn new(query: impl Into<String>, context: impl Into<String>, depth: u32) -> Self {
        Self {
            query: query.into(),
            context: context.into(),
            depth,
        }
    }
}

/// A named capability invocation requested by the model (or injected by the loop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub skill_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ActionSpec {
    pub fn new(skill_name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            skill_name: skill_name.into(),
            params,
        }
    }

    /// Caller-supplied correlation token, if the params carry a non-empty one.
    pub fn reasoning_id(&self) -> Option<String> {
        match self.params.get("reasoning_id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(Value::String(_)) => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

/// One parsed model turn (Think / Act / Observe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResponse {
    pub thought: String,
    #[serde(default)]
    pub action: Option<ActionSpec>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub is_final: bool,
}

/// Uniform result of every dispatch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub observation: String,
    pub success: bool,
    pub error: String,
}

impl DispatchResult {
    pub fn ok(observation: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            success: true,
            error: String::new(),
        }
    }

    pub fn failed(observation: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            success: false,
            error: error.into(),
        }
    }
}

/// The only externally visible output of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub converged: bool,
}

impl Summary {
    pub fn converged(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            converged: true,
        }
    }

    pub fn open(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            converged: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_defaults_context_and_depth() {
        let query: Query = serde_json::from_value(json!({"query": "q"})).expect("query");
        assert_eq!(query, Query::new("q", "", 0));
    }

    #[test]
    fn reasoning_id_ignores_empty_and_stringifies_scalars() {
        let empty = ActionSpec::new(
            "peek_file",
            json!({"reasoning_id": ""}).as_object().cloned().expect("object"),
        );
        assert_eq!(empty.reasoning_id(), None);

        let numeric = ActionSpec::new(
            "peek_file",
            json!({"reasoning_id": 42}).as_object().cloned().expect("object"),
        );
        assert_eq!(numeric.reasoning_id().as_deref(), Some("42"));
    }
}
