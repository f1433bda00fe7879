//! Structured response codec.
//!
//! The model may wrap its JSON in a markdown fence. One leading and one trailing
//! fence are stripped; anything else that is not a valid response is a hard
//! [`SchemaViolation`]. There is no partial recovery and no retry.

use std::sync::LazyLock;

use jsonschema::Validator;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::StructuredResponse;

const RESPONSE_SCHEMA: &str = include_str!("../../schemas/structured_response.schema.json");

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^```(?:json)?\s*|\s*```$").expect("fence regex should be valid")
});

static RESPONSE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(RESPONSE_SCHEMA).expect("response schema should be valid json");
    jsonschema::validator_for(&schema).expect("response schema should compile")
});

/// Model output that does not satisfy the structured response contract.
#[derive(Debug, Error)]
pub enum SchemaViolation {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("response does not match schema: {}", .0.join("; "))]
    Shape(Vec<String>),
}

/// Remove a single leading/trailing code fence (optionally tagged `json`).
pub fn strip_fences(raw: &str) -> String {
    FENCE_RE.replace_all(raw.trim(), "").into_owned()
}

/// Parse raw model text into a [`StructuredResponse`].
pub fn parse(raw: &str) -> Result<StructuredResponse, SchemaViolation> {
    let cleaned = strip_fences(raw);
    let value: Value = serde_json::from_str(&cleaned)?;
    let errors: Vec<String> = RESPONSE_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(SchemaViolation::Shape(errors));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tagged_fence_case_insensitively() {
        let raw = "```JSON\n{\"thought\":\"t\"}\n```";
        assert_eq!(strip_fences(raw), "{\"thought\":\"t\"}");
    }

    #[test]
    fn leaves_unfenced_text_alone() {
        assert_eq!(strip_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn parses_final_without_action() {
        let parsed = parse(r#"{"thought":"done","action":null,"is_final":true}"#).expect("parse");
        assert_eq!(parsed.thought, "done");
        assert!(parsed.action.is_none());
        assert!(parsed.is_final);
    }

    #[test]
    fn parses_fenced_action() {
        let raw = concat!(
            "```json\n",
            r#"{"thought":"peek","action":{"skill_name":"peek_file","params":{"path":"a"}}}"#,
            "\n```"
        );
        let parsed = parse(raw).expect("parse");
        let action = parsed.action.expect("action");
        assert_eq!(action.skill_name, "peek_file");
        assert_eq!(action.params["path"], "a");
        assert!(!parsed.is_final);
    }

    #[test]
    fn rejects_non_json() {
        let err = parse("not-json").unwrap_err();
        assert!(matches!(err, SchemaViolation::InvalidJson(_)));
    }

    #[test]
    fn rejects_missing_thought_and_non_boolean_final() {
        let err = parse(r#"{"is_final":"yes"}"#).unwrap_err();
        match err {
            SchemaViolation::Shape(errors) => {
                assert!(errors.iter().any(|e| e.contains("thought")));
                assert!(errors.iter().any(|e| e.contains("boolean")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_is_idempotent_on_clean_json() {
        let raw =
            r#"{"thought":"x","action":{"skill_name":"list_dir","params":{}},"is_final":false}"#;
        let once = parse(&strip_fences(raw)).expect("first");
        let twice = parse(&strip_fences(&strip_fences(raw))).expect("second");
        assert_eq!(once, twice);
    }
}
