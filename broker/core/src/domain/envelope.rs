// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Position Envelope
//!
//! The only part of an agent message the broker looks at:
//!
//! ```text
//! {"sender_id": <u32>, "pos": {"p": {"x": <number>, "y": <number>}}}
//! ```
//!
//! Any other fields (message id, heading, payload) are ignored here. Recipients
//! get the raw text, never a re-encoded structure.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::agent::{AgentId, Position};

const KEY_SENDER_ID: &str = "sender_id";
const KEY_POSITION: &str = "pos";
const KEY_POINT: &str = "p";
const KEY_X: &str = "x";
const KEY_Y: &str = "y";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub sender_id: AgentId,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvelopeError {
    #[error("message is empty")]
    Empty,

    #[error("message is not well-formed JSON: {0}")]
    Syntax(String),

    #[error("message is not a position envelope: {0}")]
    Schema(String),
}

impl EnvelopeError {
    /// Short label used for the rejection metric.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Syntax(_) => "syntax",
            Self::Schema(_) => "schema",
        }
    }
}

impl Envelope {
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        if raw.trim().is_empty() {
            return Err(EnvelopeError::Empty);
        }

        let value: Value =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Syntax(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| EnvelopeError::Schema("expected a JSON object".to_string()))?;

        let point = object
            .get(KEY_POSITION)
            .and_then(Value::as_object)
            .and_then(|pose| pose.get(KEY_POINT))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                EnvelopeError::Schema(format!(
                    "field '{KEY_POSITION}.{KEY_POINT}' must be an object"
                ))
            })?;
        let x = coordinate(point, KEY_X)?;
        let y = coordinate(point, KEY_Y)?;

        let sender_id = object
            .get(KEY_SENDER_ID)
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| {
                EnvelopeError::Schema(format!(
                    "field '{KEY_SENDER_ID}' must be a non-negative 32-bit integer"
                ))
            })?;

        Ok(Self {
            sender_id: AgentId(sender_id),
            position: Position::new(x, y),
        })
    }
}

fn coordinate(point: &Map<String, Value>, key: &str) -> Result<f64, EnvelopeError> {
    point.get(key).and_then(Value::as_f64).ok_or_else(|| {
        EnvelopeError::Schema(format!("field '{KEY_POSITION}.{KEY_POINT}.{key}' must be a number"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_minimal_envelope() {
        let envelope = Envelope::decode(r#"{"sender_id":1,"pos":{"p":{"x":0,"y":0}}}"#).unwrap();
        assert_eq!(envelope.sender_id, AgentId(1));
        assert_eq!(envelope.position, Position::ORIGIN);
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let raw = r#"{"id":99,"sender_id":4,"pos":{"p":{"x":1.5,"y":-2.25},"a":0.3},"content":{"Public":"hi"}}"#;
        let envelope = Envelope::decode(raw).unwrap();
        assert_eq!(envelope.sender_id, AgentId(4));
        assert_eq!(envelope.position, Position::new(1.5, -2.25));
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(Envelope::decode("[1,2,3]"), Err(EnvelopeError::Schema(_))));
        assert!(matches!(Envelope::decode("42"), Err(EnvelopeError::Schema(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = Envelope::decode("{\"sender_id\":1,").unwrap_err();
        assert!(matches!(err, EnvelopeError::Syntax(_)));
        assert_eq!(err.reason(), "syntax");
        assert!(matches!(Envelope::decode("Bonjour"), Err(EnvelopeError::Syntax(_))));
    }

    #[test]
    fn test_rejects_missing_fields() {
        for raw in [
            r#"{"pos":{"p":{"x":0,"y":0}}}"#,
            r#"{"sender_id":1}"#,
            r#"{"sender_id":1,"pos":{"x":0,"y":0}}"#,
            r#"{"sender_id":1,"pos":{"p":{"x":0}}}"#,
            r#"{"sender_id":1,"pos":{"p":{"y":0}}}"#,
            r#"{"sender_id":1,"pos":{"p":[0,0]}}"#,
        ] {
            assert!(
                matches!(Envelope::decode(raw), Err(EnvelopeError::Schema(_))),
                "expected schema error for {raw}"
            );
        }
    }

    #[test]
    fn test_rejects_wrongly_typed_fields() {
        for raw in [
            r#"{"sender_id":"1","pos":{"p":{"x":0,"y":0}}}"#,
            r#"{"sender_id":-1,"pos":{"p":{"x":0,"y":0}}}"#,
            r#"{"sender_id":1.5,"pos":{"p":{"x":0,"y":0}}}"#,
            r#"{"sender_id":1,"pos":{"p":{"x":"0","y":0}}}"#,
            r#"{"sender_id":1,"pos":{"p":{"x":0,"y":null}}}"#,
        ] {
            assert!(
                matches!(Envelope::decode(raw), Err(EnvelopeError::Schema(_))),
                "expected schema error for {raw}"
            );
        }
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(Envelope::decode("   "), Err(EnvelopeError::Empty));
    }
}
