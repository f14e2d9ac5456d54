//! Resilient parser that turns near-JSON model output into a validated mapping.
//!
//! A block that already parses as a JSON object is returned untouched. Otherwise
//! the repair passes in `passes` run in a fixed order, once each, except the
//! key-quote repair which iterates to a bounded fixed point. Only a top-level
//! JSON object is accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::errors::{ErrorKind, TaskError};

pub mod passes;

/// Nested mapping produced from repaired model output. Never a bare scalar or array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredRecord(Map<String, Value>);

impl StructuredRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// First non-empty string among `keys`, checked in order.
    pub fn first_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.0.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Canonical text form. `parse` of this output returns an equal record.
    pub fn to_canonical_string(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

impl TryFrom<Value> for StructuredRecord {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("unparseable model output: {reason}")]
pub struct UnparseableOutput {
    pub reason: String,
    /// Text after every repair pass, kept for diagnostics.
    pub cleaned: String,
}

impl From<UnparseableOutput> for TaskError {
    fn from(e: UnparseableOutput) -> Self {
        // Keep the diagnostic short; the cleaned text can be several kilobytes.
        let excerpt: String = e.cleaned.chars().take(200).collect();
        TaskError::new(
            ErrorKind::UnparseableOutput,
            format!("{}; cleaned text starts with: {excerpt}", e.reason),
        )
    }
}

/// Repairs and parses `raw`. Never panics; always a record or a typed failure.
pub fn parse(raw: &str) -> Result<StructuredRecord, UnparseableOutput> {
    let Some(block) = passes::extract_outer_block(raw) else {
        return Err(UnparseableOutput {
            reason: "no brace-delimited block found".to_string(),
            cleaned: raw.trim().to_string(),
        });
    };

    if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(block) {
        return Ok(StructuredRecord(fields));
    }

    let text = passes::remove_digit_separators(block);
    let text = passes::quote_bare_keys(&text);
    let text = passes::strip_trailing_commas(&text);
    let cleaned = passes::unescape_key_quotes(&text);

    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => StructuredRecord::try_from(value).map_err(|other| UnparseableOutput {
            reason: format!("top level is {}, not an object", kind_of(&other)),
            cleaned,
        }),
        Err(e) => Err(UnparseableOutput {
            reason: format!("invalid JSON after repair: {e}"),
            cleaned,
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
