//! ATS compatibility reports read out of repaired model output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorKind, TaskError};
use crate::structured::StructuredRecord;

/// How well one resume matches one job, as scored by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtsReport {
    /// 0 to 100.
    pub score: u8,
    pub summary: String,
    pub recommendations: Vec<String>,
}

impl AtsReport {
    /// A record without a numeric score is unparseable output; summary and
    /// recommendations default to empty.
    pub fn from_record(record: &StructuredRecord) -> Result<Self, TaskError> {
        let score = record.get("score").and_then(score_of).ok_or_else(|| {
            TaskError::new(
                ErrorKind::UnparseableOutput,
                "ATS report has no numeric score",
            )
        })?;

        let recommendations = match record.get("recommendations") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::String(item)) if !item.trim().is_empty() => vec![item.trim().to_string()],
            _ => Vec::new(),
        };

        Ok(Self {
            score,
            summary: record.first_str(&["summary"]).unwrap_or_default().to_string(),
            recommendations,
        })
    }

    /// Block embedded in the generation prompt.
    pub fn to_prompt_text(&self) -> String {
        let mut text = format!("Score: {}/100\nSummary: {}", self.score, self.summary);
        if !self.recommendations.is_empty() {
            text.push_str("\nRecommendations:");
            for item in &self.recommendations {
                text.push_str("\n- ");
                text.push_str(item);
            }
        }
        text
    }
}

// Models sometimes answer "85" or "85%" instead of a number.
fn score_of(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        _ => return None,
    };
    raw.is_finite().then(|| raw.round().clamp(0.0, 100.0) as u8)
}
