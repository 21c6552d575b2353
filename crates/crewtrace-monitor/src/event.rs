//! Wire format of step events and their validation.

use chrono::DateTime;
use crewtrace_core::{ModelError, SpanType, Status};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest count or duration that fits an SQLite integer column.
const MAX_STORED: f64 = i64::MAX as f64;

/// 9999-12-31T23:59:59.999Z in epoch milliseconds.
const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// A rejected event. Never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("event needs an 'id' or an 'agent_name'")]
    MissingIdentity,
    #[error("field '{field}' must be a non-negative finite number, got {value}")]
    InvalidNumber { field: &'static str, value: f64 },
    #[error("field '{0}' must be a whole number")]
    NotInteger(&'static str),
    #[error("field '{field}' is out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("field '{field}' is not epoch milliseconds or an RFC 3339 timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("field '{field}' must fall between 1970-01-01 and 9999-12-31: {value}")]
    TimestampOutOfRange { field: &'static str, value: i64 },
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A timestamp as sent by instrumentation: epoch milliseconds or RFC 3339.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireTime {
    Millis(f64),
    Text(String),
}

/// Token usage as sent on the wire: a bare total or a breakdown.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireTokens {
    Total(f64),
    Breakdown {
        #[serde(default, alias = "input_tokens", alias = "prompt_tokens")]
        input: Option<f64>,
        #[serde(default, alias = "output_tokens", alias = "completion_tokens")]
        output: Option<f64>,
        #[serde(default, alias = "total_tokens")]
        total: Option<f64>,
    },
}

/// A step event exactly as posted. Every field is optional here;
/// [`StepEvent::validate`] turns it into a [`StepUpdate`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepEvent {
    #[serde(alias = "step_id", alias = "span_id")]
    pub id: Option<String>,
    pub run_id: Option<String>,
    pub agent_name: Option<String>,
    #[serde(alias = "parent_step_id", alias = "parent_span_id")]
    pub parent_ref: Option<String>,
    pub status: Option<String>,
    pub start_time: Option<WireTime>,
    pub end_time: Option<WireTime>,
    #[serde(alias = "latency_ms")]
    pub duration_ms: Option<f64>,
    pub prompt: Option<String>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub tokens: Option<WireTokens>,
    #[serde(alias = "cost")]
    pub cost_usd: Option<f64>,
    pub claimed_actions: Option<Vec<String>>,
    pub actual_actions: Option<Vec<String>>,
    pub span_type: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    pub sequence: Option<i64>,
}

/// A validated event. `None` means the event did not carry the field.
///
/// `total_tokens` is set only when the event sent an explicit total; a total
/// implied by a breakdown is derived at merge time from the merged counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    pub id: Option<String>,
    pub run_id: String,
    pub agent_name: Option<String>,
    pub parent_ref: Option<String>,
    pub status: Option<Status>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub duration_ms: Option<u64>,
    pub prompt: Option<String>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub claimed_actions: Option<Vec<String>>,
    pub actual_actions: Option<Vec<String>>,
    pub span_type: Option<SpanType>,
    pub metadata: Option<Map<String, Value>>,
    pub sequence: Option<i64>,
}

impl StepEvent {
    pub fn validate(self) -> Result<StepUpdate, ValidationError> {
        let run_id = non_blank(self.run_id).ok_or(ValidationError::MissingField("run_id"))?;
        let id = non_blank(self.id);
        let agent_name = non_blank(self.agent_name);
        if id.is_none() && agent_name.is_none() {
            return Err(ValidationError::MissingIdentity);
        }

        let (input_tokens, output_tokens, total_tokens) = match self.tokens {
            None => (None, None, None),
            Some(WireTokens::Total(total)) => (None, None, Some(count("tokens", total)?)),
            Some(WireTokens::Breakdown { input, output, total }) => {
                let input = input.map(|v| count("tokens.input", v)).transpose()?;
                let output = output.map(|v| count("tokens.output", v)).transpose()?;
                let total = total.map(|v| count("tokens.total", v)).transpose()?;
                (input, output, total)
            }
        };

        Ok(StepUpdate {
            id,
            run_id,
            agent_name,
            parent_ref: non_blank(self.parent_ref),
            status: self.status.as_deref().map(str::parse::<Status>).transpose()?,
            start_time: self.start_time.map(|t| millis("start_time", t)).transpose()?,
            end_time: self.end_time.map(|t| millis("end_time", t)).transpose()?,
            duration_ms: self
                .duration_ms
                .map(|v| bounded("duration_ms", v))
                .transpose()?
                .map(|v| v.round() as u64),
            prompt: self.prompt,
            output: self.output,
            error_message: self.error_message.filter(|m| !m.trim().is_empty()),
            input_tokens,
            output_tokens,
            total_tokens,
            cost_usd: self.cost_usd.map(|v| non_negative("cost_usd", v)).transpose()?,
            claimed_actions: self.claimed_actions.map(dedup),
            actual_actions: self.actual_actions.map(dedup),
            span_type: self.span_type.as_deref().map(str::parse::<SpanType>).transpose()?,
            metadata: self.metadata,
            sequence: self.sequence,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_negative(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ValidationError::InvalidNumber { field, value })
    }
}

fn bounded(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    let value = non_negative(field, value)?;
    if value >= MAX_STORED {
        return Err(ValidationError::OutOfRange { field, value });
    }
    Ok(value)
}

fn count(field: &'static str, value: f64) -> Result<u64, ValidationError> {
    let value = bounded(field, value)?;
    if value.fract() != 0.0 {
        return Err(ValidationError::NotInteger(field));
    }
    Ok(value as u64)
}

fn millis(field: &'static str, value: WireTime) -> Result<i64, ValidationError> {
    let ms = match value {
        WireTime::Millis(ms) => {
            let ms = non_negative(field, ms)?;
            if ms > MAX_TIMESTAMP_MS as f64 {
                return Err(ValidationError::OutOfRange { field, value: ms });
            }
            ms.round() as i64
        }
        WireTime::Text(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| dt.timestamp_millis())
            .map_err(|_| ValidationError::InvalidTimestamp { field, value: text })?,
    };
    if !(0..=MAX_TIMESTAMP_MS).contains(&ms) {
        return Err(ValidationError::TimestampOutOfRange { field, value: ms });
    }
    Ok(ms)
}

/// Removes duplicates, keeping the first occurrence of each action.
fn dedup(actions: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(actions.len());
    for action in actions {
        if !seen.contains(&action) {
            seen.push(action);
        }
    }
    seen
}
