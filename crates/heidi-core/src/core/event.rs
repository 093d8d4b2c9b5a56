// crates/heidi-core/src/core/event.rs
// ============================================================================
// Module: Heidi Journal Event Schema
// Description: The fixed twelve-field journal event and its strict reader.
// Purpose: Lock the journal wire schema for writers and auditors alike.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Every journal line is one compact JSON object with exactly the twelve
//! fields of [`Event`], in declaration order, and `event_version == "1.0"`.
//! [`parse_event_line`] is the strict reader shared by the writer (when it
//! resumes a chain) and by replay: unknown keys, missing keys, wrong types
//! and wrong versions are all rejected.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::state::MetricMap;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Frozen journal schema version.
pub const EVENT_VERSION: &str = "1.0";

/// Maximum size of one serialized journal line, excluding the newline.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Required event fields, in wire order.
pub const EVENT_FIELDS: [&str; 12] = [
    "event_version",
    "ts",
    "run_id",
    "round",
    "stage",
    "level",
    "event_type",
    "message",
    "counters_delta",
    "usage_delta",
    "artifact_paths",
    "prev_hash",
];

// ============================================================================
// SECTION: Types
// ============================================================================

/// Severity of a journal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Normal progress.
    Info,
    /// Degraded but continuing.
    Warn,
    /// Failure.
    Error,
}

/// Event types written by the pipeline runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The pipeline started.
    PipelineStart,
    /// A round started.
    RoundStart,
    /// A stage started.
    StageStart,
    /// A stage finished.
    StageEnd,
    /// A stop request was honoured.
    PipelineStop,
    /// A stage failed fatally.
    PipelineError,
    /// The pipeline finished.
    PipelineComplete,
}

impl EventKind {
    /// Returns the wire name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PipelineStart => "pipeline_start",
            Self::RoundStart => "round_start",
            Self::StageStart => "stage_start",
            Self::StageEnd => "stage_end",
            Self::PipelineStop => "pipeline_stop",
            Self::PipelineError => "pipeline_error",
            Self::PipelineComplete => "pipeline_complete",
        }
    }
}

/// One journal line.
///
/// # Invariants
/// - Field order is the wire order in [`EVENT_FIELDS`].
/// - `prev_hash` is the run id on line 0, otherwise the SHA-256 hex of the
///   previous raw line including its newline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    /// Schema version, always [`EVENT_VERSION`].
    pub event_version: String,
    /// Event timestamp (RFC 3339).
    pub ts: String,
    /// Run identifier.
    pub run_id: String,
    /// Round the event belongs to.
    pub round: u32,
    /// Stage name (`generate`, `validate`, `pipeline`, ...).
    pub stage: String,
    /// Severity.
    pub level: EventLevel,
    /// Event type (`stage_start`, ...).
    pub event_type: String,
    /// Sanitized free-text message.
    pub message: String,
    /// Counter deltas attributed to the event.
    pub counters_delta: MetricMap,
    /// Usage deltas attributed to the event.
    pub usage_delta: MetricMap,
    /// Sanitized artifact paths.
    pub artifact_paths: Vec<String>,
    /// Chain link to the previous line.
    pub prev_hash: String,
}

/// Caller-supplied part of an event; the journal fills in the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Event type.
    pub event_type: String,
    /// Stage name.
    pub stage: String,
    /// Round number.
    pub round: u32,
    /// Severity.
    pub level: EventLevel,
    /// Free-text message (sanitized on append).
    pub message: String,
    /// Counter deltas.
    pub counters_delta: MetricMap,
    /// Usage deltas.
    pub usage_delta: MetricMap,
    /// Artifact paths (sanitized on append).
    pub artifact_paths: Vec<String>,
}

impl EventRecord {
    /// Creates an info-level record with empty deltas.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        stage: impl Into<String>,
        round: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            stage: stage.into(),
            round,
            level: EventLevel::Info,
            message: message.into(),
            counters_delta: MetricMap::new(),
            usage_delta: MetricMap::new(),
            artifact_paths: Vec::new(),
        }
    }

    /// Creates a record for a runner event kind.
    #[must_use]
    pub fn of_kind(kind: EventKind, stage: &str, round: u32, message: impl Into<String>) -> Self {
        Self::new(kind.as_str(), stage, round, message)
    }

    /// Sets the severity.
    #[must_use]
    pub const fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    /// Adds an artifact path.
    #[must_use]
    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.artifact_paths.push(path.into());
        self
    }

    /// Replaces the counter deltas.
    #[must_use]
    pub fn with_counters(mut self, counters: MetricMap) -> Self {
        self.counters_delta = counters;
        self
    }

    /// Replaces the usage deltas.
    #[must_use]
    pub fn with_usage(mut self, usage: MetricMap) -> Self {
        self.usage_delta = usage;
        self
    }
}

// ============================================================================
// SECTION: Strict Reader
// ============================================================================

/// Reasons a journal line fails the schema lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventSchemaError {
    /// The line is not valid JSON.
    #[error("invalid json: {0}")]
    Json(String),
    /// The line is JSON but violates the locked schema.
    #[error("{0}")]
    Schema(String),
}

/// Parses one raw journal line (without its newline) under the schema lock.
///
/// A trailing `\r` is tolerated by the JSON parser as whitespace; callers
/// hash the raw bytes separately.
///
/// # Errors
///
/// Returns [`EventSchemaError::Json`] for malformed JSON and
/// [`EventSchemaError::Schema`] for missing, extra, or mistyped fields or an
/// unsupported `event_version`.
pub fn parse_event_line(line: &str) -> Result<Event, EventSchemaError> {
    let value: Value =
        serde_json::from_str(line).map_err(|err| EventSchemaError::Json(err.to_string()))?;
    let Value::Object(map) = &value else {
        return Err(EventSchemaError::Schema("event must be a json object".to_string()));
    };
    for field in EVENT_FIELDS {
        if !map.contains_key(field) {
            return Err(EventSchemaError::Schema(format!("missing required field: {field}")));
        }
    }
    if map.len() != EVENT_FIELDS.len() {
        return Err(EventSchemaError::Schema(format!(
            "expected {} fields, found {}",
            EVENT_FIELDS.len(),
            map.len()
        )));
    }
    if map.get("event_version").and_then(Value::as_str) != Some(EVENT_VERSION) {
        return Err(EventSchemaError::Schema("unsupported or missing event_version".to_string()));
    }
    let event: Event =
        serde_json::from_value(value).map_err(|err| EventSchemaError::Schema(err.to_string()))?;
    if let Some(name) = first_non_finite(&event) {
        return Err(EventSchemaError::Schema(format!("non-finite value in {name}")));
    }
    Ok(event)
}

/// Returns the name of the first delta field holding a non-finite number.
pub(crate) fn first_non_finite(event: &Event) -> Option<&'static str> {
    if event.counters_delta.values().any(|value| !value.is_finite()) {
        return Some("counters_delta");
    }
    if event.usage_delta.values().any(|value| !value.is_finite()) {
        return Some("usage_delta");
    }
    None
}
