// crates/heidi-core/src/core/state.rs
// ============================================================================
// Module: Heidi Run State Model
// Description: Modes, phases, statuses, events, and the transition table.
// Purpose: Define the persisted run state and its legal phase changes.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! The run state is the single persisted record of a pipeline run. Its
//! `phase` only moves through [`next_phase`], a fixed table keyed by the
//! current phase and an [`FsmEvent`]. Side events (`REQUEST_PAUSE`,
//! `REQUEST_RESUME`, `ERROR`) never consult the table; they are handled by
//! the state machine directly.
//!
//! Counters and usage are maps of named numeric values. All of them
//! accumulate except `train_loss`, which is overwritten.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Counter that is overwritten rather than accumulated.
pub const OVERWRITE_COUNTER: &str = "train_loss";

/// Integer counters every run starts with.
pub const DEFAULT_INT_COUNTERS: &[&str] = &[
    "teacher_generated",
    "teacher_failed",
    "raw_written",
    "validated_ok",
    "rejected_schema",
    "rejected_secret",
    "rejected_dedupe",
    "test_pass",
    "test_fail",
    "train_step",
    "eval_json_parse_rate",
    "eval_format_rate",
];

/// Integer usage fields every run starts with.
pub const DEFAULT_INT_USAGE: &[&str] =
    &["requests_sent", "input_tokens", "output_tokens", "rate_limits_hit", "retries"];

/// Float usage field tracking spend.
pub const COST_USAGE_FIELD: &str = "estimated_cost_usd";

// ============================================================================
// SECTION: Enumerations
// ============================================================================

/// Pipeline mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// No run configured.
    Idle,
    /// Collect-only: generate and validate, train on demand.
    Collect,
    /// Full pipeline including training and evaluation.
    Train,
}

/// Pipeline phase tracked by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Run created, no stage started.
    Initializing,
    /// Teacher generation.
    Generating,
    /// Schema and secret validation.
    Validating,
    /// Optional unit-test gate.
    Testing,
    /// Model training.
    Training,
    /// Evaluation of the trained adapter.
    Evaluating,
    /// Run finished.
    Complete,
    /// Run failed.
    Error,
}

impl Phase {
    /// Every phase, in table order.
    pub const ALL: [Self; 8] = [
        Self::Initializing,
        Self::Generating,
        Self::Validating,
        Self::Testing,
        Self::Training,
        Self::Evaluating,
        Self::Complete,
        Self::Error,
    ];

    /// Returns the wire name of the phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Generating => "GENERATING",
            Self::Validating => "VALIDATING",
            Self::Testing => "TESTING",
            Self::Training => "TRAINING",
            Self::Evaluating => "EVALUATING",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }

    /// Returns true for phases that run a stage.
    #[must_use]
    pub const fn is_working(self) -> bool {
        matches!(
            self,
            Self::Generating | Self::Validating | Self::Testing | Self::Training | Self::Evaluating
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run status visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Nothing started.
    Idle,
    /// A stage is active or about to be.
    Running,
    /// Pause requested.
    Paused,
    /// Stop requested.
    Stopped,
    /// Reached COMPLETE.
    Completed,
    /// Reached ERROR.
    Error,
}

/// Events accepted by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmEvent {
    /// Start a full (train) run.
    StartFull,
    /// Start a collect-only run.
    StartCollect,
    /// Jump to training on demand.
    TrainNow,
    /// Pause at the next stage boundary.
    RequestPause,
    /// Clear a pause request.
    RequestResume,
    /// Stop at the next stage boundary.
    RequestStop,
    /// The current stage finished.
    StageComplete,
    /// A round finished and another follows.
    RoundComplete,
    /// The last round finished.
    PipelineComplete,
    /// A collect-only cycle finished.
    CollectComplete,
    /// Unrecoverable failure.
    Error,
}

impl FsmEvent {
    /// Every event.
    pub const ALL: [Self; 11] = [
        Self::StartFull,
        Self::StartCollect,
        Self::TrainNow,
        Self::RequestPause,
        Self::RequestResume,
        Self::RequestStop,
        Self::StageComplete,
        Self::RoundComplete,
        Self::PipelineComplete,
        Self::CollectComplete,
        Self::Error,
    ];

    /// Returns the wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartFull => "START_FULL",
            Self::StartCollect => "START_COLLECT",
            Self::TrainNow => "TRAIN_NOW",
            Self::RequestPause => "REQUEST_PAUSE",
            Self::RequestResume => "REQUEST_RESUME",
            Self::RequestStop => "REQUEST_STOP",
            Self::StageComplete => "STAGE_COMPLETE",
            Self::RoundComplete => "ROUND_COMPLETE",
            Self::PipelineComplete => "PIPELINE_COMPLETE",
            Self::CollectComplete => "COLLECT_COMPLETE",
            Self::Error => "ERROR",
        }
    }

    /// Returns true for events handled outside the transition table.
    #[must_use]
    pub const fn is_side_event(self) -> bool {
        matches!(self, Self::RequestPause | Self::RequestResume | Self::Error)
    }
}

impl fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Transition Table
// ============================================================================

/// Looks up the next phase for `(phase, event)`.
///
/// Returns `None` when the pair is absent from the table. Side events always
/// return `None` here. `COLLECT_COMPLETE` is listed for VALIDATING and TESTING;
/// its mode gate lives in the state machine.
#[must_use]
pub const fn next_phase(phase: Phase, event: FsmEvent) -> Option<Phase> {
    use FsmEvent as E;
    use Phase as P;
    match (phase, event) {
        (P::Initializing, E::StartFull | E::StartCollect) => Some(P::Generating),
        (P::Generating, E::StageComplete) => Some(P::Validating),
        (P::Validating, E::StageComplete) => Some(P::Testing),
        (P::Testing, E::StageComplete) => Some(P::Training),
        (P::Training, E::StageComplete) => Some(P::Evaluating),
        (P::Evaluating, E::StageComplete | E::PipelineComplete) => Some(P::Complete),
        (P::Evaluating, E::RoundComplete) => Some(P::Generating),
        (P::Validating | P::Testing, E::CollectComplete) => Some(P::Complete),
        (
            P::Generating | P::Validating | P::Testing | P::Training | P::Evaluating,
            E::RequestStop,
        ) => Some(P::Complete),
        (P::Complete, E::StartFull | E::StartCollect) => Some(P::Initializing),
        (P::Complete, E::TrainNow) => Some(P::Training),
        (P::Error, E::StartFull | E::StartCollect) => Some(P::Initializing),
        _ => None,
    }
}

// ============================================================================
// SECTION: Metric Values
// ============================================================================

/// A counter or usage value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Integral value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
}

impl MetricValue {
    /// Returns the value as `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "Counters stay far below 2^52.")]
    pub const fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }

    /// Returns true when the value is a finite number.
    #[must_use]
    pub const fn is_finite(self) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Float(value) => value.is_finite(),
        }
    }

    /// Adds two values, staying integral when both sides are.
    #[must_use]
    pub fn accumulate(self, delta: Self) -> Self {
        match (self, delta) {
            (Self::Int(left), Self::Int(right)) => Self::Int(left.saturating_add(right)),
            (left, right) => Self::Float(left.as_f64() + right.as_f64()),
        }
    }
}

/// Named numeric fields (`counters` and `usage`).
pub type MetricMap = BTreeMap<String, MetricValue>;

/// Returns the default counter map for a new run.
#[must_use]
pub fn default_counters() -> MetricMap {
    let mut counters: MetricMap = DEFAULT_INT_COUNTERS
        .iter()
        .map(|name| ((*name).to_string(), MetricValue::Int(0)))
        .collect();
    counters.insert(OVERWRITE_COUNTER.to_string(), MetricValue::Float(0.0));
    counters
}

/// Returns the default usage map for a new run.
#[must_use]
pub fn default_usage() -> MetricMap {
    let mut usage: MetricMap = DEFAULT_INT_USAGE
        .iter()
        .map(|name| ((*name).to_string(), MetricValue::Int(0)))
        .collect();
    usage.insert(COST_USAGE_FIELD.to_string(), MetricValue::Float(0.0));
    usage
}

// ============================================================================
// SECTION: Run State
// ============================================================================

/// Persisted state of one run.
///
/// # Invariants
/// - `phase` changes only through [`next_phase`] or the `ERROR` side event.
/// - `updated_at` is refreshed on every persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Run identifier (also the run directory name).
    pub run_id: String,
    /// Pipeline mode.
    pub mode: Mode,
    /// Current phase.
    pub phase: Phase,
    /// Reader-facing status.
    pub status: RunStatus,
    /// Current round, starting at 0 before the first round.
    pub current_round: u32,
    /// Cooperative stop flag.
    pub stop_requested: bool,
    /// Cooperative pause flag.
    pub pause_requested: bool,
    /// Pipeline counters.
    pub counters: MetricMap,
    /// API usage totals.
    pub usage: MetricMap,
    /// Last event applied.
    #[serde(default)]
    pub last_event: Option<FsmEvent>,
    /// Last table transition, formatted as `"FROM -> TO"`.
    #[serde(default)]
    pub last_transition: Option<String>,
    /// Creation timestamp (RFC 3339).
    pub started_at: String,
    /// Last persist timestamp (RFC 3339).
    pub updated_at: String,
}

impl RunState {
    /// Creates the default state for a new run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, now: &str) -> Self {
        Self {
            run_id: run_id.into(),
            mode: Mode::Idle,
            phase: Phase::Initializing,
            status: RunStatus::Idle,
            current_round: 0,
            stop_requested: false,
            pause_requested: false,
            counters: default_counters(),
            usage: default_usage(),
            last_event: None,
            last_transition: None,
            started_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    /// Returns the names of required counter and usage keys that are missing.
    #[must_use]
    pub fn missing_keys(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for name in DEFAULT_INT_COUNTERS.iter().chain(std::iter::once(&OVERWRITE_COUNTER)) {
            if !self.counters.contains_key(*name) {
                missing.push(format!("counters.{name}"));
            }
        }
        for name in DEFAULT_INT_USAGE.iter().chain(std::iter::once(&COST_USAGE_FIELD)) {
            if !self.usage.contains_key(*name) {
                missing.push(format!("usage.{name}"));
            }
        }
        if self.started_at.is_empty() {
            missing.push("started_at".to_string());
        }
        if self.updated_at.is_empty() {
            missing.push("updated_at".to_string());
        }
        missing
    }
}

/// Status reported after a table transition into `phase`.
#[must_use]
pub const fn status_for_phase(phase: Phase) -> RunStatus {
    match phase {
        Phase::Complete => RunStatus::Completed,
        Phase::Error => RunStatus::Error,
        _ => RunStatus::Running,
    }
}

// ============================================================================
// SECTION: Pipeline View
// ============================================================================

/// Coarse pipeline state shown to operators and rebuilt by replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineView {
    /// Nothing running.
    Idle,
    /// Generating samples.
    Collecting,
    /// Validating samples.
    Validating,
    /// Running the unit-test gate.
    Testing,
    /// Training.
    Finalizing,
    /// Evaluating.
    Evaluating,
    /// Stopped on a failure.
    Error,
}

impl PipelineView {
    /// Returns the wire name of the view.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Collecting => "COLLECTING",
            Self::Validating => "VALIDATING",
            Self::Testing => "TESTING",
            Self::Finalizing => "FINALIZING",
            Self::Evaluating => "EVALUATING",
            Self::Error => "ERROR",
        }
    }

    /// Derives the view from an FSM phase.
    #[must_use]
    pub const fn from_phase(phase: Phase) -> Self {
        match phase {
            Phase::Initializing | Phase::Complete => Self::Idle,
            Phase::Generating => Self::Collecting,
            Phase::Validating => Self::Validating,
            Phase::Testing => Self::Testing,
            Phase::Training => Self::Finalizing,
            Phase::Evaluating => Self::Evaluating,
            Phase::Error => Self::Error,
        }
    }

    /// Maps a journal stage name to the view entered when it starts.
    #[must_use]
    pub fn from_stage(stage: &str) -> Option<Self> {
        match stage {
            "generate" => Some(Self::Collecting),
            "validate" => Some(Self::Validating),
            "test" => Some(Self::Testing),
            "train" => Some(Self::Finalizing),
            "eval" => Some(Self::Evaluating),
            _ => None,
        }
    }

    /// Returns true when the runner has nothing left to do.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl fmt::Display for PipelineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that side events never hit the table.
    #[test]
    fn side_events_never_hit_the_table() {
        for phase in Phase::ALL {
            for event in FsmEvent::ALL.into_iter().filter(|event| event.is_side_event()) {
                assert_eq!(next_phase(phase, event), None);
            }
        }
    }

    /// Tests that metric accumulation promotes to float.
    #[test]
    fn metric_accumulation_promotes_to_float() {
        let total = MetricValue::Int(2).accumulate(MetricValue::Float(0.5));
        assert_eq!(total, MetricValue::Float(2.5));
        assert_eq!(MetricValue::Int(2).accumulate(MetricValue::Int(3)), MetricValue::Int(5));
    }

    /// Tests that metric values round trip through json.
    #[test]
    fn metric_values_round_trip_through_json() -> Result<(), serde_json::Error> {
        let counters = default_counters();
        let text = serde_json::to_string(&counters)?;
        let parsed: MetricMap = serde_json::from_str(&text)?;
        assert_eq!(parsed.get(OVERWRITE_COUNTER), Some(&MetricValue::Float(0.0)));
        assert_eq!(parsed.get("train_step"), Some(&MetricValue::Int(0)));
        Ok(())
    }
}
