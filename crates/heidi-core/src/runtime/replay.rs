// crates/heidi-core/src/runtime/replay.rs
// ============================================================================
// Module: Heidi Replay Verifier
// Description: Offline verification of `events.jsonl` hash chains.
// Purpose: Audit a run by re-deriving its pipeline state from the journal alone.
// Dependencies: crate::core::{event, hashing, state}
// ============================================================================

//! ## Overview
//! Replay reads a journal line by line without ever writing to it. Every line
//! must pass the schema lock, carry the run id of line 0, and link to its
//! predecessor: line 0 links to the run id, line `i` links to the SHA-256 of
//! the raw bytes of line `i - 1` including its terminator. The first
//! violation aborts with its 1-based line number.
//!
//! Passing lines are folded into a coarse [`PipelineView`] so an auditor can
//! compare the reconstructed outcome against `state.json`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::core::event::Event;
use crate::core::event::EventKind;
use crate::core::event::EventSchemaError;
use crate::core::event::parse_event_line;
use crate::core::hashing::sha256_hex;
use crate::core::state::PipelineView;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// First violation found while replaying a journal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// The journal could not be read.
    #[error("replay io error: {0}")]
    Io(String),
    /// A line is not valid JSON.
    #[error("line {line}: invalid json: {reason}")]
    Json {
        /// 1-based line number.
        line: u64,
        /// Parser message.
        reason: String,
    },
    /// A line violates the schema lock or run id consistency.
    #[error("line {line}: schema violation: {reason}")]
    Schema {
        /// 1-based line number.
        line: u64,
        /// Violation description.
        reason: String,
    },
    /// A line does not link to its predecessor.
    #[error("line {line}: hash chain broken (expected {expected}, found {found})")]
    Chain {
        /// 1-based line number.
        line: u64,
        /// Expected `prev_hash`.
        expected: String,
        /// Recorded `prev_hash`.
        found: String,
    },
}

impl ReplayError {
    /// Returns the offending line number, when the error is tied to a line.
    #[must_use]
    pub const fn line(&self) -> Option<u64> {
        match self {
            Self::Io(_) => None,
            Self::Json {
                line, ..
            }
            | Self::Schema {
                line, ..
            }
            | Self::Chain {
                line, ..
            } => Some(*line),
        }
    }
}

// ============================================================================
// SECTION: Report
// ============================================================================

/// Outcome of a fully verified journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Run id from line 0; `None` for an empty journal.
    pub run_id: Option<String>,
    /// Number of verified events.
    pub events: u64,
    /// Reconstructed pipeline state after the last event.
    pub final_state: PipelineView,
    /// Highest round seen.
    pub max_round: u32,
    /// Hash of the last raw line; `None` for an empty journal.
    pub last_hash: Option<String>,
}

// ============================================================================
// SECTION: Verification
// ============================================================================

/// Verifies the journal at `path`.
///
/// # Errors
///
/// Returns [`ReplayError`] describing the first violation.
pub fn verify_journal(path: &Path) -> Result<ReplayReport, ReplayError> {
    let file = File::open(path).map_err(|err| ReplayError::Io(err.to_string()))?;
    verify_reader(BufReader::new(file))
}

/// Verifies a journal supplied as raw bytes.
///
/// # Errors
///
/// Returns [`ReplayError`] describing the first violation.
pub fn verify_bytes(bytes: &[u8]) -> Result<ReplayReport, ReplayError> {
    verify_reader(bytes)
}

/// Verifies a journal read from `reader`.
///
/// # Errors
///
/// Returns [`ReplayError`] describing the first violation.
pub fn verify_reader<R: BufRead>(mut reader: R) -> Result<ReplayReport, ReplayError> {
    let mut report = ReplayReport {
        run_id: None,
        events: 0,
        final_state: PipelineView::Idle,
        max_round: 0,
        last_hash: None,
    };
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let read = reader.read_until(b'\n', &mut raw).map_err(|err| ReplayError::Io(err.to_string()))?;
        if read == 0 {
            break;
        }
        let line = report.events + 1;
        let event = parse_raw_line(&raw, line)?;
        let expected = match (&report.run_id, &report.last_hash) {
            (Some(run_id), Some(last_hash)) => {
                if event.run_id != *run_id {
                    return Err(ReplayError::Schema {
                        line,
                        reason: format!("run_id {} does not match {run_id}", event.run_id),
                    });
                }
                last_hash.clone()
            }
            _ => {
                report.run_id = Some(event.run_id.clone());
                event.run_id.clone()
            }
        };
        if event.prev_hash != expected {
            return Err(ReplayError::Chain {
                line,
                expected,
                found: event.prev_hash,
            });
        }
        report.final_state = fold_view(report.final_state, &event);
        report.max_round = report.max_round.max(event.round);
        report.last_hash = Some(sha256_hex(&raw));
        report.events = line;
    }
    Ok(report)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Decodes and schema-checks one raw line.
fn parse_raw_line(raw: &[u8], line: u64) -> Result<Event, ReplayError> {
    let text = std::str::from_utf8(raw).map_err(|err| ReplayError::Json {
        line,
        reason: err.to_string(),
    })?;
    let body = text.strip_suffix('\n').unwrap_or(text);
    if body.trim().is_empty() {
        return Err(ReplayError::Schema {
            line,
            reason: "blank line".to_string(),
        });
    }
    parse_event_line(body).map_err(|err| match err {
        EventSchemaError::Json(reason) => ReplayError::Json {
            line,
            reason,
        },
        EventSchemaError::Schema(reason) => ReplayError::Schema {
            line,
            reason,
        },
    })
}

/// Applies one event to the reconstructed view.
fn fold_view(current: PipelineView, event: &Event) -> PipelineView {
    let kind = event.event_type.as_str();
    if kind == EventKind::PipelineStart.as_str() {
        PipelineView::Collecting
    } else if kind == EventKind::StageStart.as_str() {
        PipelineView::from_stage(&event.stage).unwrap_or(current)
    } else if kind == EventKind::PipelineError.as_str() {
        PipelineView::Error
    } else if kind == EventKind::PipelineStop.as_str()
        || kind == EventKind::PipelineComplete.as_str()
    {
        PipelineView::Idle
    } else {
        current
    }
}
