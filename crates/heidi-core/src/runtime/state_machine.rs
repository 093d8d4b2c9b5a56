// crates/heidi-core/src/runtime/state_machine.rs
// ============================================================================
// Module: Heidi State Machine
// Description: Persisted finite-state machine for one pipeline run.
// Purpose: Be the single writer of `state.json` and enforce legal transitions.
// Dependencies: crate::core::state, serde_json
// ============================================================================

//! ## Overview
//! [`StateMachine::apply`] is the only way a run changes phase. Each call
//! computes the next state on a copy, persists it, and only then adopts it,
//! so a rejected event or a failed write leaves the in-memory state exactly as
//! it was.
//!
//! Persistence writes `state.tmp` in the run directory, syncs it, renames it
//! over `state.json`, and restricts the file to owner read/write. Readers
//! therefore never observe a partial file. Re-opening a run with the same id
//! reproduces the last persisted phase; events are not replayed.
//!
//! The machine assumes one writer per run. Cross-process exclusion is the
//! orchestrator's job (see [`crate::runtime::runner::RunLock`]).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::identifiers::RunIdError;
use crate::core::identifiers::generate_run_id;
use crate::core::identifiers::now_rfc3339;
use crate::core::identifiers::validate_run_id;
use crate::core::state::FsmEvent;
use crate::core::state::MetricMap;
use crate::core::state::Mode;
use crate::core::state::OVERWRITE_COUNTER;
use crate::core::state::Phase;
use crate::core::state::RunState;
use crate::core::state::RunStatus;
use crate::core::state::next_phase;
use crate::core::state::status_for_phase;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Directory under the autotrain root holding per-run directories.
pub const RUNS_DIR: &str = "runs";
/// Canonical state file name.
pub const STATE_FILE: &str = "state.json";
/// Temporary file used for atomic replacement.
const STATE_TMP_FILE: &str = "state.tmp";
/// Owner read/write.
#[cfg(unix)]
const STATE_FILE_MODE: u32 = 0o600;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// State machine failures.
#[derive(Debug, Error)]
pub enum StateMachineError {
    /// The event is not legal in the current phase (and mode).
    #[error("illegal transition: {event} in phase {phase}")]
    IllegalTransition {
        /// Phase at the time of the event.
        phase: Phase,
        /// Rejected event.
        event: FsmEvent,
    },
    /// The run id cannot be used.
    #[error(transparent)]
    RunId(#[from] RunIdError),
    /// Filesystem failure.
    #[error("state io error: {0}")]
    Io(String),
    /// Encoding failure.
    #[error("state serialization error: {0}")]
    Serialization(String),
    /// Loaded state is incomplete.
    #[error("state validation failed: missing {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: State Machine
// ============================================================================

/// Persisted FSM for one `(autotrain_dir, run_id)`.
///
/// # Invariants
/// - The in-memory state always equals the last successfully persisted state.
/// - `phase` changes only via [`next_phase`] or the `ERROR` side event.
#[derive(Debug)]
pub struct StateMachine {
    /// Run directory (`{autotrain_dir}/runs/{run_id}`).
    run_dir: PathBuf,
    /// Canonical state file path.
    state_path: PathBuf,
    /// Current state.
    state: RunState,
}

impl StateMachine {
    /// Opens the run, loading `state.json` when it parses and creating
    /// defaults otherwise.
    ///
    /// With `run_id = None` a fresh id is generated. A loaded file's own
    /// `run_id` is adopted. A state file that fails to parse is left in place
    /// until the next mutation replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError`] for invalid run ids or filesystem
    /// failures.
    pub fn open(autotrain_dir: &Path, run_id: Option<&str>) -> Result<Self, StateMachineError> {
        let run_id = match run_id {
            Some(run_id) => run_id.to_string(),
            None => generate_run_id(),
        };
        validate_run_id(&run_id)?;
        let run_dir = run_dir_for(autotrain_dir, &run_id);
        fs::create_dir_all(&run_dir).map_err(|err| StateMachineError::Io(err.to_string()))?;
        let state_path = run_dir.join(STATE_FILE);
        let loaded = load_state_file(&state_path);
        let exists = state_path.exists();
        let mut machine = Self {
            run_dir,
            state_path,
            state: loaded.unwrap_or_else(|| RunState::new(run_id, &now_rfc3339())),
        };
        if !exists {
            let state = machine.state.clone();
            machine.commit(state)?;
        }
        Ok(machine)
    }

    /// Applies an event and returns the resulting phase.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError::IllegalTransition`] when the pair is not in
    /// the table (or a mode gate refuses it), leaving state unchanged; returns
    /// I/O errors when persistence fails, also leaving state unchanged.
    pub fn apply(&mut self, event: FsmEvent) -> Result<Phase, StateMachineError> {
        let current = self.state.phase;
        let mut next = self.state.clone();
        next.last_event = Some(event);
        match event {
            FsmEvent::RequestPause => {
                next.pause_requested = true;
                next.status = RunStatus::Paused;
            }
            FsmEvent::RequestResume => {
                next.pause_requested = false;
                next.status = resumed_status(current);
            }
            FsmEvent::Error => {
                next.phase = Phase::Error;
                next.status = RunStatus::Error;
                next.last_transition = Some(format!("{current} -> {}", Phase::Error));
            }
            _ => {
                self.check_mode_gate(event)?;
                let Some(target) = next_phase(current, event) else {
                    return Err(StateMachineError::IllegalTransition {
                        phase: current,
                        event,
                    });
                };
                next.phase = target;
                next.status = status_for_phase(target);
                next.last_transition = Some(format!("{current} -> {target}"));
                match event {
                    FsmEvent::StartFull => {
                        next.mode = Mode::Train;
                        clear_requests(&mut next);
                    }
                    FsmEvent::StartCollect => {
                        next.mode = Mode::Collect;
                        clear_requests(&mut next);
                    }
                    FsmEvent::TrainNow => clear_requests(&mut next),
                    FsmEvent::RequestStop => {
                        next.stop_requested = true;
                        next.status = RunStatus::Stopped;
                    }
                    _ => {}
                }
            }
        }
        self.commit(next)?;
        Ok(self.state.phase)
    }

    /// Sets the pipeline mode.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError`] when persistence fails.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), StateMachineError> {
        let mut next = self.state.clone();
        next.mode = mode;
        self.commit(next)
    }

    /// Advances the round counter and returns the new round.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError`] when persistence fails.
    pub fn increment_round(&mut self) -> Result<u32, StateMachineError> {
        let mut next = self.state.clone();
        next.current_round = next.current_round.saturating_add(1);
        self.commit(next)?;
        Ok(self.state.current_round)
    }

    /// Sets the round counter directly (used when a run starts).
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError`] when persistence fails.
    pub fn set_round(&mut self, round: u32) -> Result<(), StateMachineError> {
        let mut next = self.state.clone();
        next.current_round = round;
        self.commit(next)
    }

    /// Accumulates counter deltas; `train_loss` is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError`] when persistence fails.
    pub fn update_counters(&mut self, deltas: &MetricMap) -> Result<(), StateMachineError> {
        let mut next = self.state.clone();
        merge_metrics(&mut next.counters, deltas, Some(OVERWRITE_COUNTER));
        self.commit(next)
    }

    /// Accumulates usage deltas.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError`] when persistence fails.
    pub fn update_usage(&mut self, deltas: &MetricMap) -> Result<(), StateMachineError> {
        let mut next = self.state.clone();
        merge_metrics(&mut next.usage, deltas, None);
        self.commit(next)
    }

    /// Returns true when training may start now.
    ///
    /// TRAIN mode always may; COLLECT mode only from COMPLETE or INITIALIZING.
    #[must_use]
    pub const fn can_train(&self) -> bool {
        match self.state.mode {
            Mode::Train => true,
            Mode::Collect => matches!(self.state.phase, Phase::Complete | Phase::Initializing),
            Mode::Idle => false,
        }
    }

    /// Checks that the state carries every required key.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError::Invalid`] listing the missing keys.
    pub fn validate(&self) -> Result<(), StateMachineError> {
        validate_run_id(&self.state.run_id)?;
        let missing = self.state.missing_keys();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StateMachineError::Invalid(missing.join(", ")))
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.state.status
    }

    /// Returns the current mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.state.mode
    }

    /// Returns the full state.
    #[must_use]
    pub const fn state(&self) -> &RunState {
        &self.state
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    /// Returns the run directory.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Returns the state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Refuses mode-gated events.
    fn check_mode_gate(&self, event: FsmEvent) -> Result<(), StateMachineError> {
        let phase = self.state.phase;
        let allowed = match event {
            FsmEvent::TrainNow => {
                self.state.mode != Mode::Collect
                    || matches!(phase, Phase::Complete | Phase::Initializing)
            }
            FsmEvent::CollectComplete => self.state.mode == Mode::Collect,
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(StateMachineError::IllegalTransition {
                phase,
                event,
            })
        }
    }

    /// Persists `next` atomically and adopts it on success.
    fn commit(&mut self, mut next: RunState) -> Result<(), StateMachineError> {
        next.updated_at = now_rfc3339();
        write_state_atomic(&self.run_dir, &self.state_path, &next)?;
        self.state = next;
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns `{autotrain_dir}/runs/{run_id}`.
#[must_use]
pub fn run_dir_for(autotrain_dir: &Path, run_id: &str) -> PathBuf {
    autotrain_dir.join(RUNS_DIR).join(run_id)
}

/// Reads and parses a state file, returning `None` when absent or invalid.
fn load_state_file(path: &Path) -> Option<RunState> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Status restored when a pause is lifted.
const fn resumed_status(phase: Phase) -> RunStatus {
    match phase {
        Phase::Initializing => RunStatus::Idle,
        Phase::Complete => RunStatus::Completed,
        Phase::Error => RunStatus::Error,
        _ => RunStatus::Running,
    }
}

/// Clears the cooperative stop and pause flags.
const fn clear_requests(state: &mut RunState) {
    state.stop_requested = false;
    state.pause_requested = false;
}

/// Adds `deltas` into `target`, overwriting the `overwrite` key.
fn merge_metrics(target: &mut MetricMap, deltas: &MetricMap, overwrite: Option<&str>) {
    for (name, delta) in deltas {
        if overwrite == Some(name.as_str()) {
            target.insert(name.clone(), *delta);
            continue;
        }
        let merged = target.get(name).map_or(*delta, |current| current.accumulate(*delta));
        target.insert(name.clone(), merged);
    }
}

/// Writes `state.tmp`, syncs it, renames it over `state.json`, then chmods.
fn write_state_atomic(
    run_dir: &Path,
    state_path: &Path,
    state: &RunState,
) -> Result<(), StateMachineError> {
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|err| StateMachineError::Serialization(err.to_string()))?;
    let tmp_path = run_dir.join(STATE_TMP_FILE);
    let mut file = File::create(&tmp_path).map_err(|err| StateMachineError::Io(err.to_string()))?;
    file.write_all(&bytes).map_err(|err| StateMachineError::Io(err.to_string()))?;
    file.sync_all().map_err(|err| StateMachineError::Io(err.to_string()))?;
    drop(file);
    fs::rename(&tmp_path, state_path).map_err(|err| StateMachineError::Io(err.to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(state_path, fs::Permissions::from_mode(STATE_FILE_MODE))
            .map_err(|err| StateMachineError::Io(err.to_string()))?;
    }
    Ok(())
}
