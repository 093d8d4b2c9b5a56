// crates/heidi-core/src/runtime/runner.rs
// ============================================================================
// Module: Heidi Loop Runner
// Description: Orchestrator driving the state machine through stage programs.
// Purpose: Turn stage outcomes into FSM transitions and journal events.
// Dependencies: crate::{interfaces, runtime::{state_machine, journal}}
// ============================================================================

//! ## Overview
//! [`PipelineRunner`] composes a [`StateMachine`], an [`EventJournal`], and a
//! [`StageExecutor`]. Each [`LoopRunner::tick`] runs at most one stage:
//! generate, validate, optionally test, train, evaluate. A successful stage
//! becomes one or more FSM events; a failed checked stage is journaled as
//! `pipeline_error`, forces the `ERROR` event, and is returned to the caller.
//! The runner never retries a stage.
//!
//! Stop and pause are cooperative. They are raised through a cloneable
//! [`RunnerControl`] and observed only between stages; a running stage
//! program always finishes.
//!
//! A [`RunLock`] held for the runner's lifetime makes it the single writer
//! of the run directory.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::core::event::EventKind;
use crate::core::event::EventLevel;
use crate::core::event::EventRecord;
use crate::core::identifiers::generate_run_id;
use crate::core::identifiers::validate_run_id;
use crate::core::redaction::sanitize_error;
use crate::core::state::FsmEvent;
use crate::core::state::Mode;
use crate::core::state::Phase;
use crate::core::state::PipelineView;
use crate::core::state::RunStatus;
use crate::interfaces::Stage;
use crate::interfaces::StageError;
use crate::interfaces::StageExecutor;
use crate::interfaces::StageInvocation;
use crate::interfaces::StageOutcome;
use crate::runtime::journal::EventJournal;
use crate::runtime::journal::JOURNAL_FILE;
use crate::runtime::journal::JournalError;
use crate::runtime::state_machine::StateMachine;
use crate::runtime::state_machine::StateMachineError;
use crate::runtime::state_machine::run_dir_for;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Lock file marking the active writer of a run directory.
pub const LOCK_FILE: &str = ".lock";
/// Default number of rounds.
pub const DEFAULT_ROUNDS: u32 = 3;
/// Default samples generated per round.
pub const DEFAULT_SAMPLES_PER_ROUND: u32 = 50;
/// Default pause polling interval.
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_millis(1000);
/// Default Python interpreter.
pub const DEFAULT_PYTHON: &str = "python3";
/// Journal stage name for pipeline-level events.
const PIPELINE_STAGE: &str = "pipeline";
/// Journal stage name for round markers.
const ROUND_STAGE: &str = "round";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Runner failures.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Configuration is unusable.
    #[error("invalid runner config: {0}")]
    InvalidConfig(String),
    /// Another runner holds the run lock.
    #[error("run is locked by another runner: {0}")]
    Locked(String),
    /// A checked stage failed or could not be run; the run is now in ERROR.
    #[error("{stage} stage failed: {message}")]
    StageFailed {
        /// Failing stage.
        stage: Stage,
        /// Sanitized failure message.
        message: String,
    },
    /// The state machine refused or failed to persist.
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    /// The journal failed.
    #[error(transparent)]
    Journal(#[from] JournalError),
    /// Filesystem failure.
    #[error("runner io error: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Runner settings.
///
/// # Invariants
/// - `rounds >= 1` and `samples_per_round >= 1` after [`RunnerConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Root holding `runs/{run_id}`.
    pub autotrain_dir: PathBuf,
    /// Root of stage data and model outputs.
    pub out_dir: PathBuf,
    /// Number of rounds before the pipeline completes.
    pub rounds: u32,
    /// Samples requested from the generator per round.
    pub samples_per_round: u32,
    /// Whether the unit-test gate runs.
    pub run_unit_tests: bool,
    /// Run to open; generated when `None`.
    pub run_id: Option<String>,
    /// Interpreter used for stage scripts.
    pub python: String,
    /// Directory holding the stage scripts.
    pub scripts_dir: PathBuf,
    /// Sleep between pause checks.
    pub pause_poll: Duration,
}

impl RunnerConfig {
    /// Creates a config with default limits.
    #[must_use]
    pub fn new(autotrain_dir: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        let out_dir = out_dir.into();
        Self {
            autotrain_dir: autotrain_dir.into(),
            scripts_dir: out_dir.join("scripts"),
            out_dir,
            rounds: DEFAULT_ROUNDS,
            samples_per_round: DEFAULT_SAMPLES_PER_ROUND,
            run_unit_tests: false,
            run_id: None,
            python: DEFAULT_PYTHON.to_string(),
            pause_poll: DEFAULT_PAUSE_POLL,
        }
    }

    /// Validates limits and the run id.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::InvalidConfig`] when a limit or the run id is
    /// unusable.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.rounds == 0 {
            return Err(RunnerError::InvalidConfig("rounds must be at least 1".to_string()));
        }
        if self.samples_per_round == 0 {
            return Err(RunnerError::InvalidConfig(
                "samples_per_round must be at least 1".to_string(),
            ));
        }
        if self.python.trim().is_empty() {
            return Err(RunnerError::InvalidConfig("python must be set".to_string()));
        }
        if let Some(run_id) = &self.run_id {
            validate_run_id(run_id).map_err(|err| RunnerError::InvalidConfig(err.to_string()))?;
        }
        Ok(())
    }

    /// Returns `{out_dir}/data/{prefix}_round_{round}.jsonl`.
    fn data_file(&self, prefix: &str, round: u32) -> PathBuf {
        self.out_dir.join("data").join(format!("{prefix}_round_{round}.jsonl"))
    }

    /// Returns the adapter output directory for `round`.
    fn adapter_dir(&self, round: u32) -> PathBuf {
        self.out_dir.join(format!("out_lora_round_{round}"))
    }

    /// Returns the evaluation report for `round`.
    fn report_file(&self, round: u32) -> PathBuf {
        self.out_dir.join("eval").join(format!("report_round_{round}.json"))
    }

    /// Returns the primary output path of `stage` for `round`.
    fn stage_output(&self, stage: Stage, round: u32) -> PathBuf {
        match stage {
            Stage::Generate => self.data_file("raw", round),
            Stage::Validate => self.data_file("clean", round),
            Stage::Test => self.data_file("tested", round),
            Stage::Train => self.adapter_dir(round),
            Stage::Eval => self.report_file(round),
        }
    }

    /// Builds the argv for `stage` in `round`.
    fn stage_argv(&self, stage: Stage, round: u32) -> Vec<String> {
        let mut argv = vec![
            self.python.clone(),
            self.scripts_dir.join(stage.script()).display().to_string(),
        ];
        let path = |path: PathBuf| path.display().to_string();
        let args: Vec<(&str, String)> = match stage {
            Stage::Generate => vec![
                ("--samples", self.samples_per_round.to_string()),
                ("--output", path(self.data_file("raw", round))),
                ("--round", round.to_string()),
            ],
            Stage::Validate => vec![
                ("--input", path(self.data_file("raw", round))),
                ("--output", path(self.data_file("clean", round))),
            ],
            Stage::Test => vec![
                ("--input", path(self.data_file("clean", round))),
                ("--output", path(self.data_file("tested", round))),
            ],
            Stage::Train => vec![
                ("--data", path(self.data_file("train", round))),
                ("--val-data", path(self.data_file("val", round))),
                ("--output", path(self.adapter_dir(round))),
            ],
            Stage::Eval => vec![
                ("--adapter", path(self.adapter_dir(round).join("final"))),
                ("--data", path(self.data_file("val", round))),
                ("--output", path(self.report_file(round))),
            ],
        };
        for (flag, value) in args {
            argv.push(flag.to_string());
            argv.push(value);
        }
        argv
    }
}

// ============================================================================
// SECTION: Control
// ============================================================================

/// Shared stop/pause flags.
#[derive(Debug, Default)]
struct ControlFlags {
    /// Stop at the next stage boundary.
    stop: AtomicBool,
    /// Hold at the next stage boundary.
    pause: AtomicBool,
}

/// Cloneable handle for cooperative stop and pause requests.
#[derive(Debug, Clone, Default)]
pub struct RunnerControl {
    /// Shared flags.
    flags: Arc<ControlFlags>,
}

impl RunnerControl {
    /// Requests a stop at the next stage boundary.
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    /// Requests a pause at the next stage boundary.
    pub fn request_pause(&self) {
        self.flags.pause.store(true, Ordering::SeqCst);
    }

    /// Lifts a pause request.
    pub fn resume(&self) {
        self.flags.pause.store(false, Ordering::SeqCst);
    }

    /// Returns true when a stop is pending.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    /// Returns true when a pause is pending.
    #[must_use]
    pub fn is_pause_requested(&self) -> bool {
        self.flags.pause.load(Ordering::SeqCst)
    }

    /// Clears both requests.
    fn clear(&self) {
        self.flags.stop.store(false, Ordering::SeqCst);
        self.flags.pause.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// SECTION: Run Lock
// ============================================================================

/// Exclusive writer marker for a run directory, removed on drop.
#[derive(Debug)]
pub struct RunLock {
    /// Lock file path.
    path: PathBuf,
}

impl RunLock {
    /// Creates `{run_dir}/.lock` holding the current pid.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Locked`] when the lock file exists and
    /// [`RunnerError::Io`] on other failures.
    pub fn acquire(run_dir: &Path) -> Result<Self, RunnerError> {
        let path = run_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path).map_err(|err| {
            if err.kind() == ErrorKind::AlreadyExists {
                RunnerError::Locked(path.display().to_string())
            } else {
                RunnerError::Io(err.to_string())
            }
        })?;
        if let Err(err) = writeln!(file, "{}", std::process::id()) {
            let _ = fs::remove_file(&path);
            return Err(RunnerError::Io(err.to_string()));
        }
        Ok(Self {
            path,
        })
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ============================================================================
// SECTION: Status
// ============================================================================

/// Snapshot returned by every runner operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerStatus {
    /// Operator-facing pipeline state.
    pub state: PipelineView,
    /// FSM phase.
    pub phase: Phase,
    /// FSM status.
    pub status: RunStatus,
    /// Current round.
    pub round: u32,
    /// Pipeline mode.
    pub mode: Mode,
    /// Run id.
    pub run_id: String,
}

// ============================================================================
// SECTION: Loop Runner
// ============================================================================

/// Orchestrator contract shared by every runner implementation.
pub trait LoopRunner {
    /// Starts (or resumes) the pipeline in `mode` (`TRAIN` or `COLLECT`).
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the mode is invalid or a transition fails.
    fn start(&mut self, mode: Mode) -> Result<RunnerStatus, RunnerError>;

    /// Performs at most one stage of work.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when a stage fails or persistence fails.
    fn tick(&mut self) -> Result<RunnerStatus, RunnerError>;

    /// Requests a pause at the next stage boundary.
    fn pause(&mut self);

    /// Lifts a pause request.
    fn resume(&mut self);

    /// Requests a stop at the next stage boundary.
    fn shutdown(&mut self);

    /// Triggers training on the data collected so far.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::StateMachine`] when the FSM refuses `TRAIN_NOW`.
    fn action_train_now(&mut self) -> Result<RunnerStatus, RunnerError>;

    /// Returns the current status.
    fn status(&self) -> RunnerStatus;

    /// Ticks until the pipeline is idle or errored.
    ///
    /// # Errors
    ///
    /// Returns the first [`RunnerError`] raised by [`LoopRunner::tick`].
    fn run_until_settled(&mut self) -> Result<RunnerStatus, RunnerError> {
        loop {
            let status = self.tick()?;
            if status.state.is_settled() {
                return Ok(status);
            }
        }
    }
}

// ============================================================================
// SECTION: Pipeline Runner
// ============================================================================

/// Production runner over a [`StageExecutor`].
pub struct PipelineRunner<E: StageExecutor> {
    /// Runner settings.
    config: RunnerConfig,
    /// Persisted FSM.
    machine: StateMachine,
    /// Run journal.
    journal: EventJournal,
    /// Stage program executor.
    executor: E,
    /// Shared stop/pause flags.
    control: RunnerControl,
    /// Writer lock; released last.
    lock: RunLock,
}

impl<E: StageExecutor> PipelineRunner<E> {
    /// Locks the run directory and opens its state and journal.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Locked`] when another runner owns the run, plus
    /// configuration, state, and journal errors.
    pub fn open(config: RunnerConfig, executor: E) -> Result<Self, RunnerError> {
        config.validate()?;
        let run_id = config.run_id.clone().unwrap_or_else(generate_run_id);
        let run_dir = run_dir_for(&config.autotrain_dir, &run_id);
        fs::create_dir_all(&run_dir).map_err(|err| RunnerError::Io(err.to_string()))?;
        let lock = RunLock::acquire(&run_dir)?;
        let machine = StateMachine::open(&config.autotrain_dir, Some(&run_id))?;
        let journal = EventJournal::open(&run_dir.join(JOURNAL_FILE), machine.run_id())?;
        Ok(Self {
            config,
            machine,
            journal,
            executor,
            control: RunnerControl::default(),
            lock,
        })
    }

    /// Returns a handle for stop/pause requests from other threads.
    #[must_use]
    pub fn control(&self) -> RunnerControl {
        self.control.clone()
    }

    /// Returns the state machine.
    #[must_use]
    pub const fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Returns the journal.
    #[must_use]
    pub const fn journal(&self) -> &EventJournal {
        &self.journal
    }

    /// Returns the executor.
    #[must_use]
    pub const fn executor(&self) -> &E {
        &self.executor
    }

    /// Returns the held run lock.
    #[must_use]
    pub const fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Journals a pipeline-level event.
    fn record(&mut self, kind: EventKind, round: u32, message: &str) -> Result<(), RunnerError> {
        self.journal.append(EventRecord::of_kind(kind, PIPELINE_STAGE, round, message))?;
        Ok(())
    }

    /// Honours a pending stop; returns true when the run was stopped.
    fn check_stop(&mut self) -> Result<bool, RunnerError> {
        if !self.control.is_stop_requested() {
            return Ok(false);
        }
        let round = self.machine.state().current_round;
        self.record(EventKind::PipelineStop, round, "Stop requested by user")?;
        self.machine.apply(FsmEvent::RequestStop)?;
        Ok(true)
    }

    /// Sleeps while a pause is pending, mirroring it into the FSM.
    fn wait_while_paused(&mut self) -> Result<(), RunnerError> {
        if !self.control.is_pause_requested() {
            return Ok(());
        }
        self.machine.apply(FsmEvent::RequestPause)?;
        while self.control.is_pause_requested() && !self.control.is_stop_requested() {
            thread::sleep(self.config.pause_poll);
        }
        self.machine.apply(FsmEvent::RequestResume)?;
        Ok(())
    }

    /// Journals a fatal stage failure and forces the ERROR event.
    fn fail(&mut self, stage: Stage, message: String) -> Result<(), RunnerError> {
        let round = self.machine.state().current_round;
        let message = sanitize_error(&message);
        self.journal.append(
            EventRecord::of_kind(EventKind::PipelineError, PIPELINE_STAGE, round, message.as_str())
                .with_level(EventLevel::Error),
        )?;
        self.machine.apply(FsmEvent::Error)?;
        Err(RunnerError::StageFailed {
            stage,
            message,
        })
    }

    /// Runs one stage and applies the resulting FSM events.
    fn run_stage(&mut self, stage: Stage) -> Result<(), RunnerError> {
        let round = self.machine.state().current_round;
        if stage == Stage::Generate {
            self.journal.append(EventRecord::of_kind(
                EventKind::RoundStart,
                ROUND_STAGE,
                round,
                format!("Starting round {round}"),
            ))?;
        }
        self.journal.append(EventRecord::of_kind(
            EventKind::StageStart,
            stage.as_str(),
            round,
            start_message(stage),
        ))?;
        self.prepare_outputs(stage, round)?;
        let invocation = StageInvocation {
            stage,
            round,
            argv: self.config.stage_argv(stage, round),
            check: stage.is_checked(),
        };
        let outcome = match self.executor.run(&invocation) {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("{}: {err}", failure_label(stage));
                return self.fail(stage, message);
            }
        };
        let output = self.config.stage_output(stage, round).display().to_string();
        let end = if outcome.succeeded() {
            EventRecord::of_kind(EventKind::StageEnd, stage.as_str(), round, self.end_message(stage))
        } else if invocation.check {
            let message = format!("{}: {}", failure_label(stage), outcome.stderr);
            return self.fail(stage, message);
        } else {
            EventRecord::of_kind(
                EventKind::StageEnd,
                stage.as_str(),
                round,
                format!("{} with {}", failure_label(stage), describe_exit(&outcome)),
            )
            .with_level(EventLevel::Warn)
        };
        self.journal.append(end.with_artifact(output))?;
        self.advance_after(stage, round)
    }

    /// Applies the FSM events that follow a finished stage.
    fn advance_after(&mut self, stage: Stage, round: u32) -> Result<(), RunnerError> {
        let collect = self.machine.mode() == Mode::Collect;
        match stage {
            Stage::Generate | Stage::Train => {
                self.machine.apply(FsmEvent::StageComplete)?;
            }
            Stage::Validate => {
                self.machine.apply(FsmEvent::StageComplete)?;
                if !self.config.run_unit_tests {
                    self.finish_gate(collect, round)?;
                }
            }
            Stage::Test => self.finish_gate(collect, round)?,
            // A train pass triggered on a collect run is a single pass.
            Stage::Eval => {
                if !collect && round < self.config.rounds {
                    self.machine.apply(FsmEvent::RoundComplete)?;
                    self.machine.increment_round()?;
                } else {
                    self.machine.apply(FsmEvent::StageComplete)?;
                    self.record(EventKind::PipelineComplete, round, "Training pipeline finished")?;
                }
            }
        }
        Ok(())
    }

    /// Leaves TESTING: on to training, or done when only collecting.
    fn finish_gate(&mut self, collect: bool, round: u32) -> Result<(), RunnerError> {
        if collect {
            self.machine.apply(FsmEvent::CollectComplete)?;
            self.record(EventKind::PipelineComplete, round, "Collection round finished")?;
        } else {
            self.machine.apply(FsmEvent::StageComplete)?;
        }
        Ok(())
    }

    /// Creates output parents and the train/val splits a stage expects.
    fn prepare_outputs(&self, stage: Stage, round: u32) -> Result<(), RunnerError> {
        let output = self.config.stage_output(stage, round);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|err| RunnerError::Io(err.to_string()))?;
        }
        if stage == Stage::Train {
            for prefix in ["train", "val"] {
                let split = self.config.data_file(prefix, round);
                if let Some(parent) = split.parent() {
                    fs::create_dir_all(parent).map_err(|err| RunnerError::Io(err.to_string()))?;
                }
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&split)
                    .map_err(|err| RunnerError::Io(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// Message journaled when `stage` finishes successfully.
    fn end_message(&self, stage: Stage) -> String {
        match stage {
            Stage::Generate => format!("Generated {} samples", self.config.samples_per_round),
            Stage::Validate => "Validated samples".to_string(),
            Stage::Test => "Completed unit tests".to_string(),
            Stage::Train => "Training complete".to_string(),
            Stage::Eval => "Evaluation complete".to_string(),
        }
    }
}

impl<E: StageExecutor> LoopRunner for PipelineRunner<E> {
    fn start(&mut self, mode: Mode) -> Result<RunnerStatus, RunnerError> {
        let event = match mode {
            Mode::Train => FsmEvent::StartFull,
            Mode::Collect => FsmEvent::StartCollect,
            Mode::Idle => {
                return Err(RunnerError::InvalidConfig(
                    "start mode must be TRAIN or COLLECT".to_string(),
                ));
            }
        };
        self.control.clear();
        let fresh = match self.machine.phase() {
            Phase::Complete | Phase::Error => {
                self.machine.apply(event)?;
                self.machine.apply(event)?;
                true
            }
            Phase::Initializing => {
                self.machine.apply(event)?;
                true
            }
            _ => false,
        };
        if fresh {
            self.machine.set_round(1)?;
            let message = match mode {
                Mode::Collect => "Starting collection pipeline",
                _ => "Starting training pipeline",
            };
            self.record(EventKind::PipelineStart, 0, message)?;
        } else if self.machine.state().pause_requested {
            self.machine.apply(FsmEvent::RequestResume)?;
        }
        Ok(self.status())
    }

    fn tick(&mut self) -> Result<RunnerStatus, RunnerError> {
        if PipelineView::from_phase(self.machine.phase()).is_settled() {
            return Ok(self.status());
        }
        self.wait_while_paused()?;
        if self.check_stop()? {
            return Ok(self.status());
        }
        let stage = match self.machine.phase() {
            Phase::Generating => Stage::Generate,
            Phase::Validating => Stage::Validate,
            Phase::Testing => Stage::Test,
            Phase::Training => Stage::Train,
            Phase::Evaluating => Stage::Eval,
            Phase::Initializing | Phase::Complete | Phase::Error => return Ok(self.status()),
        };
        self.run_stage(stage)?;
        Ok(self.status())
    }

    fn pause(&mut self) {
        self.control.request_pause();
    }

    fn resume(&mut self) {
        self.control.resume();
    }

    fn shutdown(&mut self) {
        self.control.request_stop();
    }

    fn action_train_now(&mut self) -> Result<RunnerStatus, RunnerError> {
        self.machine.apply(FsmEvent::TrainNow)?;
        Ok(self.status())
    }

    fn status(&self) -> RunnerStatus {
        let state = self.machine.state();
        RunnerStatus {
            state: PipelineView::from_phase(state.phase),
            phase: state.phase,
            status: state.status,
            round: state.current_round,
            mode: state.mode,
            run_id: state.run_id.clone(),
        }
    }
}

// ============================================================================
// SECTION: Command Executor
// ============================================================================

/// Runs stage programs as subprocesses, capturing standard error.
#[derive(Debug, Clone, Default)]
pub struct CommandStageExecutor {
    /// Working directory for spawned programs.
    working_dir: Option<PathBuf>,
}

impl CommandStageExecutor {
    /// Creates an executor that inherits the current directory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            working_dir: None,
        }
    }

    /// Runs programs from `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl StageExecutor for CommandStageExecutor {
    fn run(&mut self, invocation: &StageInvocation) -> Result<StageOutcome, StageError> {
        let Some((program, args)) = invocation.argv.split_first() else {
            return Err(StageError::EmptyCommand);
        };
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let output = command.output().map_err(|err| StageError::Spawn(err.to_string()))?;
        Ok(StageOutcome {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Message journaled when `stage` starts.
const fn start_message(stage: Stage) -> &'static str {
    match stage {
        Stage::Generate => "Starting teacher generation",
        Stage::Validate => "Starting validation",
        Stage::Test => "Starting unit tests",
        Stage::Train => "Starting training",
        Stage::Eval => "Starting evaluation",
    }
}

/// Prefix of failure messages for `stage`.
const fn failure_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Generate => "Teacher generation failed",
        Stage::Validate => "Validation failed",
        Stage::Test => "Unit test gate failed",
        Stage::Train => "Training failed",
        Stage::Eval => "Evaluation failed",
    }
}

/// Describes how a program exited.
fn describe_exit(outcome: &StageOutcome) -> String {
    outcome
        .exit_code
        .map_or_else(|| "termination by signal".to_string(), |code| format!("exit code {code}"))
}
