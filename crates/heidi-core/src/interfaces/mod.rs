// crates/heidi-core/src/interfaces/mod.rs
// ============================================================================
// Module: Heidi Interfaces
// Description: Seams between the control plane and external stage programs.
// Purpose: Let the runner drive real subprocesses or scripted test doubles.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! The runner never spawns processes directly. It describes each stage as a
//! [`StageInvocation`] and hands it to a [`StageExecutor`]. Production uses
//! a subprocess executor; tests script outcomes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Stages
// ============================================================================

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Teacher generation.
    Generate,
    /// Schema and secret validation.
    Validate,
    /// Unit-test gate.
    Test,
    /// Adapter training.
    Train,
    /// Evaluation.
    Eval,
}

impl Stage {
    /// Returns the journal name of the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Validate => "validate",
            Self::Test => "test",
            Self::Train => "train",
            Self::Eval => "eval",
        }
    }

    /// Returns the script implementing the stage.
    #[must_use]
    pub const fn script(self) -> &'static str {
        match self {
            Self::Generate => "01_teacher_generate.py",
            Self::Validate => "02_validate_clean.py",
            Self::Test => "03_unit_test_gate.py",
            Self::Train => "04_train_qlora.py",
            Self::Eval => "05_eval.py",
        }
    }

    /// Returns true when a non-zero exit is fatal for the run.
    #[must_use]
    pub const fn is_checked(self) -> bool {
        !matches!(self, Self::Eval)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Stage Executor
// ============================================================================

/// One stage program to run.
///
/// # Invariants
/// - `argv` is non-empty; `argv[0]` is the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInvocation {
    /// Stage being run.
    pub stage: Stage,
    /// Round being run.
    pub round: u32,
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Whether a non-zero exit fails the run.
    pub check: bool,
}

/// Result of a finished stage program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    /// Exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard error.
    pub stderr: String,
}

impl StageOutcome {
    /// Builds a successful outcome.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            exit_code: Some(0),
            stderr: String::new(),
        }
    }

    /// Builds a failed outcome.
    #[must_use]
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
        }
    }

    /// Returns true when the program exited with status 0.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Stage executor errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The invocation has no program.
    #[error("stage invocation has an empty argv")]
    EmptyCommand,
    /// The program could not be started or awaited.
    #[error("stage spawn failed: {0}")]
    Spawn(String),
}

/// Runs stage programs to completion.
pub trait StageExecutor {
    /// Runs `invocation` and blocks until it exits.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] when the program cannot be run at all. A
    /// program that runs and exits non-zero is an `Ok` outcome.
    fn run(&mut self, invocation: &StageInvocation) -> Result<StageOutcome, StageError>;
}
