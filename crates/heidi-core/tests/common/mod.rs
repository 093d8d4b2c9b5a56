// crates/heidi-core/tests/common/mod.rs
// ============================================================================
// Module: Common Test Utilities
// Description: Shared helpers for heidi-core integration tests.
// Purpose: Provide scripted stage executors and journal builders.
// Dependencies: heidi-core, tempfile
// ============================================================================

//! ## Overview
//! Provides a scripted [`StageExecutor`] that records every invocation and
//! answers from a per-stage script, plus helpers that build journals through
//! the real writer.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]
#![allow(dead_code, reason = "Shared test helpers may be unused in some suites.")]

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use heidi_core::EventJournal;
use heidi_core::EventKind;
use heidi_core::EventRecord;
use heidi_core::RunnerConfig;
use heidi_core::Stage;
use heidi_core::StageError;
use heidi_core::StageExecutor;
use heidi_core::StageInvocation;
use heidi_core::StageOutcome;

// ============================================================================
// SECTION: Scripted Executor
// ============================================================================

/// Stage executor answering from a script and recording invocations.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    /// Outcomes returned for specific stages; others succeed.
    pub outcomes: HashMap<Stage, StageOutcome>,
    /// Stages whose spawn fails.
    pub spawn_failures: Vec<Stage>,
    /// Every invocation received, in order.
    pub invocations: Vec<StageInvocation>,
}

impl ScriptedExecutor {
    /// Creates an executor where every stage succeeds.
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Makes `stage` exit with `code` and `stderr`.
    pub fn failing(mut self, stage: Stage, code: i32, stderr: &str) -> Self {
        self.outcomes.insert(stage, StageOutcome::failure(code, stderr));
        self
    }

    /// Makes `stage` fail to spawn.
    pub fn unspawnable(mut self, stage: Stage) -> Self {
        self.spawn_failures.push(stage);
        self
    }

    /// Returns the stages invoked, in order.
    pub fn stages(&self) -> Vec<Stage> {
        self.invocations.iter().map(|invocation| invocation.stage).collect()
    }
}

impl StageExecutor for ScriptedExecutor {
    fn run(&mut self, invocation: &StageInvocation) -> Result<StageOutcome, StageError> {
        self.invocations.push(invocation.clone());
        if self.spawn_failures.contains(&invocation.stage) {
            return Err(StageError::Spawn("No such file or directory".to_string()));
        }
        Ok(self.outcomes.get(&invocation.stage).cloned().unwrap_or_else(StageOutcome::success))
    }
}

// ============================================================================
// SECTION: Builders
// ============================================================================

/// Returns a runner config rooted in `root` with a fast pause poll.
pub fn runner_config(root: &Path, run_id: &str, rounds: u32) -> RunnerConfig {
    let mut config = RunnerConfig::new(root.join("autotrain"), root.join("out"));
    config.run_id = Some(run_id.to_string());
    config.rounds = rounds;
    config.pause_poll = Duration::from_millis(5);
    config
}

/// Writes `count` stage events through the real journal writer.
pub fn write_journal(path: &Path, run_id: &str, count: u32) {
    let mut journal = EventJournal::open(path, run_id).expect("open journal");
    journal
        .append(EventRecord::of_kind(EventKind::PipelineStart, "pipeline", 0, "start"))
        .expect("append start");
    let stages = ["generate", "validate", "test", "train", "eval"];
    for index in 1 .. count {
        let stage = stages[(index as usize) % stages.len()];
        journal
            .append(EventRecord::of_kind(EventKind::StageStart, stage, index, format!("step {index}")))
            .expect("append stage");
    }
}
