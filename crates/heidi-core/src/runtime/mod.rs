// crates/heidi-core/src/runtime/mod.rs
// ============================================================================
// Module: Heidi Runtime
// Description: File-owning components of the control plane.
// Purpose: Persist state, journal events, verify journals, and finalize runs.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Runtime modules own files on disk. The state machine and journal write
//! into a run directory under a single-writer discipline held by the
//! runner's lock; replay and the state cache only read; the finalizer writes
//! once into `verified/` and then freezes it.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod finalizer;
pub mod journal;
pub mod replay;
pub mod runner;
pub mod state_cache;
pub mod state_machine;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use finalizer::FinalizeReport;
pub use finalizer::Finalizer;
pub use finalizer::FinalizerError;
pub use finalizer::verify_finalized;
pub use journal::EventJournal;
pub use journal::JOURNAL_FILE;
pub use journal::JournalError;
pub use replay::ReplayError;
pub use replay::ReplayReport;
pub use replay::verify_journal;
pub use runner::CommandStageExecutor;
pub use runner::LoopRunner;
pub use runner::PipelineRunner;
pub use runner::RunLock;
pub use runner::RunnerConfig;
pub use runner::RunnerControl;
pub use runner::RunnerError;
pub use runner::RunnerStatus;
pub use state_cache::StateCache;
pub use state_cache::StateCacheError;
pub use state_machine::STATE_FILE;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineError;
pub use state_machine::run_dir_for;
