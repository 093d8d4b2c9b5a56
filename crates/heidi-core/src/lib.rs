// crates/heidi-core/src/lib.rs
// ============================================================================
// Module: Heidi Core Library
// Description: Public API surface of the pipeline control plane.
// Purpose: Expose state, journal, provenance, and orchestration APIs.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Heidi core is the control plane of a long-running data and training
//! pipeline. It persists a finite-state machine as the single writer of run
//! state, records every pipeline event in a hash-chained journal that can be
//! replayed offline, and signs and freezes finished datasets. Stage programs
//! are reached only through [`interfaces::StageExecutor`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::Stage;
pub use interfaces::StageError;
pub use interfaces::StageExecutor;
pub use interfaces::StageInvocation;
pub use interfaces::StageOutcome;
pub use runtime::CommandStageExecutor;
pub use runtime::EventJournal;
pub use runtime::FinalizeReport;
pub use runtime::Finalizer;
pub use runtime::FinalizerError;
pub use runtime::JournalError;
pub use runtime::LoopRunner;
pub use runtime::PipelineRunner;
pub use runtime::ReplayError;
pub use runtime::ReplayReport;
pub use runtime::RunLock;
pub use runtime::RunnerConfig;
pub use runtime::RunnerControl;
pub use runtime::RunnerError;
pub use runtime::RunnerStatus;
pub use runtime::StateCache;
pub use runtime::StateCacheError;
pub use runtime::StateMachine;
pub use runtime::StateMachineError;
pub use runtime::verify_finalized;
pub use runtime::verify_journal;
