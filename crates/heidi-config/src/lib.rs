// crates/heidi-config/src/lib.rs
// ============================================================================
// Module: Heidi Config Library
// Description: Canonical config model, validation, and doctor checks.
// Purpose: Single source of truth for heidi.toml semantics.
// Dependencies: heidi-core, heidi-kernel-bridge, serde, toml
// ============================================================================

//! ## Overview
//! `heidi-config` defines the configuration model for the Heidi engine. It
//! provides strict, fail-closed validation and the pre-flight doctor.
//!
//! Security posture: config inputs are untrusted.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod doctor;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
pub use doctor::DoctorCheck;
pub use doctor::DoctorCheckId;
pub use doctor::DoctorReport;
pub use doctor::run_checks;
