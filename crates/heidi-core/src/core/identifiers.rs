// crates/heidi-core/src/core/identifiers.rs
// ============================================================================
// Module: Heidi Identifiers
// Description: Run identifier generation, validation, and timestamps.
// Purpose: Keep run ids safe to embed in filesystem paths.
// Dependencies: rand, time
// ============================================================================

//! ## Overview
//! A run id names a directory under `runs/` and under `verified/`, so it is
//! restricted to `[A-Za-z0-9_.-]` and may not be `.` or `..`. Generated ids
//! look like `run_20260117_093011_1f0c3a9e`.

// ============================================================================
// SECTION: Imports
// ============================================================================


use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum accepted run id length.
pub const MAX_RUN_ID_LENGTH: usize = 128;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised for malformed run identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunIdError {
    /// The run id is empty.
    #[error("run id must be non-empty")]
    Empty,
    /// The run id exceeds [`MAX_RUN_ID_LENGTH`].
    #[error("run id exceeds 128 characters")]
    TooLong,
    /// The run id contains a path separator or other unsafe character.
    #[error("run id contains invalid characters: {0}")]
    InvalidCharacters(String),
}

// ============================================================================
// SECTION: Run Ids
// ============================================================================

/// Validates a run id for use as a single path component.
///
/// # Errors
///
/// Returns [`RunIdError`] when the id is empty, too long, a dot segment, or
/// contains characters outside `[A-Za-z0-9_.-]`.
pub fn validate_run_id(run_id: &str) -> Result<(), RunIdError> {
    if run_id.is_empty() {
        return Err(RunIdError::Empty);
    }
    if run_id.len() > MAX_RUN_ID_LENGTH {
        return Err(RunIdError::TooLong);
    }
    if run_id == "." || run_id == ".." {
        return Err(RunIdError::InvalidCharacters(run_id.to_string()));
    }
    let valid = run_id
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.'));
    if !valid {
        return Err(RunIdError::InvalidCharacters(run_id.to_string()));
    }
    Ok(())
}

/// Generates a fresh run id of the form `run_YYYYMMDD_HHMMSS_xxxxxxxx`.
#[must_use]
pub fn generate_run_id() -> String {
    let now = OffsetDateTime::now_utc();
    let suffix: u32 = rand::random();
    format!(
        "run_{:04}{:02}{:02}_{:02}{:02}{:02}_{suffix:08x}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
    )
}

// ============================================================================
// SECTION: Timestamps
// ============================================================================

/// Returns the current UTC time as an RFC 3339 string.
#[must_use]
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339).unwrap_or_else(|_| format!("{}", now.unix_timestamp()))
}

/// Returns milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u128 {
    let elapsed = OffsetDateTime::now_utc() - OffsetDateTime::UNIX_EPOCH;
    u128::try_from(elapsed.whole_milliseconds()).unwrap_or_default()
}

// ============================================================================
// SECTION: Tests
// ============================================================================
