// crates/heidi-kernel-bridge/src/result.rs
// ============================================================================
// Module: Kernel Bridge Results
// Description: Typed outcome of a kernel bridge call.
// Purpose: Surface transport failures as values instead of errors.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Every [`crate::KernelBridge::call`] returns a [`KernelBridgeResult`].
//! Failures are data: callers branch on `success` and `status`, and only a
//! required-but-unavailable bridge is ever an error.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Reason attached to timeout results.
pub const TIMEOUT_REASON: &str = "Request timed out";
/// Default reason for unavailable results.
pub const UNAVAILABLE_REASON: &str = "Kernel bridge unavailable";

// ============================================================================
// SECTION: Types
// ============================================================================

/// Outcome class of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelBridgeStatus {
    /// The daemon answered.
    Ok,
    /// The daemon or the transport reported a failure.
    Error,
    /// The call exceeded its timeout.
    Timeout,
    /// No transport is available.
    Unavailable,
    /// The request itself was rejected.
    InvalidRequest,
}

impl KernelBridgeStatus {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for KernelBridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one bridge call, after retries.
///
/// # Invariants
/// - `success` is true exactly when `status` is [`KernelBridgeStatus::Ok`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelBridgeResult {
    /// Outcome class.
    pub status: KernelBridgeStatus,
    /// Whether the call succeeded.
    pub success: bool,
    /// Failure reason.
    pub reason: Option<String>,
    /// Elapsed time of the whole call, retries and backoff included, in
    /// milliseconds.
    pub latency_ms: u64,
    /// Compact JSON length of `payload`.
    pub payload_size: usize,
    /// Daemon response.
    pub payload: Option<Value>,
    /// Daemon or transport error code.
    pub error_code: Option<String>,
    /// Retries performed before this result.
    pub retry_count: u32,
}

impl KernelBridgeResult {
    /// Builds a successful result.
    #[must_use]
    pub fn success(payload: Value, latency_ms: u64) -> Self {
        let payload_size = serde_json::to_vec(&payload).map_or(0, |bytes| bytes.len());
        Self {
            status: KernelBridgeStatus::Ok,
            success: true,
            reason: None,
            latency_ms,
            payload_size,
            payload: Some(payload),
            error_code: None,
            retry_count: 0,
        }
    }

    /// Builds an error result.
    #[must_use]
    pub fn error(reason: impl Into<String>, error_code: Option<String>, latency_ms: u64) -> Self {
        Self::failure(KernelBridgeStatus::Error, reason.into(), error_code, latency_ms)
    }

    /// Builds a timeout result.
    #[must_use]
    pub fn timeout(latency_ms: u64) -> Self {
        Self::failure(KernelBridgeStatus::Timeout, TIMEOUT_REASON.to_string(), None, latency_ms)
    }

    /// Builds an unavailable result.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::failure(KernelBridgeStatus::Unavailable, reason.into(), None, 0)
    }

    /// Builds an invalid-request result.
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::failure(KernelBridgeStatus::InvalidRequest, reason.into(), None, 0)
    }

    /// Records the number of retries performed.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Records the elapsed time of the whole call.
    #[must_use]
    pub const fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Returns true when another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !self.success && matches!(self.status, KernelBridgeStatus::Error | KernelBridgeStatus::Timeout)
    }

    /// Builds a failed result of `status`.
    fn failure(
        status: KernelBridgeStatus,
        reason: String,
        error_code: Option<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            status,
            success: false,
            reason: Some(reason),
            latency_ms,
            payload_size: 0,
            payload: None,
            error_code,
            retry_count: 0,
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
