// crates/heidi-kernel-bridge/src/telemetry.rs
// ============================================================================
// Module: Kernel Bridge Telemetry
// Description: One structured event per kernel bridge call.
// Purpose: Emit call outcomes without a hard logging dependency.
// Dependencies: serde, serde_json, time
// ============================================================================

//! ## Overview
//! Every completed call produces a [`KernelBridgeCallEvent`] that a
//! [`BridgeTelemetrySink`] routes to stderr, an append-only file, or nowhere.
//! Events never carry request parameters or response payloads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use time::OffsetDateTime;

use crate::result::KernelBridgeResult;
use crate::result::KernelBridgeStatus;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Operation name carried by every call event.
pub const CALL_OP: &str = "kernel_bridge.call";

/// Telemetry event for one bridge call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelBridgeCallEvent {
    /// Operation identifier.
    pub op: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Daemon method.
    pub method: String,
    /// Configured endpoint.
    pub endpoint: String,
    /// Transport label (`null`, `unix`, `http`).
    pub transport: &'static str,
    /// Latency of the final attempt.
    pub latency_ms: u64,
    /// Whether the call succeeded.
    pub success: bool,
    /// Outcome class.
    pub status: KernelBridgeStatus,
    /// Retries performed.
    pub retry_count: u32,
    /// Response payload size in bytes.
    pub payload_size: usize,
    /// Error code when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Failure reason when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KernelBridgeCallEvent {
    /// Builds the event for `result`.
    #[must_use]
    pub fn new(method: &str, endpoint: &str, transport: &'static str, result: &KernelBridgeResult) -> Self {
        Self {
            op: CALL_OP,
            timestamp_ms: now_millis(),
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            transport,
            latency_ms: result.latency_ms,
            success: result.success,
            status: result.status,
            retry_count: result.retry_count,
            payload_size: result.payload_size,
            error_code: result.error_code.clone(),
            reason: result.reason.clone(),
        }
    }
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Sink for bridge call events.
pub trait BridgeTelemetrySink: Send + Sync {
    /// Record a call event.
    fn record(&self, event: &KernelBridgeCallEvent);
}

/// Sink that logs JSON lines to stderr.
pub struct StderrTelemetrySink;

impl BridgeTelemetrySink for StderrTelemetrySink {
    fn record(&self, event: &KernelBridgeCallEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Sink that appends JSON lines to a file.
pub struct FileTelemetrySink {
    /// Append-only file handle.
    file: Mutex<std::fs::File>,
}

impl FileTelemetrySink {
    /// Opens `path` in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl BridgeTelemetrySink for FileTelemetrySink {
    fn record(&self, event: &KernelBridgeCallEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// Sink that drops every event.
pub struct NoopTelemetrySink;

impl BridgeTelemetrySink for NoopTelemetrySink {
    fn record(&self, _event: &KernelBridgeCallEvent) {}
}

/// Milliseconds since the unix epoch.
fn now_millis() -> u128 {
    let elapsed = OffsetDateTime::now_utc() - OffsetDateTime::UNIX_EPOCH;
    u128::try_from(elapsed.whole_milliseconds()).unwrap_or_default()
}
