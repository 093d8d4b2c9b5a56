// crates/heidi-kernel-bridge/src/bridge.rs
// ============================================================================
// Module: Kernel Bridge Client
// Description: Bounded, retrying client for the local kernel daemon.
// Purpose: Turn every daemon interaction into a typed result and one event.
// Dependencies: serde_json, thiserror
// ============================================================================

//! ## Overview
//! [`KernelBridge`] owns a [`Transport`], a concurrency [`Semaphore`], and a
//! telemetry sink. [`KernelBridge::call`] never fails for transport reasons:
//! retryable outcomes are retried with linear backoff and the final outcome
//! is returned as a [`KernelBridgeResult`].
//!
//! Security posture: the daemon is a local peer; see
//! [`KernelBridgeConfig::parsed_endpoint`] for endpoint restrictions.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::thread;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::config::KernelBridgeConfig;
use crate::config::KernelBridgeConfigError;
use crate::result::KernelBridgeResult;
use crate::result::UNAVAILABLE_REASON;
use crate::semaphore::Semaphore;
use crate::telemetry::BridgeTelemetrySink;
use crate::telemetry::KernelBridgeCallEvent;
use crate::telemetry::NoopTelemetrySink;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::transport::elapsed_ms;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Liveness probe method.
pub const METHOD_PING: &str = "PING";
/// Daemon status method.
pub const METHOD_STATUS: &str = "STATUS";
/// Policy push method.
pub const METHOD_APPLY_POLICY: &str = "APPLY_POLICY";
/// Error code for results built from transport failures.
pub const TRANSPORT_ERROR_CODE: &str = "transport_error";
/// Transport label reported once the bridge is closed.
const CLOSED_KIND: &str = "closed";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Kernel bridge failures.
#[derive(Debug, Error)]
pub enum KernelBridgeError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] KernelBridgeConfigError),
    /// The transport could not be built.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The bridge is required but the daemon is unreachable.
    #[error("kernel bridge required but unavailable: {0}")]
    RequiredUnavailable(String),
}

// ============================================================================
// SECTION: Bridge
// ============================================================================

/// Client for the kernel daemon.
///
/// # Invariants
/// - At most `max_inflight` calls hold a transport at once.
/// - Exactly one telemetry event is recorded per call.
pub struct KernelBridge {
    /// Validated settings.
    config: KernelBridgeConfig,
    /// Active transport; `None` once closed.
    transport: RwLock<Option<Arc<Transport>>>,
    /// Concurrency bound.
    semaphore: Semaphore,
    /// Call event sink.
    telemetry: Arc<dyn BridgeTelemetrySink>,
}

impl KernelBridge {
    /// Creates a bridge that records no telemetry.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeError`] when the configuration is invalid.
    pub fn new(config: KernelBridgeConfig) -> Result<Self, KernelBridgeError> {
        Self::with_telemetry(config, Arc::new(NoopTelemetrySink))
    }

    /// Creates a bridge recording call events to `telemetry`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeError`] when the configuration is invalid or the
    /// transport cannot be built.
    pub fn with_telemetry(
        config: KernelBridgeConfig,
        telemetry: Arc<dyn BridgeTelemetrySink>,
    ) -> Result<Self, KernelBridgeError> {
        config.validate()?;
        let transport = Transport::from_config(&config)?;
        Ok(Self {
            semaphore: Semaphore::new(config.max_inflight),
            config,
            transport: RwLock::new(Some(Arc::new(transport))),
            telemetry,
        })
    }

    /// Returns the settings in use.
    #[must_use]
    pub const fn config(&self) -> &KernelBridgeConfig {
        &self.config
    }

    /// Returns the active transport label, or `closed`.
    #[must_use]
    pub fn transport_kind(&self) -> &'static str {
        self.transport().map_or(CLOSED_KIND, |transport| transport.kind())
    }

    /// Returns the number of free call slots.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available()
    }

    /// Calls `method` with `params`, retrying retryable outcomes.
    #[must_use]
    pub fn call(&self, method: &str, params: &Value) -> KernelBridgeResult {
        let result = self.call_inner(method, params);
        let kind = self.transport_kind();
        self.telemetry.record(&KernelBridgeCallEvent::new(method, &self.config.endpoint, kind, &result));
        result
    }

    /// Sends `PING`.
    #[must_use]
    pub fn ping(&self) -> KernelBridgeResult {
        self.call(METHOD_PING, &json!({}))
    }

    /// Sends `STATUS`.
    #[must_use]
    pub fn status(&self) -> KernelBridgeResult {
        self.call(METHOD_STATUS, &json!({}))
    }

    /// Sends `APPLY_POLICY` carrying `policy`.
    #[must_use]
    pub fn apply_policy(&self, policy: &Value) -> KernelBridgeResult {
        self.call(METHOD_APPLY_POLICY, &json!({ "policy": policy }))
    }

    /// Returns true when the transport looks reachable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.transport().is_some_and(|transport| transport.is_available())
    }

    /// Fails when the bridge is required but unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeError::RequiredUnavailable`] naming the endpoint.
    pub fn ensure_available(&self) -> Result<(), KernelBridgeError> {
        if self.config.required && !self.is_available() {
            return Err(KernelBridgeError::RequiredUnavailable(self.config.endpoint.clone()));
        }
        Ok(())
    }

    /// Drops the transport; later calls return unavailable results.
    pub fn close(&self) {
        let mut slot = self.transport.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    /// Returns the active transport.
    fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Runs the bounded retry loop for one call.
    fn call_inner(&self, method: &str, params: &Value) -> KernelBridgeResult {
        if method.trim().is_empty() {
            return KernelBridgeResult::invalid_request("method must not be empty");
        }
        let Some(transport) = self.transport() else {
            return KernelBridgeResult::unavailable(UNAVAILABLE_REASON);
        };
        let Ok(_permit) = self.semaphore.acquire() else {
            return KernelBridgeResult::unavailable("call semaphore poisoned");
        };
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let result = match transport.call(method, params) {
                Ok(result) => result,
                Err(err) => KernelBridgeResult::error(
                    err.to_string(),
                    Some(TRANSPORT_ERROR_CODE.to_string()),
                    elapsed_ms(started),
                ),
            };
            if !result.is_retryable() || attempt >= self.config.retry_attempts {
                return result.with_retry_count(attempt).with_latency_ms(elapsed_ms(started));
            }
            thread::sleep(self.config.retry_delay(attempt));
            attempt += 1;
        }
    }
}
