// crates/heidi-kernel-bridge/src/lib.rs
// ============================================================================
// Module: Heidi Kernel Bridge
// Description: Client for the local kernel daemon.
// Purpose: Bounded, retrying, fail-soft calls with per-call telemetry.
// Dependencies: reqwest, serde, serde_json, thiserror, url
// ============================================================================

//! ## Overview
//! The kernel bridge talks to an optional local daemon over a unix socket or
//! local HTTP. When disabled it answers every call in-process. Calls return
//! [`KernelBridgeResult`] values rather than errors; only configuration
//! problems and a required-but-unreachable daemon surface as
//! [`KernelBridgeError`].

pub mod bridge;
pub mod config;
pub mod result;
pub mod semaphore;
pub mod telemetry;
pub mod transport;

pub use bridge::KernelBridge;
pub use bridge::KernelBridgeError;
pub use bridge::METHOD_APPLY_POLICY;
pub use bridge::METHOD_PING;
pub use bridge::METHOD_STATUS;
pub use bridge::TRANSPORT_ERROR_CODE;
pub use config::Endpoint;
pub use config::KernelBridgeConfig;
pub use config::KernelBridgeConfigError;
pub use result::KernelBridgeResult;
pub use result::KernelBridgeStatus;
pub use semaphore::Semaphore;
pub use semaphore::SemaphoreError;
pub use semaphore::SemaphorePermit;
pub use telemetry::BridgeTelemetrySink;
pub use telemetry::FileTelemetrySink;
pub use telemetry::KernelBridgeCallEvent;
pub use telemetry::NoopTelemetrySink;
pub use telemetry::StderrTelemetrySink;
pub use transport::Transport;
pub use transport::TransportError;
