// crates/heidi-kernel-bridge/tests/bridge.rs
// ============================================================================
// Module: Kernel Bridge Tests
// Description: Calls against real unix-socket and HTTP daemon doubles.
// Purpose: Validate retries, concurrency bounds, timeouts, and telemetry.
// Dependencies: heidi-kernel-bridge, serde_json, tempfile, tiny_http
// ============================================================================
//! ## Overview
//! Exercises [`KernelBridge`] end to end over every transport and checks that
//! failures surface as results, never panics or errors.

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

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use heidi_kernel_bridge::FileTelemetrySink;
use heidi_kernel_bridge::KernelBridge;
use heidi_kernel_bridge::KernelBridgeConfig;
use heidi_kernel_bridge::KernelBridgeError;
use heidi_kernel_bridge::KernelBridgeStatus;
use heidi_kernel_bridge::TRANSPORT_ERROR_CODE;
use serde_json::Value;
use serde_json::json;
use tempfile::tempdir;

mod common;
use crate::common::Behavior;
use crate::common::HttpDaemon;
use crate::common::RecordingSink;
use crate::common::UnixDaemon;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Echo behavior without delay.
const ECHO: Behavior = Behavior::Echo {
    delay: Duration::ZERO,
};

/// Builds a disabled config with an absolute socket path.
fn disabled_config() -> KernelBridgeConfig {
    KernelBridgeConfig {
        enabled: false,
        endpoint: "unix:///nonexistent/heidi/kernel.sock".to_string(),
        ..KernelBridgeConfig::default()
    }
}

// ============================================================================
// SECTION: Null Transport
// ============================================================================

/// Tests that a disabled bridge answers locally.
#[test]
fn disabled_bridge_answers_locally() {
    let bridge = KernelBridge::new(disabled_config()).expect("bridge");
    assert_eq!(bridge.transport_kind(), "null");
    assert!(bridge.is_available());
    let result = bridge.ping();
    assert!(result.success);
    assert_eq!(result.status, KernelBridgeStatus::Ok);
    let payload = result.payload.expect("payload");
    assert_eq!(payload["method"], json!("PING"));
    assert_eq!(payload["mock"], json!(true));
    assert!(result.payload_size > 0);
}

/// Tests that a closed bridge reports unavailable.
#[test]
fn closed_bridge_reports_unavailable() {
    let bridge = KernelBridge::new(disabled_config()).expect("bridge");
    bridge.close();
    assert_eq!(bridge.transport_kind(), "closed");
    assert!(!bridge.is_available());
    let result = bridge.status();
    assert_eq!(result.status, KernelBridgeStatus::Unavailable);
    assert!(!result.success);
}

/// Tests that an empty method is rejected before transport.
#[test]
fn empty_method_is_invalid_request() {
    let bridge = KernelBridge::new(disabled_config()).expect("bridge");
    let result = bridge.call("  ", &json!({}));
    assert_eq!(result.status, KernelBridgeStatus::InvalidRequest);
    assert_eq!(result.retry_count, 0);
}

/// Tests that an invalid config never builds a bridge.
#[test]
fn invalid_config_is_rejected() {
    let config = KernelBridgeConfig {
        max_inflight: 0,
        ..disabled_config()
    };
    assert!(matches!(KernelBridge::new(config), Err(KernelBridgeError::Config(_))));
}

// ============================================================================
// SECTION: Unix Transport
// ============================================================================

/// Tests a successful unix-socket exchange.
#[test]
fn unix_call_round_trips_method_and_params() {
    let daemon = UnixDaemon::spawn(ECHO);
    let bridge = KernelBridge::new(daemon.config()).expect("bridge");
    assert_eq!(bridge.transport_kind(), "unix");
    assert!(bridge.is_available());
    let result = bridge.apply_policy(&json!({"max_cpu_pct": 80}));
    assert!(result.success, "{result:?}");
    assert_eq!(result.retry_count, 0);
    let payload = result.payload.expect("payload");
    assert_eq!(payload["method"], json!("APPLY_POLICY"));
    assert_eq!(payload["params"], json!({"policy": {"max_cpu_pct": 80}}));
    assert_eq!(daemon.counters.connections(), 1);
}

/// Tests that in-flight calls never exceed the configured bound.
#[test]
fn concurrent_calls_respect_max_inflight() {
    let daemon = UnixDaemon::spawn(Behavior::Echo {
        delay: Duration::from_millis(80),
    });
    let config = KernelBridgeConfig {
        max_inflight: 2,
        ..daemon.config()
    };
    let bridge = Arc::new(KernelBridge::new(config).expect("bridge"));
    let workers: Vec<_> = (0 .. 6)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.ping())
        })
        .collect();
    for worker in workers {
        assert!(worker.join().expect("join").success);
    }
    assert_eq!(daemon.counters.connections(), 6);
    assert!(daemon.counters.peak() <= 2, "peak {}", daemon.counters.peak());
    assert_eq!(bridge.available_permits(), 2);
}

/// Tests that a hang-up is retried and reported as a transport error.
#[test]
fn hangups_are_retried_then_reported() {
    let daemon = UnixDaemon::spawn(Behavior::Hangup);
    let bridge = KernelBridge::new(daemon.config()).expect("bridge");
    let result = bridge.ping();
    assert_eq!(result.status, KernelBridgeStatus::Error);
    assert_eq!(result.error_code.as_deref(), Some(TRANSPORT_ERROR_CODE));
    assert_eq!(result.retry_count, 2);
    assert_eq!(daemon.counters.connections(), 3);
}

/// Tests that latency covers every attempt and the backoff between them.
#[test]
fn latency_spans_all_retries() {
    let daemon = UnixDaemon::spawn(Behavior::Hangup);
    let sink = Arc::new(RecordingSink::default());
    let bridge = KernelBridge::with_telemetry(daemon.config(), sink.clone()).expect("bridge");
    let result = bridge.ping();
    assert_eq!(result.retry_count, 2);
    assert!(result.latency_ms >= 30, "latency {}", result.latency_ms);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].latency_ms, result.latency_ms);
}

/// Tests that daemon-reported errors carry their code.
#[test]
fn daemon_errors_carry_code_and_reason() {
    let daemon = UnixDaemon::spawn(Behavior::Fail {
        code: "E_DENIED",
    });
    let config = KernelBridgeConfig {
        retry_attempts: 1,
        ..daemon.config()
    };
    let bridge = KernelBridge::new(config).expect("bridge");
    let result = bridge.status();
    assert_eq!(result.status, KernelBridgeStatus::Error);
    assert_eq!(result.reason.as_deref(), Some("policy denied"));
    assert_eq!(result.error_code.as_deref(), Some("E_DENIED"));
    assert_eq!(result.retry_count, 1);
    assert_eq!(daemon.counters.connections(), 2);
}

/// Tests that non-JSON responses are transport errors.
#[test]
fn garbage_responses_are_transport_errors() {
    let daemon = UnixDaemon::spawn(Behavior::Garbage);
    let config = KernelBridgeConfig {
        retry_attempts: 0,
        ..daemon.config()
    };
    let result = KernelBridge::new(config).expect("bridge").ping();
    assert_eq!(result.error_code.as_deref(), Some(TRANSPORT_ERROR_CODE));
    assert_eq!(result.retry_count, 0);
}

/// Tests that a slow daemon yields a timeout result.
#[test]
fn slow_daemon_times_out() {
    let daemon = UnixDaemon::spawn(Behavior::Echo {
        delay: Duration::from_millis(600),
    });
    let config = KernelBridgeConfig {
        timeout_ms: 100,
        retry_attempts: 0,
        ..daemon.config()
    };
    let result = KernelBridge::new(config).expect("bridge").ping();
    assert_eq!(result.status, KernelBridgeStatus::Timeout);
    assert_eq!(result.reason.as_deref(), Some("Request timed out"));
}

/// Tests the required-bridge preflight.
#[test]
fn required_bridge_fails_preflight_when_unreachable() {
    let dir = tempdir().expect("temp dir");
    let endpoint = format!("unix://{}", dir.path().join("missing.sock").display());
    let optional = KernelBridge::new(KernelBridgeConfig::new(endpoint.clone()).expect("config")).expect("bridge");
    assert!(!optional.is_available());
    assert!(optional.ensure_available().is_ok());

    let required = KernelBridgeConfig {
        required: true,
        retry_attempts: 0,
        ..KernelBridgeConfig::new(endpoint).expect("config")
    };
    let bridge = KernelBridge::new(required).expect("bridge");
    assert!(matches!(bridge.ensure_available(), Err(KernelBridgeError::RequiredUnavailable(_))));
    let result = bridge.ping();
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some(TRANSPORT_ERROR_CODE));
}

// ============================================================================
// SECTION: HTTP Transport
// ============================================================================

/// Tests a successful HTTP exchange and health probe.
#[test]
fn http_call_round_trips() {
    let daemon = HttpDaemon::spawn(ECHO, 200);
    let bridge = KernelBridge::new(daemon.config()).expect("bridge");
    assert_eq!(bridge.transport_kind(), "http");
    assert!(bridge.is_available());
    let result = bridge.call("STATUS", &json!({"verbose": true}));
    assert!(result.success, "{result:?}");
    let payload = result.payload.expect("payload");
    assert_eq!(payload["method"], json!("STATUS"));
    assert_eq!(payload["params"], json!({"verbose": true}));
}

/// Tests that non-success HTTP statuses become coded error results.
#[test]
fn http_error_status_is_coded() {
    let daemon = HttpDaemon::spawn(ECHO, 503);
    let config = KernelBridgeConfig {
        retry_attempts: 1,
        ..daemon.config()
    };
    let result = KernelBridge::new(config).expect("bridge").ping();
    assert_eq!(result.status, KernelBridgeStatus::Error);
    assert_eq!(result.error_code.as_deref(), Some("http_503"));
    assert_eq!(result.retry_count, 1);
    assert_eq!(daemon.counters.connections(), 2);
}

/// Tests daemon errors over HTTP.
#[test]
fn http_daemon_error_body_is_reported() {
    let daemon = HttpDaemon::spawn(
        Behavior::Fail {
            code: "E_POLICY",
        },
        200,
    );
    let config = KernelBridgeConfig {
        retry_attempts: 0,
        ..daemon.config()
    };
    let result = KernelBridge::new(config).expect("bridge").apply_policy(&json!({}));
    assert_eq!(result.error_code.as_deref(), Some("E_POLICY"));
    assert_eq!(result.reason.as_deref(), Some("policy denied"));
}

// ============================================================================
// SECTION: Telemetry
// ============================================================================

/// Tests that every call emits exactly one event.
#[test]
fn one_event_is_recorded_per_call() {
    let daemon = UnixDaemon::spawn(Behavior::Hangup);
    let sink = Arc::new(RecordingSink::default());
    let bridge = KernelBridge::with_telemetry(daemon.config(), sink.clone()).expect("bridge");
    let _ = bridge.ping();
    let _ = bridge.call("", &json!({}));
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].op, "kernel_bridge.call");
    assert_eq!(events[0].method, "PING");
    assert_eq!(events[0].transport, "unix");
    assert_eq!(events[0].retry_count, 2);
    assert!(!events[0].success);
    assert!(events[0].timestamp_ms > 1_600_000_000_000, "ts {}", events[0].timestamp_ms);
    assert_eq!(events[1].status, KernelBridgeStatus::InvalidRequest);
}

/// Tests that the file sink writes JSON lines without payloads.
#[test]
fn file_sink_writes_json_lines() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("bridge.jsonl");
    let sink = Arc::new(FileTelemetrySink::new(&path).expect("sink"));
    let bridge = KernelBridge::with_telemetry(disabled_config(), sink).expect("bridge");
    let _ = bridge.apply_policy(&json!({"secret": "value"}));
    let _ = bridge.ping();
    let content = fs::read_to_string(&path).expect("read");
    let lines: Vec<Value> = content.lines().map(|line| serde_json::from_str(line).expect("json")).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["method"], json!("APPLY_POLICY"));
    assert_eq!(lines[0]["status"], json!("ok"));
    assert!(lines[0].get("error_code").is_none());
    assert!(!content.contains("secret"));
}
