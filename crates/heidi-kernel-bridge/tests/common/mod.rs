// crates/heidi-kernel-bridge/tests/common/mod.rs
// ============================================================================
// Module: Common Test Utilities
// Description: Daemon doubles for kernel bridge integration tests.
// Purpose: Serve real unix-socket and HTTP exchanges with scripted behavior.
// Dependencies: heidi-kernel-bridge, serde_json, tempfile, tiny_http
// ============================================================================

//! ## Overview
//! [`UnixDaemon`] binds a socket in a temp dir and answers framed requests
//! according to a [`Behavior`], counting connections and peak concurrency.
//! [`HttpDaemon`] does the same over `tiny_http`.

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

use std::io::Write;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use heidi_kernel_bridge::BridgeTelemetrySink;
use heidi_kernel_bridge::KernelBridgeCallEvent;
use heidi_kernel_bridge::KernelBridgeConfig;
use heidi_kernel_bridge::transport::MAX_FRAME_BYTES;
use heidi_kernel_bridge::transport::encode_frame;
use heidi_kernel_bridge::transport::read_frame;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;
use tempfile::tempdir;
use tiny_http::Header;
use tiny_http::Response;
use tiny_http::Server;

// ============================================================================
// SECTION: Behavior
// ============================================================================

/// Scripted daemon behavior.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Echo `method` and `params` after `delay`.
    Echo {
        /// Processing delay.
        delay: Duration,
    },
    /// Accept and close without answering.
    Hangup,
    /// Answer with a daemon error.
    Fail {
        /// Error code to report.
        code: &'static str,
    },
    /// Answer with a non-JSON body.
    Garbage,
}

/// Connection counters shared with the daemon threads.
#[derive(Debug, Default)]
pub struct Counters {
    /// Accepted connections or requests.
    pub connections: AtomicUsize,
    /// Requests currently being processed.
    pub active: AtomicUsize,
    /// Peak of `active`.
    pub peak: AtomicUsize,
}

impl Counters {
    /// Marks a request as started.
    fn enter(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
    }

    /// Marks a request as finished.
    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Returns the connection count.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Returns the peak concurrency.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Builds the daemon answer for `request`, or `None` to hang up.
fn answer(behavior: &Behavior, request: &Value) -> Option<Vec<u8>> {
    match behavior {
        Behavior::Echo {
            delay,
        } => {
            thread::sleep(*delay);
            let body = json!({
                "ok": true,
                "method": request["method"],
                "params": request["params"],
            });
            Some(serde_json::to_vec(&body).expect("encode"))
        }
        Behavior::Hangup => None,
        Behavior::Fail {
            code,
        } => {
            let body = json!({"error": {"message": "policy denied", "code": code}});
            Some(serde_json::to_vec(&body).expect("encode"))
        }
        Behavior::Garbage => Some(b"not json".to_vec()),
    }
}

// ============================================================================
// SECTION: Unix Daemon
// ============================================================================

/// Unix-socket daemon double.
pub struct UnixDaemon {
    /// Socket path.
    pub path: PathBuf,
    /// Shared counters.
    pub counters: Arc<Counters>,
    /// Keeps the socket directory alive.
    _dir: TempDir,
}

impl UnixDaemon {
    /// Binds a socket and serves `behavior` on a background thread.
    pub fn spawn(behavior: Behavior) -> Self {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("kernel.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let counters = Arc::new(Counters::default());
        let shared = Arc::clone(&counters);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    break;
                };
                let counters = Arc::clone(&shared);
                let behavior = behavior.clone();
                thread::spawn(move || serve_unix(stream, &behavior, &counters));
            }
        });
        Self {
            path,
            counters,
            _dir: dir,
        }
    }

    /// Returns the `unix://` endpoint.
    pub fn endpoint(&self) -> String {
        format!("unix://{}", self.path.display())
    }

    /// Returns an enabled config for this daemon.
    pub fn config(&self) -> KernelBridgeConfig {
        KernelBridgeConfig {
            retry_delay_ms: 10,
            ..KernelBridgeConfig::new(self.endpoint()).expect("config")
        }
    }
}

/// Serves one unix connection.
fn serve_unix(mut stream: UnixStream, behavior: &Behavior, counters: &Counters) {
    counters.enter();
    let request = read_frame(&mut stream, MAX_FRAME_BYTES)
        .ok()
        .and_then(|body| serde_json::from_slice::<Value>(&body).ok());
    let reply = request.as_ref().and_then(|request| answer(behavior, request));
    counters.leave();
    if let Some(reply) = reply {
        let _ = stream.write_all(&encode_frame(&reply).expect("frame"));
        let _ = stream.flush();
    }
}

// ============================================================================
// SECTION: HTTP Daemon
// ============================================================================

/// HTTP daemon double.
pub struct HttpDaemon {
    /// Base URL.
    pub base: String,
    /// Shared counters for `/api/call`.
    pub counters: Arc<Counters>,
}

impl HttpDaemon {
    /// Serves `behavior` on `/api/call` and 200 on `/health`; any other
    /// `status` is returned verbatim for calls.
    pub fn spawn(behavior: Behavior, status: u16) -> Self {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let counters = Arc::new(Counters::default());
        let shared = Arc::clone(&counters);
        thread::spawn(move || {
            while let Ok(mut request) = server.recv() {
                if request.url() == "/health" {
                    let _ = request.respond(Response::from_string("ok"));
                    continue;
                }
                shared.enter();
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                let reply = answer(&behavior, &parsed).unwrap_or_default();
                shared.leave();
                let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap();
                let response = Response::from_data(reply).with_status_code(status).with_header(header);
                let _ = request.respond(response);
            }
        });
        Self {
            base: format!("http://{addr}"),
            counters,
        }
    }

    /// Returns an enabled config for this daemon.
    pub fn config(&self) -> KernelBridgeConfig {
        KernelBridgeConfig {
            retry_delay_ms: 10,
            ..KernelBridgeConfig::new(self.base.clone()).expect("config")
        }
    }
}

// ============================================================================
// SECTION: Telemetry
// ============================================================================

/// Sink collecting events in memory.
#[derive(Default)]
pub struct RecordingSink {
    /// Recorded events.
    pub events: Mutex<Vec<KernelBridgeCallEvent>>,
}

impl RecordingSink {
    /// Returns a copy of the recorded events.
    pub fn events(&self) -> Vec<KernelBridgeCallEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl BridgeTelemetrySink for RecordingSink {
    fn record(&self, event: &KernelBridgeCallEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
