// crates/heidi-kernel-bridge/src/transport.rs
// ============================================================================
// Module: Kernel Bridge Transports
// Description: Null, unix-socket, and local HTTP transports to the daemon.
// Purpose: Carry one request/response exchange with strict size limits.
// Dependencies: reqwest, serde_json, time
// ============================================================================

//! ## Overview
//! [`Transport`] is a closed set of exchange mechanisms selected from the
//! endpoint scheme:
//! - `Null` answers locally and echoes the request (bridge disabled).
//! - `UnixSocket` writes one length-prefixed JSON frame (4-byte big-endian
//!   length) and reads one frame back.
//! - `Http` POSTs JSON to `/api/call` on a local host.
//!
//! A daemon response whose `error` member is truthy becomes an error result.
//! Timeouts become timeout results. Everything else that goes wrong is a
//! [`TransportError`], which the bridge retries.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use reqwest::blocking::Client;
use reqwest::blocking::Response;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::Endpoint;
use crate::config::KernelBridgeConfig;
use crate::config::KernelBridgeConfigError;
use crate::result::KernelBridgeResult;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum frame or response body size in bytes.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
/// Length of the unix frame header.
pub const FRAME_HEADER_LEN: usize = 4;
/// HTTP path receiving calls.
pub const CALL_PATH: &str = "/api/call";
/// HTTP path answering health checks.
pub const HEALTH_PATH: &str = "/health";
/// Latency of the null transport.
const NULL_LATENCY: Duration = Duration::from_millis(1);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint is invalid.
    #[error(transparent)]
    Config(#[from] KernelBridgeConfigError),
    /// The daemon could not be reached.
    #[error("kernel connect failed: {0}")]
    Connect(String),
    /// Reading or writing the exchange failed.
    #[error("kernel transport io error: {0}")]
    Io(String),
    /// A read or write exceeded the configured timeout.
    #[error("kernel transport timed out")]
    TimedOut,
    /// A frame or body exceeded [`MAX_FRAME_BYTES`].
    #[error("kernel frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// The daemon answered with something other than a JSON value.
    #[error("invalid kernel response: {0}")]
    InvalidResponse(String),
    /// The HTTP client failed.
    #[error("kernel http client error: {0}")]
    Client(String),
}

// ============================================================================
// SECTION: Transport
// ============================================================================

/// Exchange mechanism with the kernel daemon.
#[derive(Debug)]
pub enum Transport {
    /// Local echo used while the bridge is disabled.
    Null,
    /// Length-prefixed frames over a unix socket.
    UnixSocket(UnixSocketTransport),
    /// JSON over local HTTP.
    Http(HttpTransport),
}

impl Transport {
    /// Selects the transport for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the endpoint is invalid or the HTTP
    /// client cannot be built.
    pub fn from_config(config: &KernelBridgeConfig) -> Result<Self, TransportError> {
        if !config.enabled {
            return Ok(Self::Null);
        }
        match config.parsed_endpoint()? {
            Endpoint::Unix(path) => Ok(Self::UnixSocket(UnixSocketTransport::new(path, config.timeout()))),
            Endpoint::Http(base) => Ok(Self::Http(HttpTransport::new(base, config.timeout())?)),
        }
    }

    /// Performs one exchange.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the exchange fails for a reason other
    /// than a timeout or a daemon-reported error.
    pub fn call(&self, method: &str, params: &Value) -> Result<KernelBridgeResult, TransportError> {
        match self {
            Self::Null => Ok(null_call(method, params)),
            Self::UnixSocket(transport) => transport.call(method, params),
            Self::Http(transport) => transport.call(method, params),
        }
    }

    /// Returns true when the daemon looks reachable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        match self {
            Self::Null => true,
            Self::UnixSocket(transport) => transport.is_available(),
            Self::Http(transport) => transport.is_available(),
        }
    }

    /// Returns a short transport label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::UnixSocket(_) => "unix",
            Self::Http(_) => "http",
        }
    }
}

/// Answers a call locally.
fn null_call(method: &str, params: &Value) -> KernelBridgeResult {
    let started = Instant::now();
    thread::sleep(NULL_LATENCY);
    let payload = json!({
        "method": method,
        "params": params,
        "mock": true,
        "timestamp": unix_seconds(),
    });
    KernelBridgeResult::success(payload, elapsed_ms(started))
}

// ============================================================================
// SECTION: Unix Socket
// ============================================================================

/// Unix-socket transport.
#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    /// Socket path.
    path: PathBuf,
    /// Read and write timeout.
    timeout: Duration,
}

impl UnixSocketTransport {
    /// Creates a transport for `path`.
    #[must_use]
    pub fn new(path: &Path, timeout: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout,
        }
    }

    /// Returns true when the socket file exists.
    #[must_use]
    pub fn is_available(&self) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            std::fs::metadata(&self.path).is_ok_and(|meta| meta.file_type().is_socket())
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Sends one request frame and reads one response frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on connect, io, framing, or decode failure.
    #[cfg(unix)]
    pub fn call(&self, method: &str, params: &Value) -> Result<KernelBridgeResult, TransportError> {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let started = Instant::now();
        let request = request_body(method, params)?;
        let frame = encode_frame(&request)?;
        let mut stream = UnixStream::connect(&self.path)
            .map_err(|err| TransportError::Connect(format!("{}: {err}", self.path.display())))?;
        stream.set_read_timeout(Some(self.timeout)).map_err(|err| TransportError::Io(err.to_string()))?;
        stream.set_write_timeout(Some(self.timeout)).map_err(|err| TransportError::Io(err.to_string()))?;
        let exchange = stream
            .write_all(&frame)
            .and_then(|()| stream.flush())
            .map_err(TransportError::from)
            .and_then(|()| read_frame(&mut stream, MAX_FRAME_BYTES));
        match exchange {
            Ok(body) => interpret_response(&body, elapsed_ms(started)),
            Err(TransportError::TimedOut) => Ok(KernelBridgeResult::timeout(elapsed_ms(started))),
            Err(err) => Err(err),
        }
    }

    /// Unix sockets are unavailable on this platform.
    ///
    /// # Errors
    ///
    /// Always returns [`TransportError::Connect`].
    #[cfg(not(unix))]
    pub fn call(&self, _method: &str, _params: &Value) -> Result<KernelBridgeResult, TransportError> {
        Err(TransportError::Connect("unix sockets are not supported on this platform".to_string()))
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Prefixes `payload` with its 4-byte big-endian length.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] above [`MAX_FRAME_BYTES`].
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reads one length-prefixed frame of at most `max_bytes`.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] when the header announces more
/// than `max_bytes`, or [`TransportError::Io`] on short reads.
pub fn read_frame<R: Read>(reader: &mut R, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
    let mut header = [0_u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = usize::try_from(u32::from_be_bytes(header)).map_err(|_| TransportError::FrameTooLarge(usize::MAX))?;
    if len > max_bytes {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

// ============================================================================
// SECTION: HTTP
// ============================================================================

/// Local HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Base URL without a trailing slash.
    base: String,
    /// Blocking client with timeout and no redirects.
    client: Client,
}

impl HttpTransport {
    /// Creates a transport for `base`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Client`] when the client cannot be built.
    pub fn new(base: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|err| TransportError::Client(format!("http client build failed: {err}")))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Returns true when `GET /health` answers with a success status.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.client
            .get(format!("{}{HEALTH_PATH}", self.base))
            .send()
            .is_ok_and(|response| response.status().is_success())
    }

    /// POSTs one request to `/api/call`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on connect, client, size, or decode
    /// failure.
    pub fn call(&self, method: &str, params: &Value) -> Result<KernelBridgeResult, TransportError> {
        let started = Instant::now();
        let request = request_body(method, params)?;
        if request.len() > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(request.len()));
        }
        let sent = self
            .client
            .post(format!("{}{CALL_PATH}", self.base))
            .header(CONTENT_TYPE, "application/json")
            .body(request)
            .send();
        let mut response = match sent {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Ok(KernelBridgeResult::timeout(elapsed_ms(started))),
            Err(err) if err.is_connect() => return Err(TransportError::Connect(err.to_string())),
            Err(err) => return Err(TransportError::Client(err.to_string())),
        };
        let status = response.status();
        let body = match read_response_limited(&mut response, MAX_FRAME_BYTES) {
            Ok(body) => body,
            Err(TransportError::TimedOut) => return Ok(KernelBridgeResult::timeout(elapsed_ms(started))),
            Err(err) => return Err(err),
        };
        if !status.is_success() {
            let preview = String::from_utf8_lossy(&body);
            let reason = if preview.trim().is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                format!("HTTP {}: {}", status.as_u16(), preview.trim())
            };
            return Ok(KernelBridgeResult::error(
                reason,
                Some(format!("http_{}", status.as_u16())),
                elapsed_ms(started),
            ));
        }
        interpret_response(&body, elapsed_ms(started))
    }
}

/// Reads the response body while enforcing a byte limit.
fn read_response_limited(response: &mut Response, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
    let max_bytes_u64 = u64::try_from(max_bytes).map_err(|_| TransportError::FrameTooLarge(max_bytes))?;
    if let Some(expected) = response.content_length()
        && expected > max_bytes_u64
    {
        return Err(TransportError::FrameTooLarge(usize::try_from(expected).unwrap_or(usize::MAX)));
    }
    let mut buf = Vec::new();
    response.take(max_bytes_u64.saturating_add(1)).read_to_end(&mut buf)?;
    if buf.len() > max_bytes {
        return Err(TransportError::FrameTooLarge(buf.len()));
    }
    Ok(buf)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Serializes the request envelope.
fn request_body(method: &str, params: &Value) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(&json!({
        "method": method,
        "params": params,
        "timestamp": unix_seconds(),
    }))
    .map_err(|err| TransportError::InvalidResponse(format!("request encoding failed: {err}")))
}

/// Maps a daemon response body onto a result.
fn interpret_response(body: &[u8], latency_ms: u64) -> Result<KernelBridgeResult, TransportError> {
    if body.is_empty() {
        return Err(TransportError::InvalidResponse("empty response".to_string()));
    }
    let payload: Value = serde_json::from_slice(body)
        .map_err(|err| TransportError::InvalidResponse(err.to_string()))?;
    let Some(error) = payload.get("error").filter(|error| is_truthy(error)) else {
        return Ok(KernelBridgeResult::success(payload, latency_ms));
    };
    let reason = match error {
        Value::String(message) => message.clone(),
        _ => error
            .get("message")
            .or_else(|| payload.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("kernel reported an error")
            .to_string(),
    };
    let code = error.get("code").or_else(|| payload.get("code")).and_then(code_string);
    Ok(KernelBridgeResult::error(reason, code, latency_ms))
}

/// Returns false for `null`, `false`, `0`, and empty strings, arrays, or
/// objects.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Renders an error code that may be a string or a number.
fn code_string(value: &Value) -> Option<String> {
    match value {
        Value::String(code) => Some(code.clone()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

/// Returns the current time as fractional unix seconds.
fn unix_seconds() -> f64 {
    (OffsetDateTime::now_utc() - OffsetDateTime::UNIX_EPOCH).as_seconds_f64()
}

/// Returns whole milliseconds since `started`.
pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::expect_used,
        clippy::unwrap_used,
        reason = "Test assertions use expect/unwrap for clarity."
    )]

    use std::io::Cursor;

    use super::*;
    use crate::result::KernelBridgeStatus;

    /// Tests frame encoding and the read-side size check.
    #[test]
    fn frames_carry_big_endian_length() {
        let frame = encode_frame(b"{}").expect("frame");
        assert_eq!(frame, vec![0, 0, 0, 2, b'{', b'}']);
        let body = read_frame(&mut Cursor::new(frame), MAX_FRAME_BYTES).expect("read");
        assert_eq!(body, b"{}");

        let oversized = (u32::try_from(MAX_FRAME_BYTES).expect("fits") + 1).to_be_bytes();
        assert!(matches!(
            read_frame(&mut Cursor::new(oversized.to_vec()), MAX_FRAME_BYTES),
            Err(TransportError::FrameTooLarge(_))
        ));
        assert!(matches!(read_frame(&mut Cursor::new(vec![0, 0, 0, 5, b'x']), 16), Err(TransportError::Io(_))));
    }

    /// Tests error extraction from daemon responses.
    #[test]
    fn truthy_error_members_become_error_results() {
        let result = interpret_response(br#"{"error":{"message":"denied","code":403}}"#, 2).expect("result");
        assert_eq!(result.status, KernelBridgeStatus::Error);
        assert_eq!(result.reason.as_deref(), Some("denied"));
        assert_eq!(result.error_code.as_deref(), Some("403"));

        let result = interpret_response(br#"{"error":"busy","code":"E_BUSY"}"#, 2).expect("result");
        assert_eq!(result.reason.as_deref(), Some("busy"));
        assert_eq!(result.error_code.as_deref(), Some("E_BUSY"));

        let result = interpret_response(br#"{"error":null,"ok":true}"#, 2).expect("result");
        assert!(result.success);
        assert!(interpret_response(b"", 2).is_err());
        assert!(interpret_response(b"not json", 2).is_err());
    }

    /// Tests the null transport echo.
    #[test]
    fn null_transport_echoes_request() {
        let result = Transport::Null.call("PING", &json!({"x": 1})).expect("call");
        let payload = result.payload.expect("payload");
        assert_eq!(payload["method"], json!("PING"));
        assert_eq!(payload["params"], json!({"x": 1}));
        assert_eq!(payload["mock"], json!(true));
    }
}
