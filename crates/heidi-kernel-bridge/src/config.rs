// crates/heidi-kernel-bridge/src/config.rs
// ============================================================================
// Module: Kernel Bridge Configuration
// Description: Feature flags, endpoint, and limits for the kernel bridge.
// Purpose: Validate every bridge setting eagerly, before the first call.
// Dependencies: serde, thiserror, url
// ============================================================================

//! ## Overview
//! A [`KernelBridgeConfig`] selects between the in-process null transport and
//! a real daemon endpoint, and bounds timeouts, concurrency, and retries.
//!
//! Security posture: HTTP endpoints must target the local host. A `unix://`
//! endpoint must name an absolute socket path; `~` is expanded against
//! `HOME` before that check.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Scheme prefix of unix-socket endpoints.
pub const UNIX_SCHEME: &str = "unix://";
/// Socket path under `HOME` used when no endpoint is configured.
const DEFAULT_SOCKET_SUFFIX: &str = ".local/heidi-engine/run/kernel.sock";
/// Hosts an HTTP endpoint may target.
const LOCAL_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Default per-call timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Default bound on concurrent calls.
pub const DEFAULT_MAX_INFLIGHT: usize = 3;
/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;
/// Default base delay between retries in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Accepted `timeout_ms` range.
const TIMEOUT_RANGE: (u64, u64) = (100, 30_000);
/// Accepted `max_inflight` range.
const INFLIGHT_RANGE: (usize, usize) = (1, 10);
/// Maximum `retry_attempts`.
const MAX_RETRY_ATTEMPTS: u32 = 5;
/// Accepted `retry_delay_ms` range.
const RETRY_DELAY_RANGE: (u64, u64) = (10, 1_000);

/// Environment variable enabling the bridge.
pub const ENV_ENABLED: &str = "HEIDI_KERNEL_ENABLED";
/// Environment variable marking the bridge as required.
pub const ENV_REQUIRED: &str = "HEIDI_KERNEL_REQUIRED";
/// Environment variable holding the endpoint.
pub const ENV_ENDPOINT: &str = "HEIDI_KERNEL_ENDPOINT";
/// Environment variable holding the timeout.
pub const ENV_TIMEOUT_MS: &str = "HEIDI_KERNEL_TIMEOUT_MS";
/// Environment variable holding the concurrency bound.
pub const ENV_MAX_INFLIGHT: &str = "HEIDI_KERNEL_MAX_INFLIGHT";
/// Environment variable holding the retry count.
pub const ENV_RETRY_ATTEMPTS: &str = "HEIDI_KERNEL_RETRY_ATTEMPTS";
/// Environment variable holding the retry delay.
pub const ENV_RETRY_DELAY_MS: &str = "HEIDI_KERNEL_RETRY_DELAY_MS";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Kernel bridge configuration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelBridgeConfigError {
    /// A setting is out of range or malformed.
    #[error("invalid kernel bridge config: {0}")]
    Invalid(String),
    /// An environment value could not be parsed.
    #[error("invalid value for {name}: {value}")]
    Env {
        /// Variable name.
        name: String,
        /// Raw value.
        value: String,
    },
}

// ============================================================================
// SECTION: Types
// ============================================================================

/// Endpoint family selected by the endpoint scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint<'a> {
    /// Absolute unix-socket path.
    Unix(&'a Path),
    /// Local HTTP(S) base URL.
    Http(&'a str),
}

/// Kernel bridge settings.
///
/// # Invariants
/// - After [`KernelBridgeConfig::validate`], every limit is in range and the
///   endpoint is `unix://<absolute path>` or `http(s)://localhost|127.0.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelBridgeConfig {
    /// Use the daemon; when false every call is answered locally.
    pub enabled: bool,
    /// Treat an unreachable daemon as fatal.
    pub required: bool,
    /// Daemon endpoint.
    pub endpoint: String,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum concurrent calls.
    pub max_inflight: usize,
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Base retry delay in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for KernelBridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            endpoint: default_endpoint(env::var("HOME").ok().as_deref()),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl KernelBridgeConfig {
    /// Creates an enabled config for `endpoint` with default limits.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeConfigError::Invalid`] when the endpoint is
    /// rejected.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, KernelBridgeConfigError> {
        let config = Self {
            enabled: true,
            endpoint: endpoint.into(),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeConfigError`] when a value fails to parse or
    /// validate.
    pub fn from_env() -> Result<Self, KernelBridgeConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads settings through `lookup`, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeConfigError`] when a value fails to parse or
    /// validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, KernelBridgeConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("HOME");
        let mut config = Self {
            endpoint: default_endpoint(home.as_deref()),
            ..Self::default()
        };
        config.apply_overrides(&lookup)?;
        config.expand_endpoint_home(home.as_deref());
        config.validate()?;
        Ok(config)
    }

    /// Expands a leading `~` in a `unix://` endpoint against `home`.
    pub fn expand_endpoint_home(&mut self, home: Option<&str>) {
        self.endpoint = expand_home(&self.endpoint, home);
    }

    /// Applies `HEIDI_KERNEL_*` overrides found through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeConfigError::Env`] when a value fails to parse.
    pub fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), KernelBridgeConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ENABLED) {
            self.enabled = parse_flag(ENV_ENABLED, &value)?;
        }
        if let Some(value) = lookup(ENV_REQUIRED) {
            self.required = parse_flag(ENV_REQUIRED, &value)?;
        }
        if let Some(value) = lookup(ENV_ENDPOINT) {
            self.endpoint = value.trim().to_string();
        }
        if let Some(value) = lookup(ENV_TIMEOUT_MS) {
            self.timeout_ms = parse_number(ENV_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_INFLIGHT) {
            self.max_inflight = parse_number(ENV_MAX_INFLIGHT, &value)?;
        }
        if let Some(value) = lookup(ENV_RETRY_ATTEMPTS) {
            self.retry_attempts = parse_number(ENV_RETRY_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_RETRY_DELAY_MS) {
            self.retry_delay_ms = parse_number(ENV_RETRY_DELAY_MS, &value)?;
        }
        Ok(())
    }

    /// Validates limits and the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeConfigError::Invalid`] naming the first bad
    /// setting.
    pub fn validate(&self) -> Result<(), KernelBridgeConfigError> {
        check_range("timeout_ms", self.timeout_ms, TIMEOUT_RANGE)?;
        check_range("max_inflight", self.max_inflight, INFLIGHT_RANGE)?;
        check_range("retry_attempts", self.retry_attempts, (0, MAX_RETRY_ATTEMPTS))?;
        check_range("retry_delay_ms", self.retry_delay_ms, RETRY_DELAY_RANGE)?;
        self.parsed_endpoint().map(|_| ())
    }

    /// Classifies the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`KernelBridgeConfigError::Invalid`] for relative socket
    /// paths, non-local HTTP hosts, embedded credentials, or unknown schemes.
    pub fn parsed_endpoint(&self) -> Result<Endpoint<'_>, KernelBridgeConfigError> {
        let endpoint = self.endpoint.as_str();
        if let Some(path) = endpoint.strip_prefix(UNIX_SCHEME) {
            let path = Path::new(path);
            if !path.is_absolute() {
                return Err(KernelBridgeConfigError::Invalid(
                    "unix socket path must be absolute".to_string(),
                ));
            }
            return Ok(Endpoint::Unix(path));
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            let url = Url::parse(endpoint)
                .map_err(|err| KernelBridgeConfigError::Invalid(format!("endpoint: {err}")))?;
            if !url.username().is_empty() || url.password().is_some() {
                return Err(KernelBridgeConfigError::Invalid(
                    "endpoint credentials are not allowed".to_string(),
                ));
            }
            let host = url.host_str().unwrap_or_default();
            if !LOCAL_HOSTS.contains(&host) {
                return Err(KernelBridgeConfigError::Invalid(
                    "http endpoint must be localhost or 127.0.0.1".to_string(),
                ));
            }
            return Ok(Endpoint::Http(endpoint.trim_end_matches('/')));
        }
        Err(KernelBridgeConfigError::Invalid("endpoint must be unix:// or http(s)://".to_string()))
    }

    /// Returns the per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the sleep before retry `attempt` (0-based): linear backoff.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt) + 1))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Builds the default socket endpoint under `home`.
fn default_endpoint(home: Option<&str>) -> String {
    expand_home(&format!("{UNIX_SCHEME}~/{DEFAULT_SOCKET_SUFFIX}"), home)
}

/// Expands a leading `~` in a `unix://` endpoint against `home`.
fn expand_home(endpoint: &str, home: Option<&str>) -> String {
    let Some(home) = home else {
        return endpoint.to_string();
    };
    let Some(path) = endpoint.strip_prefix(UNIX_SCHEME) else {
        return endpoint.to_string();
    };
    if path == "~" {
        return format!("{UNIX_SCHEME}{home}");
    }
    path.strip_prefix("~/").map_or_else(
        || endpoint.to_string(),
        |rest| format!("{UNIX_SCHEME}{}/{rest}", home.trim_end_matches('/')),
    )
}

/// Parses a boolean flag (`1/true/yes/on`, `0/false/no/off`).
fn parse_flag(name: &str, value: &str) -> Result<bool, KernelBridgeConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(KernelBridgeConfigError::Env {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Parses a numeric environment value.
fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, KernelBridgeConfigError> {
    value.trim().parse().map_err(|_| KernelBridgeConfigError::Env {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Checks that `value` lies within the inclusive `range`.
fn check_range<T>(field: &str, value: T, range: (T, T)) -> Result<(), KernelBridgeConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    let (min, max) = range;
    if value < min || value > max {
        return Err(KernelBridgeConfigError::Invalid(format!(
            "{field} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that home expansion only touches leading tildes.
    #[test]
    fn expand_home_rewrites_leading_tilde() {
        assert_eq!(expand_home("unix://~/run/k.sock", Some("/home/a/")), "unix:///home/a/run/k.sock");
        assert_eq!(expand_home("unix:///abs/~/k.sock", Some("/home/a")), "unix:///abs/~/k.sock");
        assert_eq!(expand_home("http://localhost", Some("/home/a")), "http://localhost");
        assert_eq!(expand_home("unix://~/k.sock", None), "unix://~/k.sock");
    }

    /// Tests the retry backoff schedule.
    #[test]
    fn retry_delay_is_linear() {
        let config = KernelBridgeConfig {
            retry_delay_ms: 50,
            ..KernelBridgeConfig::default()
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(50));
        assert_eq!(config.retry_delay(2), Duration::from_millis(150));
    }
}
