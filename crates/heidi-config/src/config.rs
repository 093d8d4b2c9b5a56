// crates/heidi-config/src/config.rs
// ============================================================================
// Module: Heidi Configuration
// Description: heidi.toml loading, environment overrides, and validation.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: heidi-core, heidi-kernel-bridge, serde, serde_json, toml
// ============================================================================

//! ## Overview
//! Configuration is read from a TOML file, then overlaid with environment
//! variables, then validated as a whole. The config path resolves from an
//! explicit argument, then `HEIDI_CONFIG`, then `heidi.toml` in the working
//! directory; only the last may be absent, in which case defaults apply.
//!
//! Security posture: config inputs are untrusted. Secrets (keystore
//! passphrase, signing key) are never read from the file.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use heidi_core::RunnerConfig;
use heidi_core::runtime::runner::DEFAULT_PYTHON;
use heidi_core::runtime::runner::DEFAULT_ROUNDS;
use heidi_core::runtime::runner::DEFAULT_SAMPLES_PER_ROUND;
use heidi_kernel_bridge::KernelBridgeConfig;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
pub const DEFAULT_CONFIG_NAME: &str = "heidi.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "HEIDI_CONFIG";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Default home-relative root for run state and outputs.
const DEFAULT_HOME_DIR: &str = "~/.local/heidi-engine";
/// Default pause polling interval in milliseconds.
const DEFAULT_PAUSE_POLL_MS: u64 = 1_000;
/// Smallest accepted pause polling interval in milliseconds.
const MIN_PAUSE_POLL_MS: u64 = 10;

/// Environment variable overriding `paths.autotrain_dir`.
pub const ENV_AUTOTRAIN_DIR: &str = "AUTOTRAIN_DIR";
/// Environment variable overriding `runner.out_dir`.
pub const ENV_OUT_DIR: &str = "OUT_DIR";
/// Environment variable overriding `runner.rounds`.
pub const ENV_ROUNDS: &str = "ROUNDS";
/// Environment variable overriding `runner.samples_per_round`.
pub const ENV_SAMPLES_PER_ROUND: &str = "SAMPLES_PER_ROUND";
/// Environment variable overriding `runner.run_unit_tests`.
pub const ENV_RUN_UNIT_TESTS: &str = "RUN_UNIT_TESTS";
/// Environment variable overriding `runner.run_id`.
pub const ENV_RUN_ID: &str = "RUN_ID";
/// Environment variable overriding `guardrails.max_cpu_pct`.
pub const ENV_MAX_CPU_PCT: &str = "MAX_CPU_PCT";
/// Environment variable overriding `guardrails.max_mem_pct`.
pub const ENV_MAX_MEM_PCT: &str = "MAX_MEM_PCT";
/// Environment variable overriding `guardrails.max_wall_time_minutes`.
pub const ENV_MAX_WALL_TIME_MINUTES: &str = "MAX_WALL_TIME_MINUTES";
/// Environment variable overriding `security.keystore_path`.
pub const ENV_KEYSTORE_PATH: &str = "HEIDI_KEYSTORE_PATH";
/// Environment variable holding the keystore passphrase.
pub const ENV_KEYSTORE_PWD: &str = "HEIDI_KEYSTORE_PWD";
/// Environment variable holding the manifest signing key.
pub const ENV_SIGNING_KEY: &str = "HEIDI_SIGNING_KEY";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading or validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Types
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeidiConfig {
    /// Filesystem roots.
    pub paths: PathsConfig,
    /// Orchestrator settings.
    pub runner: RunnerSection,
    /// Kernel bridge settings.
    pub kernel: KernelBridgeConfig,
    /// Resource guardrails recorded in manifests and checked by the doctor.
    pub guardrails: GuardrailsConfig,
    /// Secret storage settings.
    pub security: SecurityConfig,
    /// File the config was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// `[paths]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Root holding `runs/{run_id}`.
    pub autotrain_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            autotrain_dir: PathBuf::from(DEFAULT_HOME_DIR),
        }
    }
}

/// `[runner]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSection {
    /// Root of stage data and model outputs.
    pub out_dir: PathBuf,
    /// Rounds before the pipeline completes.
    pub rounds: u32,
    /// Samples generated per round.
    pub samples_per_round: u32,
    /// Whether the unit-test gate runs.
    pub run_unit_tests: bool,
    /// Run to open; generated when absent.
    pub run_id: Option<String>,
    /// Interpreter for stage scripts.
    pub python: String,
    /// Stage script directory; `{out_dir}/scripts` when absent.
    pub scripts_dir: Option<PathBuf>,
    /// Sleep between pause checks in milliseconds.
    pub pause_poll_ms: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from(DEFAULT_HOME_DIR),
            rounds: DEFAULT_ROUNDS,
            samples_per_round: DEFAULT_SAMPLES_PER_ROUND,
            run_unit_tests: false,
            run_id: None,
            python: DEFAULT_PYTHON.to_string(),
            scripts_dir: None,
            pause_poll_ms: DEFAULT_PAUSE_POLL_MS,
        }
    }
}

/// `[guardrails]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailsConfig {
    /// CPU ceiling in percent.
    pub max_cpu_pct: Option<u32>,
    /// Memory ceiling in percent.
    pub max_mem_pct: Option<u32>,
    /// Wall-clock budget in minutes.
    pub max_wall_time_minutes: Option<u64>,
}

impl GuardrailsConfig {
    /// Returns the configured limits as an integer-only manifest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut snapshot = Map::new();
        if let Some(value) = self.max_cpu_pct {
            snapshot.insert("max_cpu_pct".to_string(), Value::from(value));
        }
        if let Some(value) = self.max_mem_pct {
            snapshot.insert("max_mem_pct".to_string(), Value::from(value));
        }
        if let Some(value) = self.max_wall_time_minutes {
            snapshot.insert("max_wall_time_minutes".to_string(), Value::from(value));
        }
        snapshot
    }

    /// Validates the limits.
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("max_cpu_pct", self.max_cpu_pct), ("max_mem_pct", self.max_mem_pct)] {
            if let Some(value) = value
                && !(1 ..= 100).contains(&value)
            {
                return Err(ConfigError::Invalid(format!("guardrails.{name} must be between 1 and 100")));
            }
        }
        if self.max_wall_time_minutes == Some(0) {
            return Err(ConfigError::Invalid("guardrails.max_wall_time_minutes must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// `[security]` section.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Encrypted keystore file.
    pub keystore_path: Option<PathBuf>,
}

// ============================================================================
// SECTION: Loading
// ============================================================================

impl HeidiConfig {
    /// Loads configuration using the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| env::var(name).ok())
    }

    /// Loads configuration, reading environment values through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an explicit config file is missing, the
    /// file is oversized or malformed, an override fails to parse, or
    /// validation fails.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (resolved, required) = resolve_path(path, &lookup)?;
        validate_path(&resolved)?;
        let mut config = if required || resolved.exists() {
            Self::read_file(&resolved)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(&lookup)?;
        config.expand_home(lookup("HOME").as_deref());
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML text without overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or unknown keys.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Reads and parses `path` with size and encoding limits.
    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        let mut config = Self::parse(content)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Applies environment overrides found through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value fails to parse.
    pub fn apply_env_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_AUTOTRAIN_DIR) {
            self.paths.autotrain_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_OUT_DIR) {
            self.runner.out_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_ROUNDS) {
            self.runner.rounds = parse_number(ENV_ROUNDS, &value)?;
        }
        if let Some(value) = lookup(ENV_SAMPLES_PER_ROUND) {
            self.runner.samples_per_round = parse_number(ENV_SAMPLES_PER_ROUND, &value)?;
        }
        if let Some(value) = lookup(ENV_RUN_UNIT_TESTS) {
            self.runner.run_unit_tests = parse_flag(ENV_RUN_UNIT_TESTS, &value)?;
        }
        if let Some(value) = lookup(ENV_RUN_ID) {
            let value = value.trim();
            self.runner.run_id = (!value.is_empty()).then(|| value.to_string());
        }
        if let Some(value) = lookup(ENV_MAX_CPU_PCT) {
            self.guardrails.max_cpu_pct = Some(parse_number(ENV_MAX_CPU_PCT, &value)?);
        }
        if let Some(value) = lookup(ENV_MAX_MEM_PCT) {
            self.guardrails.max_mem_pct = Some(parse_number(ENV_MAX_MEM_PCT, &value)?);
        }
        if let Some(value) = lookup(ENV_MAX_WALL_TIME_MINUTES) {
            self.guardrails.max_wall_time_minutes = Some(parse_number(ENV_MAX_WALL_TIME_MINUTES, &value)?);
        }
        if let Some(value) = lookup(ENV_KEYSTORE_PATH) {
            self.security.keystore_path = (!value.trim().is_empty()).then(|| PathBuf::from(value));
        }
        self.kernel.apply_overrides(lookup).map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Expands leading `~` in every configured path against `home`.
    pub fn expand_home(&mut self, home: Option<&str>) {
        self.paths.autotrain_dir = expand_tilde(&self.paths.autotrain_dir, home);
        self.runner.out_dir = expand_tilde(&self.runner.out_dir, home);
        if let Some(dir) = &self.runner.scripts_dir {
            self.runner.scripts_dir = Some(expand_tilde(dir, home));
        }
        if let Some(path) = &self.security.keystore_path {
            self.security.keystore_path = Some(expand_tilde(path, home));
        }
        self.kernel.expand_endpoint_home(home);
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.autotrain_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.autotrain_dir must be set".to_string()));
        }
        if self.runner.out_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("runner.out_dir must be set".to_string()));
        }
        if self.runner.pause_poll_ms < MIN_PAUSE_POLL_MS {
            return Err(ConfigError::Invalid(format!(
                "runner.pause_poll_ms must be at least {MIN_PAUSE_POLL_MS}"
            )));
        }
        self.runner_config()
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        self.kernel.validate().map_err(|err| ConfigError::Invalid(err.to_string()))?;
        self.guardrails.validate()?;
        if let Some(path) = &self.security.keystore_path {
            validate_path(path)?;
        }
        Ok(())
    }

    /// Builds the orchestrator settings.
    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        let mut runner = RunnerConfig::new(self.paths.autotrain_dir.clone(), self.runner.out_dir.clone());
        runner.rounds = self.runner.rounds;
        runner.samples_per_round = self.runner.samples_per_round;
        runner.run_unit_tests = self.runner.run_unit_tests;
        runner.run_id.clone_from(&self.runner.run_id);
        runner.python.clone_from(&self.runner.python);
        if let Some(dir) = &self.runner.scripts_dir {
            runner.scripts_dir.clone_from(dir);
        }
        runner.pause_poll = Duration::from_millis(self.runner.pause_poll_ms);
        runner
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path; the flag is true when the file must exist.
fn resolve_path<F>(path: Option<&Path>, lookup: &F) -> Result<(PathBuf, bool), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = path {
        return Ok((path.to_path_buf(), true));
    }
    if let Some(env_path) = lookup(CONFIG_ENV_VAR).filter(|value| !value.trim().is_empty()) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok((PathBuf::from(env_path), true));
    }
    Ok((PathBuf::from(DEFAULT_CONFIG_NAME), false))
}

/// Validates a path against length limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.is_empty() {
        return Err(ConfigError::Invalid("path must not be empty".to_string()));
    }
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("path component too long".to_string()));
        }
    }
    Ok(())
}

/// Replaces a leading `~` component with `home`.
fn expand_tilde(path: &Path, home: Option<&str>) -> PathBuf {
    let Some(home) = home else {
        return path.to_path_buf();
    };
    match path.strip_prefix("~") {
        Ok(rest) => Path::new(home).join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Parses a boolean flag (`1/true/yes/on`, `0/false/no/off`).
fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("invalid value for {name}: {value}"))),
    }
}

/// Parses a numeric environment value.
fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid value for {name}: {value}")))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests tilde expansion of config paths.
    #[test]
    fn tilde_expands_only_as_leading_component() {
        assert_eq!(expand_tilde(Path::new("~/.local/x"), Some("/home/a")), PathBuf::from("/home/a/.local/x"));
        assert_eq!(expand_tilde(Path::new("~"), Some("/home/a")), PathBuf::from("/home/a"));
        assert_eq!(expand_tilde(Path::new("/srv/~x"), Some("/home/a")), PathBuf::from("/srv/~x"));
        assert_eq!(expand_tilde(Path::new("~/x"), None), PathBuf::from("~/x"));
    }
}
