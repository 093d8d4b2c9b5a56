// crates/heidi-config/tests/config.rs
// ============================================================================
// Module: Config Loading Tests
// Description: File resolution, limits, environment overrides, validation.
// Purpose: Ensure configuration fails closed on every malformed input.
// Dependencies: heidi-config, tempfile
// ============================================================================
//! ## Overview
//! Loads `heidi.toml` variants from temp dirs through an in-memory
//! environment and checks the resulting model and every refusal.

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

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use heidi_config::ConfigError;
use heidi_config::HeidiConfig;
use heidi_config::MAX_CONFIG_FILE_SIZE;
use serde_json::json;
use tempfile::tempdir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Full configuration exercising every section.
const FULL_TOML: &str = r#"
[paths]
autotrain_dir = "~/engine"

[runner]
out_dir = "/srv/heidi/out"
rounds = 2
samples_per_round = 10
run_unit_tests = true
run_id = "run_cfg"
python = "/usr/bin/python3"
scripts_dir = "/srv/heidi/scripts"
pause_poll_ms = 250

[kernel]
enabled = true
endpoint = "unix:///run/heidi/kernel.sock"
max_inflight = 4

[guardrails]
max_cpu_pct = 85
max_mem_pct = 70
max_wall_time_minutes = 120

[security]
keystore_path = "~/keys/gate.enc"
"#;

/// Loads `path` with `pairs` plus `HOME=/home/tester` as the environment.
fn load(path: Option<&Path>, pairs: &[(&str, &str)]) -> Result<HeidiConfig, ConfigError> {
    let mut env: HashMap<String, String> =
        pairs.iter().map(|(key, value)| ((*key).to_string(), (*value).to_string())).collect();
    env.entry("HOME".to_string()).or_insert_with(|| "/home/tester".to_string());
    HeidiConfig::load_with(path, |name| env.get(name).cloned())
}

/// Writes `content` to `heidi.toml` in `dir`.
fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("heidi.toml");
    fs::write(&path, content).expect("write config");
    path
}

// ============================================================================
// SECTION: Tests
// ============================================================================

/// Tests defaults when no config file exists.
#[test]
fn absent_default_file_yields_defaults() {
    let config = load(None, &[]).expect("defaults");
    assert!(config.source.is_none());
    assert_eq!(config.paths.autotrain_dir, PathBuf::from("/home/tester/.local/heidi-engine"));
    assert_eq!(config.runner.out_dir, PathBuf::from("/home/tester/.local/heidi-engine"));
    assert_eq!(config.runner.rounds, 3);
    assert_eq!(config.runner.samples_per_round, 50);
    assert!(!config.runner.run_unit_tests);
    assert!(!config.kernel.enabled);
    assert!(config.guardrails.snapshot().is_empty());
}

/// Tests that every section is read and paths are expanded.
#[test]
fn full_file_populates_every_section() {
    let dir = tempdir().expect("temp dir");
    let path = write_config(dir.path(), FULL_TOML);
    let config = load(Some(&path), &[]).expect("config");
    assert_eq!(config.source.as_deref(), Some(path.as_path()));
    assert_eq!(config.paths.autotrain_dir, PathBuf::from("/home/tester/engine"));
    assert_eq!(config.security.keystore_path, Some(PathBuf::from("/home/tester/keys/gate.enc")));
    assert!(config.kernel.enabled);
    assert_eq!(config.kernel.max_inflight, 4);
    assert_eq!(config.kernel.timeout_ms, 5_000);

    let runner = config.runner_config();
    assert_eq!(runner.autotrain_dir, PathBuf::from("/home/tester/engine"));
    assert_eq!(runner.out_dir, PathBuf::from("/srv/heidi/out"));
    assert_eq!(runner.scripts_dir, PathBuf::from("/srv/heidi/scripts"));
    assert_eq!(runner.rounds, 2);
    assert_eq!(runner.samples_per_round, 10);
    assert!(runner.run_unit_tests);
    assert_eq!(runner.run_id.as_deref(), Some("run_cfg"));
    assert_eq!(runner.python, "/usr/bin/python3");
    assert_eq!(runner.pause_poll, Duration::from_millis(250));

    let snapshot = config.guardrails.snapshot();
    assert_eq!(
        serde_json::Value::Object(snapshot),
        json!({"max_cpu_pct": 85, "max_mem_pct": 70, "max_wall_time_minutes": 120})
    );
}

/// Tests that the scripts dir defaults under the output dir.
#[test]
fn scripts_dir_defaults_under_out_dir() {
    let config = load(None, &[("OUT_DIR", "/data/out")]).expect("config");
    assert_eq!(config.runner_config().scripts_dir, PathBuf::from("/data/out/scripts"));
}

/// Tests path resolution through `HEIDI_CONFIG`.
#[test]
fn config_env_var_selects_file() {
    let dir = tempdir().expect("temp dir");
    let path = write_config(dir.path(), "[runner]\nrounds = 9\n");
    let config = load(None, &[("HEIDI_CONFIG", path.to_str().expect("utf8"))]).expect("config");
    assert_eq!(config.runner.rounds, 9);

    let missing = dir.path().join("missing.toml");
    let result = load(None, &[("HEIDI_CONFIG", missing.to_str().expect("utf8"))]);
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

/// Tests that an explicit missing file is an error.
#[test]
fn explicit_missing_file_is_io_error() {
    let dir = tempdir().expect("temp dir");
    assert!(matches!(load(Some(&dir.path().join("nope.toml")), &[]), Err(ConfigError::Io(_))));
}

/// Tests that unknown keys and sections are refused.
#[test]
fn unknown_keys_are_refused() {
    let dir = tempdir().expect("temp dir");
    for content in ["[runner]\nroundz = 2\n", "[telemetry]\nenabled = true\n", "[kernel]\nsocket = \"x\"\n"] {
        let path = write_config(dir.path(), content);
        assert!(matches!(load(Some(&path), &[]), Err(ConfigError::Parse(_))), "{content}");
    }
}

/// Tests the size and encoding limits.
#[test]
fn oversized_or_non_utf8_files_are_refused() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("heidi.toml");
    let mut big = String::from("# padding\n");
    big.push_str(&"#".repeat(MAX_CONFIG_FILE_SIZE));
    fs::write(&path, big).expect("write");
    assert!(matches!(load(Some(&path), &[]), Err(ConfigError::Invalid(_))));

    fs::write(&path, [0xff, 0xfe, 0x00]).expect("write");
    assert!(matches!(load(Some(&path), &[]), Err(ConfigError::Invalid(_))));
}

/// Tests that environment values override the file.
#[test]
fn environment_overrides_file_values() {
    let dir = tempdir().expect("temp dir");
    let path = write_config(dir.path(), FULL_TOML);
    let config = load(
        Some(&path),
        &[
            ("AUTOTRAIN_DIR", "/var/heidi"),
            ("ROUNDS", "7"),
            ("SAMPLES_PER_ROUND", "3"),
            ("RUN_UNIT_TESTS", "0"),
            ("RUN_ID", "run_env"),
            ("MAX_CPU_PCT", "50"),
            ("HEIDI_KEYSTORE_PATH", "/etc/heidi/keys.json"),
            ("HEIDI_KERNEL_ENABLED", "false"),
            ("HEIDI_KERNEL_TIMEOUT_MS", "900"),
        ],
    )
    .expect("config");
    assert_eq!(config.paths.autotrain_dir, PathBuf::from("/var/heidi"));
    assert_eq!(config.runner.rounds, 7);
    assert_eq!(config.runner.samples_per_round, 3);
    assert!(!config.runner.run_unit_tests);
    assert_eq!(config.runner.run_id.as_deref(), Some("run_env"));
    assert_eq!(config.guardrails.max_cpu_pct, Some(50));
    assert_eq!(config.guardrails.max_mem_pct, Some(70));
    assert_eq!(config.security.keystore_path, Some(PathBuf::from("/etc/heidi/keys.json")));
    assert!(!config.kernel.enabled);
    assert_eq!(config.kernel.timeout_ms, 900);
}

/// Tests flag spellings for the unit-test gate.
#[test]
fn run_unit_tests_accepts_flag_spellings() {
    for (value, expected) in [("1", true), ("TRUE", true), ("yes", true), ("on", true), ("0", false), ("off", false)] {
        let config = load(None, &[("RUN_UNIT_TESTS", value)]).expect(value);
        assert_eq!(config.runner.run_unit_tests, expected, "{value}");
    }
    assert!(matches!(load(None, &[("RUN_UNIT_TESTS", "sometimes")]), Err(ConfigError::Invalid(_))));
}

/// Tests that bad values are refused after overrides.
#[test]
fn invalid_values_are_refused() {
    for pairs in [
        [("ROUNDS", "0")],
        [("ROUNDS", "many")],
        [("SAMPLES_PER_ROUND", "0")],
        [("MAX_CPU_PCT", "150")],
        [("MAX_MEM_PCT", "0")],
        [("MAX_WALL_TIME_MINUTES", "0")],
        [("RUN_ID", "../escape")],
        [("HEIDI_KERNEL_ENDPOINT", "http://example.com")],
        [("HEIDI_KERNEL_MAX_INFLIGHT", "0")],
    ] {
        assert!(matches!(load(None, &pairs), Err(ConfigError::Invalid(_))), "{pairs:?}");
    }
    let dir = tempdir().expect("temp dir");
    let path = write_config(dir.path(), "[runner]\npause_poll_ms = 1\n");
    assert!(matches!(load(Some(&path), &[]), Err(ConfigError::Invalid(_))));
}

/// Tests that an empty `RUN_ID` means "generate one".
#[test]
fn empty_run_id_is_cleared() {
    let config = load(None, &[("RUN_ID", "  ")]).expect("config");
    assert!(config.runner.run_id.is_none());
}
