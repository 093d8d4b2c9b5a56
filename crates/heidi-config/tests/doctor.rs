// crates/heidi-config/tests/doctor.rs
// ============================================================================
// Module: Doctor Tests
// Description: Posture checks over configured guardrails and secrets.
// Purpose: Ensure each check passes and fails on exactly its own input.
// Dependencies: heidi-config
// ============================================================================
//! ## Overview
//! Builds configurations in memory and evaluates [`run_checks`].

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

use std::path::PathBuf;

use heidi_config::DoctorCheckId;
use heidi_config::GuardrailsConfig;
use heidi_config::HeidiConfig;
use heidi_config::run_checks;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Builds a config that passes every check.
fn healthy() -> HeidiConfig {
    let mut config = HeidiConfig::default();
    config.guardrails = GuardrailsConfig {
        max_cpu_pct: Some(80),
        max_mem_pct: Some(75),
        max_wall_time_minutes: Some(60),
    };
    config.security.keystore_path = Some(PathBuf::from("/etc/heidi/gate.enc"));
    config
}

// ============================================================================
// SECTION: Tests
// ============================================================================

/// Tests a fully configured system.
#[test]
fn healthy_config_passes_every_check() {
    let report = run_checks(&healthy(), true);
    assert!(report.passed());
    assert_eq!(report.checks.len(), 4);
    assert_eq!(report.failures().count(), 0);
    let ids: Vec<&str> = report.checks.iter().map(|check| check.id.as_str()).collect();
    assert_eq!(
        ids,
        ["guardrails_configured", "budget_thresholds_set", "keystore_encrypted", "signature_key_present"]
    );
}

/// Tests that each missing input fails only its own check.
#[test]
fn each_check_fails_independently() {
    let mut config = healthy();
    config.guardrails.max_mem_pct = None;
    assert_eq!(run_checks(&config, true).failures().collect::<Vec<_>>(), [DoctorCheckId::GuardrailsConfigured]);

    let mut config = healthy();
    config.guardrails.max_wall_time_minutes = None;
    assert_eq!(run_checks(&config, true).failures().collect::<Vec<_>>(), [DoctorCheckId::BudgetThresholdsSet]);

    let mut config = healthy();
    config.security.keystore_path = Some(PathBuf::from("/etc/heidi/gate.json"));
    assert_eq!(run_checks(&config, true).failures().collect::<Vec<_>>(), [DoctorCheckId::KeystoreEncrypted]);

    let report = run_checks(&healthy(), false);
    assert!(!report.passed());
    assert_eq!(report.failures().collect::<Vec<_>>(), [DoctorCheckId::SignatureKeyPresent]);
}

/// Tests the default configuration.
#[test]
fn default_config_fails_everything_but_what_is_given() {
    let report = run_checks(&HeidiConfig::default(), false);
    assert_eq!(report.failures().count(), 4);
    assert_eq!(run_checks(&HeidiConfig::default(), true).failures().count(), 3);
}

/// Tests the JSON form of a report.
#[test]
fn report_serializes_snake_case_ids() {
    let value = serde_json::to_value(run_checks(&healthy(), true)).expect("json");
    assert_eq!(value["checks"][0]["id"], "guardrails_configured");
    assert_eq!(value["checks"][0]["passed"], true);
}
