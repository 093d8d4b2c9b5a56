// crates/heidi-config/src/doctor.rs
// ============================================================================
// Module: Doctor Checks
// Description: Pre-flight posture checks over a loaded configuration.
// Purpose: Refuse production runs until guardrails and secrets are in place.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! [`run_checks`] evaluates a fixed list of posture checks. The report is
//! pure data; the CLI decides whether a failure is fatal (`--strict`).

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;

use crate::config::HeidiConfig;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Extension an encrypted keystore file must carry.
pub const ENCRYPTED_KEYSTORE_EXTENSION: &str = "enc";

/// Identifier of a doctor check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctorCheckId {
    /// CPU and memory ceilings are set.
    GuardrailsConfigured,
    /// A wall-clock budget is set.
    BudgetThresholdsSet,
    /// The keystore path names an encrypted file.
    KeystoreEncrypted,
    /// A manifest signing key is present.
    SignatureKeyPresent,
}

impl DoctorCheckId {
    /// Returns the stable snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GuardrailsConfigured => "guardrails_configured",
            Self::BudgetThresholdsSet => "budget_thresholds_set",
            Self::KeystoreEncrypted => "keystore_encrypted",
            Self::SignatureKeyPresent => "signature_key_present",
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DoctorCheck {
    /// Check identifier.
    pub id: DoctorCheckId,
    /// Whether the check passed.
    pub passed: bool,
}

/// Outcome of every check, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoctorReport {
    /// Individual outcomes.
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    /// Returns true when every check passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    /// Returns the failed checks.
    pub fn failures(&self) -> impl Iterator<Item = DoctorCheckId> + '_ {
        self.checks.iter().filter(|check| !check.passed).map(|check| check.id)
    }
}

// ============================================================================
// SECTION: Checks
// ============================================================================

/// Evaluates every posture check against `config`.
#[must_use]
pub fn run_checks(config: &HeidiConfig, signing_key_present: bool) -> DoctorReport {
    let guardrails = &config.guardrails;
    let keystore_encrypted = config
        .security
        .keystore_path
        .as_ref()
        .and_then(|path| path.extension())
        .is_some_and(|extension| extension == ENCRYPTED_KEYSTORE_EXTENSION);
    let checks = vec![
        DoctorCheck {
            id: DoctorCheckId::GuardrailsConfigured,
            passed: guardrails.max_cpu_pct.is_some() && guardrails.max_mem_pct.is_some(),
        },
        DoctorCheck {
            id: DoctorCheckId::BudgetThresholdsSet,
            passed: guardrails.max_wall_time_minutes.is_some(),
        },
        DoctorCheck {
            id: DoctorCheckId::KeystoreEncrypted,
            passed: keystore_encrypted,
        },
        DoctorCheck {
            id: DoctorCheckId::SignatureKeyPresent,
            passed: signing_key_present,
        },
    ];
    DoctorReport {
        checks,
    }
}
