// crates/heidi-core/src/runtime/finalizer.rs
// ============================================================================
// Module: Heidi Finalizer
// Description: Signs a pending dataset and freezes it under `verified/`.
// Purpose: Produce the one-way, permission-locked artifact of a finished run.
// Dependencies: crate::core::{hashing, signature, identifiers}, serde_json
// ============================================================================

//! ## Overview
//! `finalize` hashes `pending/dataset.jsonl` in one streaming pass, builds the
//! 12-key manifest, canonicalizes and HMAC-signs it, and only then touches
//! `verified/{run_id}/`. Moving the dataset is the last mutating step, so a
//! failure before it leaves the pending dataset in place and removes the
//! half-built verified directory.
//!
//! Once frozen (files 0444, directory 0555) a verified directory is never
//! written again; finalizing the same run twice is refused. The signing key
//! is never logged or written.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::core::hashing::SHA256_PREFIX;
use crate::core::hashing::Sha256Stream;
use crate::core::identifiers::now_rfc3339;
use crate::core::identifiers::validate_run_id;
use crate::core::signature::canonicalize_manifest;
use crate::core::signature::hmac_sha256_hex;
use crate::core::signature::verify_hmac_sha256;
use crate::runtime::replay::ReplayReport;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Pending dataset file name.
pub const DATASET_FILE: &str = "dataset.jsonl";
/// Canonical manifest file name.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Hex signature file name.
pub const SIGNATURE_FILE: &str = "signature.sig";

/// Engine version stamped into manifests.
pub const ENGINE_VERSION: &str = "0.5.0-hardened";
/// Manifest schema version.
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";
/// Identifier of the signing key.
pub const SIGNING_KEY_ID: &str = "root-p6-key";
/// Final state recorded for a finalized run.
pub const FINAL_STATE_VERIFIED: &str = "VERIFIED";
/// Replay hash used when no replay report is attached.
pub const REPLAY_HASH_PENDING: &str = "sha256:pending";

/// Mode of frozen files.
#[cfg(unix)]
const FROZEN_FILE_MODE: u32 = 0o444;
/// Mode of the frozen directory.
#[cfg(unix)]
const FROZEN_DIR_MODE: u32 = 0o555;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Finalizer failures.
#[derive(Debug, Error)]
pub enum FinalizerError {
    /// The signing key is empty.
    #[error("finalizer signing key is empty")]
    MissingKey,
    /// The run id is not a safe path component.
    #[error("invalid run id: {0}")]
    InvalidRunId(String),
    /// A configured directory escapes its containment root.
    #[error("path escapes containment root: {0}")]
    Containment(String),
    /// `pending/dataset.jsonl` does not exist.
    #[error("missing dataset at {0}")]
    MissingDataset(String),
    /// `verified/{run_id}` already exists.
    #[error("run already finalized at {0}")]
    AlreadyFinalized(String),
    /// Manifest construction or canonicalization failed.
    #[error("manifest error: {0}")]
    Manifest(String),
    /// A finalized directory failed verification.
    #[error("verification failed: {0}")]
    Verification(String),
    /// Filesystem failure.
    #[error("finalizer io error: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: Report
// ============================================================================

/// Paths and digests of a finalized run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    /// `verified/{run_id}` directory.
    pub verified_dir: PathBuf,
    /// Written manifest.
    pub manifest_path: PathBuf,
    /// Written signature.
    pub signature_path: PathBuf,
    /// `sha256:<hex>` of the dataset.
    pub dataset_hash: String,
    /// Number of dataset records.
    pub record_count: u64,
}

// ============================================================================
// SECTION: Finalizer
// ============================================================================

/// Signs and freezes pending datasets.
///
/// # Invariants
/// - `signing_key` is non-empty.
/// - `guardrail_snapshot` holds only integers, strings, and booleans.
pub struct Finalizer {
    /// Directory holding `dataset.jsonl`.
    pending_dir: PathBuf,
    /// Root of verified run directories.
    verified_dir: PathBuf,
    /// HMAC key bytes.
    signing_key: Vec<u8>,
    /// Guardrail limits recorded in the manifest.
    guardrail_snapshot: Map<String, Value>,
    /// Replay hash recorded in the manifest.
    replay_hash: String,
    /// Journal event count recorded in the manifest.
    event_count: u64,
    /// Wall-clock runtime recorded in the manifest.
    total_runtime_sec: u64,
}

impl Finalizer {
    /// Creates a finalizer over `pending_dir` and `verified_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::MissingKey`] for an empty key and
    /// [`FinalizerError::Io`] when a path cannot be resolved.
    pub fn new(
        pending_dir: &Path,
        verified_dir: &Path,
        signing_key: impl Into<Vec<u8>>,
    ) -> Result<Self, FinalizerError> {
        let signing_key = signing_key.into();
        if signing_key.is_empty() {
            return Err(FinalizerError::MissingKey);
        }
        Ok(Self {
            pending_dir: resolve_lenient(pending_dir)?,
            verified_dir: resolve_lenient(verified_dir)?,
            signing_key,
            guardrail_snapshot: Map::new(),
            replay_hash: REPLAY_HASH_PENDING.to_string(),
            event_count: 0,
            total_runtime_sec: 0,
        })
    }

    /// Creates a finalizer whose directories must resolve inside `base`.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Containment`] when either directory escapes
    /// `base`, plus the errors of [`Finalizer::new`].
    pub fn contained(
        base: &Path,
        pending_dir: &Path,
        verified_dir: &Path,
        signing_key: impl Into<Vec<u8>>,
    ) -> Result<Self, FinalizerError> {
        let root = base.canonicalize().map_err(|err| FinalizerError::Io(err.to_string()))?;
        let finalizer = Self::new(pending_dir, verified_dir, signing_key)?;
        for dir in [&finalizer.pending_dir, &finalizer.verified_dir] {
            if !dir.starts_with(&root) {
                return Err(FinalizerError::Containment(dir.display().to_string()));
            }
        }
        Ok(finalizer)
    }

    /// Records guardrail limits in the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Manifest`] when a value is not an integer,
    /// string, or boolean.
    pub fn with_guardrail_snapshot(
        mut self,
        snapshot: Map<String, Value>,
    ) -> Result<Self, FinalizerError> {
        for (name, value) in &snapshot {
            let allowed = match value {
                Value::Number(number) => number.is_i64() || number.is_u64(),
                Value::String(_) | Value::Bool(_) => true,
                _ => false,
            };
            if !allowed {
                return Err(FinalizerError::Manifest(format!(
                    "guardrail_snapshot.{name} must be an integer, string, or boolean"
                )));
            }
        }
        self.guardrail_snapshot = snapshot;
        Ok(self)
    }

    /// Records the journal chain head and event count from a verified replay.
    #[must_use]
    pub fn with_replay_report(mut self, report: &ReplayReport) -> Self {
        if let Some(last_hash) = &report.last_hash {
            self.replay_hash = format!("{SHA256_PREFIX}{last_hash}");
        }
        self.event_count = report.events;
        self
    }

    /// Records the run's wall-clock duration in whole seconds.
    #[must_use]
    pub const fn with_total_runtime_sec(mut self, seconds: u64) -> Self {
        self.total_runtime_sec = seconds;
        self
    }

    /// Finalizes `run_id`.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::MissingDataset`] when there is nothing to
    /// finalize, [`FinalizerError::AlreadyFinalized`] when the verified
    /// directory exists, and I/O or manifest errors otherwise. On error no
    /// verified directory is left behind.
    pub fn finalize(&self, run_id: &str) -> Result<FinalizeReport, FinalizerError> {
        validate_run_id(run_id).map_err(|err| FinalizerError::InvalidRunId(err.to_string()))?;
        let dataset_path = self.pending_dir.join(DATASET_FILE);
        let run_dir = self.verified_dir.join(run_id);
        if run_dir.exists() {
            return Err(FinalizerError::AlreadyFinalized(run_dir.display().to_string()));
        }
        let dataset = File::open(&dataset_path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                FinalizerError::MissingDataset(dataset_path.display().to_string())
            } else {
                FinalizerError::Io(err.to_string())
            }
        })?;
        let digest =
            Sha256Stream::digest(dataset).map_err(|err| FinalizerError::Io(err.to_string()))?;
        let dataset_hash = format!("{SHA256_PREFIX}{}", digest.hex);
        let manifest = self.build_manifest(run_id, &dataset_hash, digest.line_count);
        let canonical =
            canonicalize_manifest(&manifest).map_err(|err| FinalizerError::Manifest(err.to_string()))?;
        let signature = hmac_sha256_hex(canonical.as_bytes(), &self.signing_key)
            .map_err(|err| FinalizerError::Manifest(err.to_string()))?;

        fs::create_dir_all(&self.verified_dir).map_err(|err| FinalizerError::Io(err.to_string()))?;
        fs::create_dir(&run_dir).map_err(|err| {
            if err.kind() == ErrorKind::AlreadyExists {
                FinalizerError::AlreadyFinalized(run_dir.display().to_string())
            } else {
                FinalizerError::Io(err.to_string())
            }
        })?;
        let report = FinalizeReport {
            manifest_path: run_dir.join(MANIFEST_FILE),
            signature_path: run_dir.join(SIGNATURE_FILE),
            verified_dir: run_dir.clone(),
            dataset_hash,
            record_count: digest.line_count,
        };
        let target_dataset = run_dir.join(DATASET_FILE);
        let written = write_new_file(&report.manifest_path, canonical.as_bytes())
            .and_then(|()| write_new_file(&report.signature_path, signature.as_bytes()))
            .and_then(|()| move_file(&dataset_path, &target_dataset));
        if let Err(err) = written {
            let _ = fs::remove_dir_all(&run_dir);
            return Err(err);
        }
        freeze(&[&target_dataset, &report.manifest_path, &report.signature_path], &run_dir)?;
        Ok(report)
    }

    /// Builds the 12-key manifest.
    fn build_manifest(&self, run_id: &str, dataset_hash: &str, record_count: u64) -> Map<String, Value> {
        let mut manifest = Map::new();
        manifest.insert("run_id".to_string(), Value::from(run_id));
        manifest.insert("engine_version".to_string(), Value::from(ENGINE_VERSION));
        manifest.insert("created_at".to_string(), Value::from(now_rfc3339()));
        manifest.insert("schema_version".to_string(), Value::from(MANIFEST_SCHEMA_VERSION));
        manifest.insert("dataset_hash".to_string(), Value::from(dataset_hash));
        manifest.insert("record_count".to_string(), Value::from(record_count));
        manifest.insert("replay_hash".to_string(), Value::from(self.replay_hash.as_str()));
        manifest.insert("signing_key_id".to_string(), Value::from(SIGNING_KEY_ID));
        manifest.insert("final_state".to_string(), Value::from(FINAL_STATE_VERIFIED));
        manifest.insert("total_runtime_sec".to_string(), Value::from(self.total_runtime_sec));
        manifest.insert("event_count".to_string(), Value::from(self.event_count));
        manifest
            .insert("guardrail_snapshot".to_string(), Value::Object(self.guardrail_snapshot.clone()));
        manifest
    }
}

// ============================================================================
// SECTION: Verification
// ============================================================================

/// Re-checks a finalized directory against `signing_key`.
///
/// The manifest must be in canonical form, the signature must match it, and
/// the dataset must still hash to the recorded `dataset_hash` and
/// `record_count`.
///
/// # Errors
///
/// Returns [`FinalizerError::Verification`] on any mismatch and
/// [`FinalizerError::Io`] when a file cannot be read.
pub fn verify_finalized(run_dir: &Path, signing_key: &[u8]) -> Result<FinalizeReport, FinalizerError> {
    let manifest_path = run_dir.join(MANIFEST_FILE);
    let signature_path = run_dir.join(SIGNATURE_FILE);
    let manifest_bytes =
        fs::read(&manifest_path).map_err(|err| FinalizerError::Io(err.to_string()))?;
    let signature =
        fs::read_to_string(&signature_path).map_err(|err| FinalizerError::Io(err.to_string()))?;
    if !verify_hmac_sha256(&manifest_bytes, signature.trim(), signing_key) {
        return Err(FinalizerError::Verification("manifest signature mismatch".to_string()));
    }
    let manifest: Map<String, Value> = serde_json::from_slice(&manifest_bytes)
        .map_err(|err| FinalizerError::Verification(err.to_string()))?;
    let canonical =
        canonicalize_manifest(&manifest).map_err(|err| FinalizerError::Verification(err.to_string()))?;
    if canonical.as_bytes() != manifest_bytes.as_slice() {
        return Err(FinalizerError::Verification("manifest is not canonical".to_string()));
    }
    let dataset =
        File::open(run_dir.join(DATASET_FILE)).map_err(|err| FinalizerError::Io(err.to_string()))?;
    let digest = Sha256Stream::digest(dataset).map_err(|err| FinalizerError::Io(err.to_string()))?;
    let dataset_hash = format!("{SHA256_PREFIX}{}", digest.hex);
    if manifest.get("dataset_hash").and_then(Value::as_str) != Some(dataset_hash.as_str()) {
        return Err(FinalizerError::Verification("dataset hash mismatch".to_string()));
    }
    if manifest.get("record_count").and_then(Value::as_u64) != Some(digest.line_count) {
        return Err(FinalizerError::Verification("record count mismatch".to_string()));
    }
    Ok(FinalizeReport {
        verified_dir: run_dir.to_path_buf(),
        manifest_path,
        signature_path,
        dataset_hash,
        record_count: digest.line_count,
    })
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves `path` to an absolute path, canonicalizing its existing prefix.
fn resolve_lenient(path: &Path) -> Result<PathBuf, FinalizerError> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }
    let absolute = std::path::absolute(path).map_err(|err| FinalizerError::Io(err.to_string()))?;
    let mut existing = absolute.as_path();
    let mut tail = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name() else {
            return Err(FinalizerError::Io(format!("unresolvable path: {}", path.display())));
        };
        tail.push(name.to_os_string());
        let Some(parent) = existing.parent() else {
            return Err(FinalizerError::Io(format!("unresolvable path: {}", path.display())));
        };
        existing = parent;
    }
    let mut resolved = existing.canonicalize().map_err(|err| FinalizerError::Io(err.to_string()))?;
    for name in tail.into_iter().rev() {
        if Path::new(&name).components().any(|part| !matches!(part, Component::Normal(_))) {
            return Err(FinalizerError::Containment(path.display().to_string()));
        }
        resolved.push(name);
    }
    Ok(resolved)
}

/// Creates `path` exclusively and writes `bytes` durably.
fn write_new_file(path: &Path, bytes: &[u8]) -> Result<(), FinalizerError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| FinalizerError::Io(err.to_string()))?;
    file.write_all(bytes).map_err(|err| FinalizerError::Io(err.to_string()))?;
    file.sync_all().map_err(|err| FinalizerError::Io(err.to_string()))
}

/// Moves `from` to `to`, copying across filesystems when rename cannot.
fn move_file(from: &Path, to: &Path) -> Result<(), FinalizerError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            fs::copy(from, to).map_err(|err| FinalizerError::Io(err.to_string()))?;
            File::open(to)
                .and_then(|file| file.sync_all())
                .map_err(|err| FinalizerError::Io(err.to_string()))?;
            fs::remove_file(from).map_err(|err| FinalizerError::Io(err.to_string()))
        }
        Err(err) => Err(FinalizerError::Io(err.to_string())),
    }
}

/// Makes `files` read-only and `dir` read/execute-only.
#[cfg(unix)]
fn freeze(files: &[&Path], dir: &Path) -> Result<(), FinalizerError> {
    use std::os::unix::fs::PermissionsExt;
    for file in files {
        fs::set_permissions(file, fs::Permissions::from_mode(FROZEN_FILE_MODE))
            .map_err(|err| FinalizerError::Io(err.to_string()))?;
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(FROZEN_DIR_MODE))
        .map_err(|err| FinalizerError::Io(err.to_string()))
}

/// Marks `files` and `dir` read-only.
#[cfg(not(unix))]
fn freeze(files: &[&Path], dir: &Path) -> Result<(), FinalizerError> {
    for path in files.iter().copied().chain(std::iter::once(dir)) {
        let mut permissions =
            fs::metadata(path).map_err(|err| FinalizerError::Io(err.to_string()))?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions).map_err(|err| FinalizerError::Io(err.to_string()))?;
    }
    Ok(())
}
