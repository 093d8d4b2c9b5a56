// crates/heidi-core/src/core/signature.rs
// ============================================================================
// Module: Heidi Signatures
// Description: HMAC-SHA256 signing and manifest/record canonicalization.
// Purpose: Reduce signed objects to one byte string and sign it.
// Dependencies: hmac, sha2, subtle, hex, serde_jcs, serde_json, rand
// ============================================================================

//! ## Overview
//! HMAC-SHA256 is the only signing primitive. Every signed object is first
//! canonicalized: sorted keys, compact separators, no NaN or infinity.
//!
//! Manifests carry exactly twelve keys and no floating-point value at the top
//! level or one level down. Floats are excluded from the trust boundary
//! entirely so that every platform signs the same bytes.
//!
//! Verification compares digests in constant time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use hmac::Hmac;
use hmac::Mac;
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Map;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::core::hashing::canonical_json_bytes;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// HMAC-SHA256 type alias.
type HmacSha256 = Hmac<Sha256>;

/// Number of keys a manifest must carry.
pub const MANIFEST_KEY_COUNT: usize = 12;

/// Manifest keys written by the finalizer.
pub const MANIFEST_KEYS: [&str; MANIFEST_KEY_COUNT] = [
    "run_id",
    "engine_version",
    "created_at",
    "schema_version",
    "dataset_hash",
    "record_count",
    "replay_hash",
    "signing_key_id",
    "final_state",
    "total_runtime_sec",
    "event_count",
    "guardrail_snapshot",
];

/// File name of the per-installation signing secret.
pub const SECRET_KEY_FILE: &str = ".secret_key";

/// Random bytes in a generated signing secret (hex-encoded on disk).
const SECRET_KEY_BYTES: usize = 64;

/// Record fields covered by a record signature.
const RECORD_FIELDS: [&str; 3] = ["instruction", "input", "output"];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Signature and canonicalization failures.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The manifest key count is not twelve.
    #[error("manifest must have exactly 12 keys, found {0}")]
    KeyCount(usize),
    /// A float was found inside the trust boundary.
    #[error("manifest contains a float at {0}")]
    FloatValue(String),
    /// NaN or infinity encountered.
    #[error("non-finite number at {0}")]
    NonFinite(String),
    /// The signing key is unusable.
    #[error("invalid signing key: {0}")]
    Key(String),
    /// Serialization failed.
    #[error("canonicalization failed: {0}")]
    Canonicalization(String),
    /// Secret key file I/O failed.
    #[error("secret key io error: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: HMAC
// ============================================================================

/// Computes HMAC-SHA256 over `data` and returns lowercase hex.
///
/// # Errors
///
/// Returns [`SignatureError::Key`] when the key is empty.
pub fn hmac_sha256_hex(data: &[u8], key: &[u8]) -> Result<String, SignatureError> {
    Ok(hex::encode(hmac_sha256(data, key)?))
}

/// Verifies a hex HMAC-SHA256 signature in constant time.
///
/// Malformed hex, an empty key, or a length mismatch all return `false`.
#[must_use]
pub fn verify_hmac_sha256(data: &[u8], signature_hex: &str, key: &[u8]) -> bool {
    let Ok(provided) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(expected) = hmac_sha256(data, key) else {
        return false;
    };
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// Computes raw HMAC-SHA256 bytes.
fn hmac_sha256(data: &[u8], key: &[u8]) -> Result<Vec<u8>, SignatureError> {
    if key.is_empty() {
        return Err(SignatureError::Key("signing key must be non-empty".to_string()));
    }
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|err| SignatureError::Key(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

// ============================================================================
// SECTION: Canonicalization
// ============================================================================

/// Canonicalizes a manifest for signing.
///
/// # Errors
///
/// Returns [`SignatureError::KeyCount`] unless the manifest has exactly twelve
/// keys, [`SignatureError::FloatValue`] for any float at depth 0 or 1, and
/// [`SignatureError::NonFinite`] for NaN or infinity anywhere.
pub fn canonicalize_manifest(manifest: &Map<String, Value>) -> Result<String, SignatureError> {
    if manifest.len() != MANIFEST_KEY_COUNT {
        return Err(SignatureError::KeyCount(manifest.len()));
    }
    for (key, value) in manifest {
        reject_float(value, key)?;
        match value {
            Value::Object(nested) => {
                for (inner_key, inner) in nested {
                    reject_float(inner, &format!("{key}.{inner_key}"))?;
                }
            }
            Value::Array(items) => {
                for (index, inner) in items.iter().enumerate() {
                    reject_float(inner, &format!("{key}[{index}]"))?;
                }
            }
            _ => {}
        }
    }
    canonicalize_map(manifest)
}

/// Canonicalizes any JSON value: sorted keys, compact, finite numbers only.
///
/// # Errors
///
/// Returns [`SignatureError::NonFinite`] for NaN or infinity and
/// [`SignatureError::Canonicalization`] when serialization fails.
pub fn canonicalize_value(value: &Value) -> Result<String, SignatureError> {
    reject_non_finite(value, "$")?;
    let bytes =
        canonical_json_bytes(value).map_err(|err| SignatureError::Canonicalization(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| SignatureError::Canonicalization(err.to_string()))
}

/// Canonicalizes a JSON object.
fn canonicalize_map(map: &Map<String, Value>) -> Result<String, SignatureError> {
    for (key, value) in map {
        reject_non_finite(value, key)?;
    }
    let bytes =
        canonical_json_bytes(map).map_err(|err| SignatureError::Canonicalization(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| SignatureError::Canonicalization(err.to_string()))
}

/// Rejects a value that is itself a float.
fn reject_float(value: &Value, path: &str) -> Result<(), SignatureError> {
    if let Value::Number(number) = value
        && number.is_f64()
    {
        return Err(SignatureError::FloatValue(path.to_string()));
    }
    Ok(())
}

/// Rejects NaN or infinity anywhere inside `value`.
fn reject_non_finite(value: &Value, path: &str) -> Result<(), SignatureError> {
    match value {
        Value::Number(number) => {
            if number.as_f64().is_some_and(|float| !float.is_finite()) {
                return Err(SignatureError::NonFinite(path.to_string()));
            }
            Ok(())
        }
        Value::Array(items) => {
            items.iter().try_for_each(|item| reject_non_finite(item, path))
        }
        Value::Object(map) => map.values().try_for_each(|item| reject_non_finite(item, path)),
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
    }
}

// ============================================================================
// SECTION: Record Signing
// ============================================================================

/// Builds the canonical payload covered by a record signature.
///
/// # Errors
///
/// Returns [`SignatureError::Canonicalization`] when serialization fails.
pub fn record_signing_payload(record: &Value) -> Result<String, SignatureError> {
    let mut content = Map::new();
    for field in RECORD_FIELDS {
        content.insert(field.to_string(), Value::String(string_field(record.get(field))));
    }
    let teacher_model = record.get("metadata").and_then(|meta| meta.get("teacher_model"));
    content.insert("teacher_model".to_string(), Value::String(string_field(teacher_model)));
    canonicalize_map(&content)
}

/// Signs the protected content of a dataset record.
///
/// # Errors
///
/// Returns [`SignatureError`] when canonicalization or keying fails.
pub fn sign_record(record: &Value, key: &[u8]) -> Result<String, SignatureError> {
    let payload = record_signing_payload(record)?;
    hmac_sha256_hex(payload.as_bytes(), key)
}

/// Verifies `metadata.signature` on a dataset record.
///
/// Records without a signature fail verification.
#[must_use]
pub fn verify_record(record: &Value, key: &[u8]) -> bool {
    let Some(signature) =
        record.get("metadata").and_then(|meta| meta.get("signature")).and_then(Value::as_str)
    else {
        return false;
    };
    let Ok(payload) = record_signing_payload(record) else {
        return false;
    };
    verify_hmac_sha256(payload.as_bytes(), signature, key)
}

/// Extracts a string field, treating absent or non-string values as empty.
fn string_field(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or_default().to_string()
}

// ============================================================================
// SECTION: Secret Key File
// ============================================================================

/// Loads `{dir}/.secret_key`, generating it on first use.
///
/// The file holds 64 random bytes as hex; the hex text itself is the key.
///
/// # Errors
///
/// Returns [`SignatureError::Io`] when the file cannot be read or written.
pub fn load_or_create_secret_key(dir: &Path) -> Result<Vec<u8>, SignatureError> {
    let path = secret_key_path(dir);
    if path.exists() {
        let text = fs::read_to_string(&path).map_err(|err| SignatureError::Io(err.to_string()))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SignatureError::Key("secret key file is empty".to_string()));
        }
        return Ok(trimmed.as_bytes().to_vec());
    }
    fs::create_dir_all(dir).map_err(|err| SignatureError::Io(err.to_string()))?;
    let mut raw = [0_u8; SECRET_KEY_BYTES];
    OsRng.try_fill_bytes(&mut raw).map_err(|err| SignatureError::Io(err.to_string()))?;
    let secret = hex::encode(raw);
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path).map_err(|err| SignatureError::Io(err.to_string()))?;
    file.write_all(secret.as_bytes()).map_err(|err| SignatureError::Io(err.to_string()))?;
    file.sync_all().map_err(|err| SignatureError::Io(err.to_string()))?;
    Ok(secret.into_bytes())
}

/// Returns the secret key path inside `dir`.
#[must_use]
pub fn secret_key_path(dir: &Path) -> PathBuf {
    dir.join(SECRET_KEY_FILE)
}
