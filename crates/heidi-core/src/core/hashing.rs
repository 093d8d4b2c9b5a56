// crates/heidi-core/src/core/hashing.rs
// ============================================================================
// Module: Heidi Hashing
// Description: SHA-256 digests and canonical JSON byte encoding.
// Purpose: Provide the digest primitives shared by the journal and finalizer.
// Dependencies: serde, serde_jcs, sha2, hex
// ============================================================================

//! ## Overview
//! All integrity checks in Heidi are SHA-256 over raw bytes, rendered as
//! lowercase hex. Canonical JSON uses RFC 8785 (JCS): sorted keys, no
//! insignificant whitespace, and a single number formatting.
//!
//! [`Sha256Stream`] hashes large files incrementally so datasets never have
//! to be held in memory.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Read;

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Buffer size used when streaming files through the hasher.
pub const STREAM_CHUNK_BYTES: usize = 8 * 1024;

/// Prefix applied to digests embedded in manifests.
pub const SHA256_PREFIX: &str = "sha256:";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when computing canonical hashes.
#[derive(Debug, Error)]
pub enum HashError {
    /// JSON canonicalization failed.
    #[error("failed to canonicalize json: {0}")]
    Canonicalization(String),
    /// Reading the stream failed.
    #[error("hash stream io error: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Returns canonical JSON bytes for a serializable value using RFC 8785.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

/// Hashes raw bytes and returns the lowercase hex digest.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ============================================================================
// SECTION: Streaming
// ============================================================================

/// Digest and newline count of a streamed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    /// Lowercase hex SHA-256 of every byte read.
    pub hex: String,
    /// Number of JSONL records (newline-terminated or trailing).
    pub line_count: u64,
    /// Total bytes read.
    pub byte_len: u64,
}

/// Incremental SHA-256 over a reader, counting JSONL records as it goes.
pub struct Sha256Stream;

impl Sha256Stream {
    /// Streams `reader` to completion in fixed-size chunks.
    ///
    /// A final line without a trailing newline still counts as a record.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::Io`] when the reader fails.
    pub fn digest<R: Read>(mut reader: R) -> Result<StreamDigest, HashError> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0_u8; STREAM_CHUNK_BYTES];
        let mut line_count = 0_u64;
        let mut byte_len = 0_u64;
        let mut last_byte = None;
        loop {
            let read = reader.read(&mut buf).map_err(|err| HashError::Io(err.to_string()))?;
            if read == 0 {
                break;
            }
            let chunk = &buf[.. read];
            hasher.update(chunk);
            line_count += chunk.iter().filter(|byte| **byte == b'\n').count() as u64;
            byte_len += read as u64;
            last_byte = chunk.last().copied();
        }
        if let Some(byte) = last_byte
            && byte != b'\n'
        {
            line_count += 1;
        }
        Ok(StreamDigest {
            hex: hex::encode(hasher.finalize()),
            line_count,
            byte_len,
        })
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
