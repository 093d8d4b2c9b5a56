// crates/heidi-core/src/core/keystore.rs
// ============================================================================
// Module: Heidi Keystore
// Description: Passphrase-based encryption of secrets at rest.
// Purpose: Store API keys as AES-256-GCM blobs with scrypt-derived keys.
// Dependencies: aes-gcm, scrypt, rand, base64, zeroize
// ============================================================================

//! ## Overview
//! A sealed secret is `base64(salt[16] || nonce[12] || ciphertext+tag)`.
//! Each seal draws a fresh salt and nonce; the key is derived with scrypt
//! (`N = 2^14`, `r = 8`, `p = 1`, 32 bytes).
//!
//! Every opening failure (bad base64, short blob, wrong passphrase, flipped
//! byte) surfaces as the same [`KeystoreError::Decryption`] so callers learn
//! nothing about which check failed. There is no plaintext fallback.
//!
//! The passphrase, derived keys and opened plaintext are held in
//! [`Zeroizing`] buffers and wiped when dropped.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::mem;
use std::path::Path;

use aes_gcm::Aes256Gcm;
use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroize;
use zeroize::Zeroizing;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable holding the keystore passphrase.
pub const KEYSTORE_PASSPHRASE_ENV: &str = "HEIDI_KEYSTORE_PWD";

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Derived key length in bytes.
const KEY_LEN: usize = 32;

/// scrypt cost parameter as a power of two (`N = 2^14`).
const SCRYPT_LOG_N: u8 = 14;
/// scrypt block size.
const SCRYPT_R: u32 = 8;
/// scrypt parallelism.
const SCRYPT_P: u32 = 1;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Keystore failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeystoreError {
    /// The passphrase is empty or missing.
    #[error("keystore passphrase is not set")]
    MissingPassphrase,
    /// Encryption or key derivation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),
    /// Any opening failure, without detail.
    #[error("decryption failed (invalid passphrase or tampered data)")]
    Decryption,
    /// Reading a sealed file failed.
    #[error("keystore io error: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: Derived Key
// ============================================================================

/// scrypt output, wiped on drop.
struct DerivedKey {
    /// Raw key bytes.
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl DerivedKey {
    /// Derives a key from `passphrase` and `salt`.
    fn derive(passphrase: &[u8], salt: &[u8]) -> Result<Self, String> {
        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|err| err.to_string())?;
        let mut bytes = Zeroizing::new([0_u8; KEY_LEN]);
        scrypt::scrypt(passphrase, salt, &params, bytes.as_mut_slice())
            .map_err(|err| err.to_string())?;
        Ok(Self {
            bytes,
        })
    }

    /// Builds the AEAD cipher for this key.
    fn cipher(&self) -> Result<Aes256Gcm, String> {
        Aes256Gcm::new_from_slice(self.bytes.as_slice()).map_err(|err| err.to_string())
    }
}

// ============================================================================
// SECTION: Keystore
// ============================================================================

/// Passphrase-bound sealer for secrets.
///
/// # Invariants
/// - The passphrase is non-empty.
pub struct Keystore {
    /// Passphrase bytes; wiped on drop.
    passphrase: Zeroizing<Vec<u8>>,
}

impl Keystore {
    /// Creates a keystore bound to `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::MissingPassphrase`] for an empty passphrase.
    pub fn new(passphrase: impl Into<Vec<u8>>) -> Result<Self, KeystoreError> {
        let passphrase = Zeroizing::new(passphrase.into());
        if passphrase.is_empty() {
            return Err(KeystoreError::MissingPassphrase);
        }
        Ok(Self {
            passphrase,
        })
    }

    /// Creates a keystore from [`KEYSTORE_PASSPHRASE_ENV`].
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::MissingPassphrase`] when the variable is unset
    /// or empty.
    pub fn from_env() -> Result<Self, KeystoreError> {
        let passphrase = Zeroizing::new(
            env::var(KEYSTORE_PASSPHRASE_ENV).map_err(|_| KeystoreError::MissingPassphrase)?,
        );
        Self::new(passphrase.as_bytes())
    }

    /// Seals `plaintext` and returns the base64 blob.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::Encryption`] when randomness, key derivation,
    /// or encryption fails.
    pub fn encrypt_gate(&self, plaintext: &[u8]) -> Result<String, KeystoreError> {
        let mut salt = [0_u8; SALT_LEN];
        let mut nonce = [0_u8; NONCE_LEN];
        OsRng.try_fill_bytes(&mut salt).map_err(|err| KeystoreError::Encryption(err.to_string()))?;
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|err| KeystoreError::Encryption(err.to_string()))?;
        let key = DerivedKey::derive(&self.passphrase, &salt).map_err(KeystoreError::Encryption)?;
        let cipher = key.cipher().map_err(KeystoreError::Encryption)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| KeystoreError::Encryption("aead seal failed".to_string()))?;
        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Opens a base64 blob produced by [`Keystore::encrypt_gate`].
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::Decryption`] for every failure.
    pub fn decrypt_gate(&self, blob: &str) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
        let raw = BASE64.decode(blob.trim()).map_err(|_| KeystoreError::Decryption)?;
        if raw.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(KeystoreError::Decryption);
        }
        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let key = DerivedKey::derive(&self.passphrase, salt).map_err(|_| KeystoreError::Decryption)?;
        let cipher = key.cipher().map_err(|_| KeystoreError::Decryption)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| KeystoreError::Decryption)
    }

    /// Opens a sealed file (for example `api_key.enc`) and returns the secret.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::Io`] when the file cannot be read and
    /// [`KeystoreError::Decryption`] when it cannot be opened.
    pub fn load_secret(&self, path: &Path) -> Result<Zeroizing<String>, KeystoreError> {
        let blob = fs::read_to_string(path).map_err(|err| KeystoreError::Io(err.to_string()))?;
        let mut plaintext = self.decrypt_gate(&blob)?;
        match String::from_utf8(mem::take(&mut *plaintext)) {
            Ok(secret) => Ok(Zeroizing::new(secret)),
            Err(err) => {
                err.into_bytes().zeroize();
                Err(KeystoreError::Decryption)
            }
        }
    }
}
