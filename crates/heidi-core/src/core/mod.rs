// crates/heidi-core/src/core/mod.rs
// ============================================================================
// Module: Heidi Core Types
// Description: Run state model, journal schema, and provenance primitives.
// Purpose: Provide the serializable types and pure functions of the control plane.
// Dependencies: serde, sha2, hmac, aes-gcm, scrypt
// ============================================================================

//! ## Overview
//! Core modules hold everything that does not own a file handle: the state
//! model and its transition table, the journal event schema, hashing,
//! redaction, signing, and the keystore.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod event;
pub mod hashing;
pub mod identifiers;
pub mod keystore;
pub mod redaction;
pub mod signature;
pub mod state;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use event::EVENT_FIELDS;
pub use event::EVENT_VERSION;
pub use event::Event;
pub use event::EventKind;
pub use event::EventLevel;
pub use event::EventRecord;
pub use event::EventSchemaError;
pub use event::MAX_EVENT_BYTES;
pub use event::parse_event_line;
pub use hashing::HashError;
pub use hashing::Sha256Stream;
pub use hashing::StreamDigest;
pub use hashing::sha256_hex;
pub use identifiers::RunIdError;
pub use identifiers::generate_run_id;
pub use identifiers::validate_run_id;
pub use keystore::Keystore;
pub use keystore::KeystoreError;
pub use signature::MANIFEST_KEYS;
pub use signature::SignatureError;
pub use signature::canonicalize_manifest;
pub use signature::canonicalize_value;
pub use signature::hmac_sha256_hex;
pub use signature::sign_record;
pub use signature::verify_hmac_sha256;
pub use signature::verify_record;
pub use state::FsmEvent;
pub use state::MetricMap;
pub use state::MetricValue;
pub use state::Mode;
pub use state::Phase;
pub use state::PipelineView;
pub use state::RunState;
pub use state::RunStatus;
pub use state::next_phase;
