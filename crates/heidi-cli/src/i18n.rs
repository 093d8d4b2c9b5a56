// crates/heidi-cli/src/i18n.rs
// ============================================================================
// Module: CLI Message Catalog
// Description: Message catalog and placeholder substitution for the CLI.
// Purpose: Keep every user-facing string in one reviewed table.
// Dependencies: Standard library collections
// ============================================================================

//! ## Overview
//! The `heidi` binary stores user-facing strings in a static catalog. All
//! runtime output is routed through the [`t!`](crate::t) macro.
//!
//! ## Invariants
//! - The catalog is built once and read-only thereafter.
//! - Missing keys fall back to the key itself.
//! - Placeholders are substituted in argument order.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::OnceLock;

// ============================================================================
// SECTION: Types
// ============================================================================

/// A formatted message argument captured by the [`macro@crate::t`] macro.
///
/// # Invariants
/// - `key` matches a placeholder name without braces (for example, `path`).
#[derive(Clone)]
pub struct MessageArg {
    /// The placeholder name used in message templates (e.g., `"path"`).
    pub key: &'static str,
    /// The formatted value substituted for this placeholder.
    pub value: String,
}

impl MessageArg {
    /// Constructs a new [`MessageArg`] from a key and displayable value.
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

// ============================================================================
// SECTION: Catalog
// ============================================================================

/// English catalog entries.
const CATALOG: &[(&str, &str)] = &[
    ("main.version", "heidi {version}"),
    ("output.stream.stdout", "stdout"),
    ("output.stream.stderr", "stderr"),
    ("output.stream.unknown", "output"),
    ("output.write_failed", "Failed to write to {stream}: {error}"),
    ("output.json_failed", "Failed to render JSON: {error}"),
    ("config.load_failed", "Failed to load config: {error}"),
    ("keystore.failed", "Keystore operation failed: {error}"),
    ("secret.missing", "{env} is not set."),
    ("finalize.replay_failed", "Journal {path} failed verification: {error}"),
    ("finalize.failed", "Finalize failed: {error}"),
    ("finalize.ok", "Finalized run {run_id} into {path}"),
    ("finalize.dataset", "Dataset hash: {hash} ({records} records)"),
    ("finalize.verified", "Manifest signature and dataset hash verified."),
    ("replay.ok", "Journal verified: {events} events"),
    ("replay.run_id", "Run: {run_id}"),
    ("replay.final_state", "Final state: {state} (max round {round})"),
    ("replay.chain_head", "Chain head: {hash}"),
    ("replay.empty", "Journal is empty."),
    ("replay.unreadable", "Journal not readable: {error}"),
    ("replay.failed", "Replay verification failed: {error}"),
    ("doctor.pass", "PASS {check}"),
    ("doctor.fail", "FAIL {check}"),
    ("doctor.ok", "All checks passed."),
    ("doctor.failures", "{count} check(s) failed."),
    ("doctor.strict_failed", "Refusing to continue: doctor checks failed in strict mode."),
    ("kernel.init_failed", "Kernel bridge configuration rejected: {error}"),
    ("kernel.unavailable", "Kernel bridge preflight failed: {error}"),
    ("kernel.call_failed", "Kernel call {method} returned {status}: {reason}"),
    ("telemetry.open_failed", "Failed to open telemetry log {path}: {error}"),
    ("run.open_failed", "Failed to open run: {error}"),
    ("run.started", "Run {run_id} started in {mode} mode"),
    ("run.failed", "Run {run_id} failed: {error}"),
    ("run.finished", "Run {run_id} settled in {state} ({phase}) at round {round}"),
    ("state.failed", "Failed to read state for run {run_id}: {error}"),
];

/// Returns the message catalog.
pub(crate) fn catalog() -> &'static HashMap<&'static str, &'static str> {
    static CATALOG_MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    CATALOG_MAP.get_or_init(|| CATALOG.iter().copied().collect())
}

// ============================================================================
// SECTION: Translation
// ============================================================================

/// Renders `key` while substituting `args`.
#[must_use]
pub fn translate(key: &str, args: Vec<MessageArg>) -> String {
    let template = catalog().get(key).copied().unwrap_or(key);
    let mut result = template.to_string();
    for arg in args {
        let placeholder = format!("{{{}}}", arg.key);
        result = result.replace(&placeholder, &arg.value);
    }
    result
}

// ============================================================================
// SECTION: Macro
// ============================================================================

/// Formats a catalog message from a key and named arguments.
///
/// # Arguments
///
/// - `$key` must match a catalog entry.
/// - Named arguments are substituted into `{placeholder}` positions.
#[macro_export]
macro_rules! t {
    ($key:literal $(, $name:ident = $value:expr )* $(,)?) => {{
        let args = ::std::vec![
            $(
                $crate::i18n::MessageArg::new(stringify!($name), $value.to_string()),
            )*
        ];
        $crate::i18n::translate($key, args)
    }};
}

// ============================================================================
// SECTION: Tests
// ============================================================================
