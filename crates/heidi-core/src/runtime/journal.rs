// crates/heidi-core/src/runtime/journal.rs
// ============================================================================
// Module: Heidi Event Journal
// Description: Append-only, hash-chained `events.jsonl` writer.
// Purpose: Make every recorded pipeline event tamper-evident.
// Dependencies: crate::core::{event, hashing, redaction}, serde_json
// ============================================================================

//! ## Overview
//! Each appended line embeds `prev_hash`: the SHA-256 hex of the exact bytes
//! of the previous line including its `\n`, or the run id for the first line.
//! Altering, deleting, or reordering any line breaks every later link.
//!
//! The writer never rewrites past lines. Re-opening an existing journal
//! resumes the chain from its last complete line. Line endings are hashed
//! exactly as written and never normalized.
//!
//! Messages and artifact paths are sanitized (secrets redacted, ANSI
//! stripped, lengths capped) before the line is serialized and hashed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::event::EVENT_VERSION;
use crate::core::event::Event;
use crate::core::event::EventRecord;
use crate::core::event::MAX_EVENT_BYTES;
use crate::core::event::first_non_finite;
use crate::core::event::parse_event_line;
use crate::core::hashing::sha256_hex;
use crate::core::identifiers::now_rfc3339;
use crate::core::redaction::sanitize_message;
use crate::core::redaction::sanitize_path;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Journal file name inside a run directory.
pub const JOURNAL_FILE: &str = "events.jsonl";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Journal failures.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Filesystem failure.
    #[error("journal io error: {0}")]
    Io(String),
    /// Serialized event exceeds [`MAX_EVENT_BYTES`].
    #[error("schema lock: payload size exceeds limit ({0} bytes)")]
    PayloadTooLarge(usize),
    /// NaN or infinity in a delta map.
    #[error("schema lock: rejecting non-finite value in {0}")]
    NonFinite(&'static str),
    /// Encoding failure.
    #[error("journal serialization error: {0}")]
    Serialization(String),
    /// Existing journal content cannot be chained onto.
    #[error("journal corrupt at line {line}: {reason}")]
    Corrupt {
        /// 1-based line number.
        line: u64,
        /// Failure description.
        reason: String,
    },
}

// ============================================================================
// SECTION: Journal
// ============================================================================

/// Append-only hash-chained journal for one run.
///
/// # Invariants
/// - `last_hash` is the hash of the last written line, or the run id when
///   the journal is empty.
#[derive(Debug)]
pub struct EventJournal {
    /// Journal path.
    path: PathBuf,
    /// Run id stamped on every event.
    run_id: String,
    /// Append-mode file handle.
    file: File,
    /// Chain head.
    last_hash: String,
    /// Lines in the journal.
    line_count: u64,
}

impl EventJournal {
    /// Opens (or creates) a journal and resumes its chain.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] on filesystem failures and
    /// [`JournalError::Corrupt`] when the last line is partial, fails the
    /// schema lock, or belongs to another run.
    pub fn open(path: &Path, run_id: &str) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| JournalError::Io(err.to_string()))?;
        }
        let (last_hash, line_count) = resume_chain(path, run_id)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| JournalError::Io(err.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
            file,
            last_hash,
            line_count,
        })
    }

    /// Appends one event and returns it as written.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the event violates the schema lock or
    /// the write fails. The chain head only advances after a full write, and
    /// a failed write is truncated away so the journal stays resumable.
    pub fn append(&mut self, record: EventRecord) -> Result<Event, JournalError> {
        let event = Event {
            event_version: EVENT_VERSION.to_string(),
            ts: now_rfc3339(),
            run_id: self.run_id.clone(),
            round: record.round,
            stage: record.stage,
            level: record.level,
            event_type: record.event_type,
            message: sanitize_message(&record.message),
            counters_delta: record.counters_delta,
            usage_delta: record.usage_delta,
            artifact_paths: record.artifact_paths.iter().map(|path| sanitize_path(path)).collect(),
            prev_hash: self.last_hash.clone(),
        };
        if let Some(field) = first_non_finite(&event) {
            return Err(JournalError::NonFinite(field));
        }
        let mut line = serde_json::to_string(&event)
            .map_err(|err| JournalError::Serialization(err.to_string()))?;
        if line.len() > MAX_EVENT_BYTES {
            return Err(JournalError::PayloadTooLarge(line.len()));
        }
        line.push('\n');
        append_line(&mut self.file, line.as_bytes())
            .map_err(|err| JournalError::Io(err.to_string()))?;
        self.last_hash = sha256_hex(line.as_bytes());
        self.line_count += 1;
        Ok(event)
    }

    /// Returns the current chain head.
    #[must_use]
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    /// Returns the number of lines in the journal.
    #[must_use]
    pub const fn event_count(&self) -> u64 {
        self.line_count
    }

    /// Returns the journal path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the run id stamped on events.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Writer that can be cut back to an earlier length.
trait TruncatingWrite: Write {
    /// Returns the current length in bytes.
    fn current_len(&self) -> io::Result<u64>;

    /// Truncates to `len` bytes.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl TruncatingWrite for File {
    fn current_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Writes one full line, truncating back to the prior length on failure.
fn append_line<W: TruncatingWrite>(writer: &mut W, line: &[u8]) -> io::Result<()> {
    let before = writer.current_len()?;
    let written = writer.write_all(line).and_then(|()| writer.flush());
    if let Err(err) = written {
        // The write error is the one worth reporting.
        let _ = writer.truncate_to(before);
        return Err(err);
    }
    Ok(())
}

/// Scans an existing journal and returns `(last_hash, line_count)`.
fn resume_chain(path: &Path, run_id: &str) -> Result<(String, u64), JournalError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((run_id.to_string(), 0));
        }
        Err(err) => return Err(JournalError::Io(err.to_string())),
    };
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut last_line = Vec::new();
    let mut line_count = 0_u64;
    loop {
        raw.clear();
        let read = reader.read_until(b'\n', &mut raw).map_err(|err| JournalError::Io(err.to_string()))?;
        if read == 0 {
            break;
        }
        line_count += 1;
        if raw.last() != Some(&b'\n') {
            return Err(JournalError::Corrupt {
                line: line_count,
                reason: "partial trailing line".to_string(),
            });
        }
        std::mem::swap(&mut last_line, &mut raw);
    }
    if line_count == 0 {
        return Ok((run_id.to_string(), 0));
    }
    let text = std::str::from_utf8(&last_line).map_err(|err| JournalError::Corrupt {
        line: line_count,
        reason: err.to_string(),
    })?;
    let event = parse_event_line(text.trim_end_matches('\n')).map_err(|err| {
        JournalError::Corrupt {
            line: line_count,
            reason: err.to_string(),
        }
    })?;
    if event.run_id != run_id {
        return Err(JournalError::Corrupt {
            line: line_count,
            reason: format!("journal belongs to run {}", event.run_id),
        });
    }
    Ok((sha256_hex(&last_line), line_count))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
