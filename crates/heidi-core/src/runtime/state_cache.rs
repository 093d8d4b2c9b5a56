// crates/heidi-core/src/runtime/state_cache.rs
// ============================================================================
// Module: Heidi State Cache
// Description: Reader-side TTL cache over `state.json` files.
// Purpose: Let status readers poll run state without re-reading on every call.
// Dependencies: crate::core::state, serde_json
// ============================================================================

//! ## Overview
//! The cache is owned by a reader (status server, CLI, dashboard), never
//! shared globally. Within the TTL it answers from memory without touching
//! the filesystem. After the TTL it stats the file: if modification time and
//! length are unchanged the entry is extended, otherwise the file is re-read.
//! Writers in the same process call [`StateCache::invalidate`] after a write.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use thiserror::Error;

use crate::core::state::RunState;
use crate::runtime::state_machine::STATE_FILE;
use crate::runtime::state_machine::run_dir_for;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default time-to-live for cached entries.
pub const DEFAULT_STATE_CACHE_TTL: Duration = Duration::from_secs(1);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// State cache failures.
#[derive(Debug, Error)]
pub enum StateCacheError {
    /// The state file does not exist.
    #[error("state file not found: {0}")]
    NotFound(String),
    /// Reading the state file failed.
    #[error("state cache io error: {0}")]
    Io(String),
    /// The state file is not a valid run state.
    #[error("state cache parse error: {0}")]
    Parse(String),
}

// ============================================================================
// SECTION: Cache
// ============================================================================

/// Cached copy of one state file.
#[derive(Debug, Clone)]
struct CacheEntry {
    /// Parsed state.
    state: RunState,
    /// File modification time when read.
    modified: Option<SystemTime>,
    /// File length when read.
    len: u64,
    /// Instant after which the file is re-validated.
    expires_at: Instant,
}

/// TTL cache of run states keyed by state file path.
#[derive(Debug)]
pub struct StateCache {
    /// Time-to-live for entries.
    ttl: Duration,
    /// Cached entries.
    entries: HashMap<PathBuf, CacheEntry>,
    /// Number of full file reads performed.
    disk_reads: u64,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_CACHE_TTL)
    }
}

impl StateCache {
    /// Creates an empty cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            disk_reads: 0,
        }
    }

    /// Returns the state for `run_id` under `autotrain_dir`.
    ///
    /// # Errors
    ///
    /// See [`StateCache::get`].
    pub fn get_run(
        &mut self,
        autotrain_dir: &Path,
        run_id: &str,
    ) -> Result<RunState, StateCacheError> {
        let path = run_dir_for(autotrain_dir, run_id).join(STATE_FILE);
        self.get(&path)
    }

    /// Returns the state stored at `path`, reading the file only when needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateCacheError::NotFound`] when the file is missing,
    /// [`StateCacheError::Io`] on read failures, and
    /// [`StateCacheError::Parse`] for invalid content.
    pub fn get(&mut self, path: &Path) -> Result<RunState, StateCacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(path)
            && now < entry.expires_at
        {
            return Ok(entry.state.clone());
        }
        let metadata = fs::metadata(path).map_err(|err| map_io(path, &err))?;
        let modified = metadata.modified().ok();
        let len = metadata.len();
        let expires_at = now + self.ttl;
        if let Some(entry) = self.entries.get_mut(path)
            && entry.modified == modified
            && entry.len == len
        {
            entry.expires_at = expires_at;
            return Ok(entry.state.clone());
        }
        let bytes = fs::read(path).map_err(|err| map_io(path, &err))?;
        self.disk_reads += 1;
        let state: RunState =
            serde_json::from_slice(&bytes).map_err(|err| StateCacheError::Parse(err.to_string()))?;
        self.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                state: state.clone(),
                modified,
                len,
                expires_at,
            },
        );
        Ok(state)
    }

    /// Drops the cached entry for `path`.
    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Drops every cached entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns how many times a state file was fully read.
    #[must_use]
    pub const fn disk_reads(&self) -> u64 {
        self.disk_reads
    }
}

/// Maps an I/O error, distinguishing a missing file.
fn map_io(path: &Path, err: &std::io::Error) -> StateCacheError {
    if err.kind() == ErrorKind::NotFound {
        StateCacheError::NotFound(path.display().to_string())
    } else {
        StateCacheError::Io(err.to_string())
    }
}
