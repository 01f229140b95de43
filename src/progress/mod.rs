//! Durable, resumable chunk-level progress checkpointing.
//!
//! One progress file exists per (backend, source) pair, holding the index of
//! the last fully processed chunk plus cumulative counters. Saving follows a
//! backup-then-write sequence: the existing primary is first relocated to the
//! backup slot, then the new state is written to the primary. A crash between
//! those two steps leaves the backup in place, so `load` never finds zero
//! readable state files if one existed before the call.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ProgressError;

/// Checkpoint of one pipeline's progress through its source.
///
/// Serialized as JSON with these exact field names; the backup file uses the
/// same schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Index of the last chunk whose items were all attempted and tallied.
    /// `-1` means no chunk has completed yet.
    pub last_completed_chunk_index: i64,
    /// Total work items attempted across all completed chunks.
    pub total_processed_count: u64,
    /// Items that produced a completed annotation.
    pub total_success_count: u64,
    /// Items that produced a failed result.
    pub total_failed_count: u64,
    /// Wall-clock seconds accumulated across runs, including before restarts.
    pub total_duration_so_far: f64,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            last_completed_chunk_index: -1,
            total_processed_count: 0,
            total_success_count: 0,
            total_failed_count: 0,
            total_duration_so_far: 0.0,
        }
    }
}

impl ProgressState {
    /// Whether chunk `index` was already completed in a previous run.
    pub fn is_chunk_done(&self, index: usize) -> bool {
        (index as i64) <= self.last_completed_chunk_index
    }
}

/// FNV-1a over the canonicalized source path, used to key state files so two
/// sources with the same filename in different directories do not collide.
fn source_key(source: &Path) -> String {
    let canonical = source
        .canonicalize()
        .unwrap_or_else(|_| source.to_path_buf());
    let text = canonical.display().to_string();

    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{hash:016x}")
}

/// File-backed checkpoint store for one (backend, source) pair.
///
/// Exactly one pipeline writes a given store at a time; the store itself is
/// plain synchronous file IO.
pub struct ProgressStore {
    primary: PathBuf,
    backup: PathBuf,
}

impl ProgressStore {
    /// Creates the store for `backend` processing `source`, with state files
    /// under `state_dir` (created if absent).
    pub fn new(
        state_dir: impl AsRef<Path>,
        backend: &str,
        source: &Path,
    ) -> Result<Self, ProgressError> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir)?;
        let key = source_key(source);
        let primary = state_dir.join(format!("state_{backend}_{key}.json"));
        let backup = state_dir.join(format!("state_{backend}_{key}.backup.json"));
        debug!(
            primary = %primary.display(),
            source = %source.display(),
            "Using progress state file"
        );
        Ok(Self { primary, backup })
    }

    /// Loads the checkpoint, falling back through backup to a zeroed default.
    ///
    /// A primary that is missing, unreadable, or fails field validation is
    /// superseded by the backup; a valid backup is promoted back into the
    /// primary slot so the next save cycle starts from a consistent layout.
    pub fn load(&self) -> ProgressState {
        if let Some(state) = self.load_file(&self.primary) {
            return state;
        }

        if self.backup.exists() {
            warn!(
                backup = %self.backup.display(),
                "Primary progress file invalid or missing, trying backup"
            );
            if let Some(state) = self.load_file(&self.backup) {
                match fs::rename(&self.backup, &self.primary) {
                    Ok(()) => info!(
                        primary = %self.primary.display(),
                        "Recovered progress from backup file"
                    ),
                    Err(e) => warn!(error = %e, "Could not promote backup progress file"),
                }
                return state;
            }
        }

        info!(
            primary = %self.primary.display(),
            "No valid progress state found, starting fresh"
        );
        ProgressState::default()
    }

    fn load_file(&self, path: &Path) -> Option<ProgressState> {
        if !path.exists() {
            return None;
        }
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read progress file");
                return None;
            }
        };
        // Typed deserialization doubles as field validation: missing or
        // mistyped fields reject the file.
        match serde_json::from_str::<ProgressState>(&text) {
            Ok(state) => {
                debug!(path = %path.display(), ?state, "Loaded progress state");
                Some(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Progress file failed validation");
                None
            }
        }
    }

    /// Persists `state`, relocating the current primary to the backup slot
    /// first so an interrupted write still leaves one loadable file.
    pub fn save(&self, state: &ProgressState) -> Result<(), ProgressError> {
        if self.primary.exists() {
            fs::rename(&self.primary, &self.backup)?;
        }
        let text = serde_json::to_string_pretty(state)?;
        fs::write(&self.primary, text)?;
        debug!(?state, "Progress state saved");
        Ok(())
    }

    /// Removes primary and backup. Called after full completion or on an
    /// explicit fresh-start request.
    pub fn clear(&self) {
        for path in [&self.primary, &self.backup] {
            if path.exists() {
                match fs::remove_file(path) {
                    Ok(()) => info!(path = %path.display(), "Removed progress file"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Could not remove progress file"),
                }
            }
        }
    }

    /// Path of the primary state file.
    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    /// Path of the backup state file.
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }
}
