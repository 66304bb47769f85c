//! Resumable transfer state persistence.
//!
//! The receiver records which chunks are durably on disk in a JSON document
//! beside the output file (`<basename>.justdatacopier.state`). The file is
//! rewritten after every chunk, atomically (write to a temp file, then
//! rename), and removed once the transfer completes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::file::ChunkGrid;

/// Suffix of the on-disk state document.
pub const STATE_FILE_EXT: &str = ".justdatacopier.state";

/// Current state document version.
pub const STATE_VERSION: u32 = 1;

/// Durable record of a partially received transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    /// Basename of the file being received
    pub filename: String,
    /// Total file size in bytes
    pub file_size: u64,
    /// Chunk size the grid was built with
    pub chunk_size: u64,
    /// Number of chunks in the grid
    pub num_chunks: u64,
    /// Per-chunk received flags, `num_chunks` entries
    pub chunks_received: Vec<bool>,
    /// Timestamp of the last save
    pub last_modified: DateTime<Utc>,
    /// Document version
    #[serde(default)]
    pub version: u32,
}

impl TransferState {
    /// Fresh state for a new transfer: nothing received yet.
    #[must_use]
    pub fn new(filename: &str, grid: &ChunkGrid) -> Self {
        Self {
            filename: filename.to_string(),
            file_size: grid.file_size,
            chunk_size: grid.chunk_size,
            num_chunks: grid.num_chunks,
            chunks_received: vec![false; usize::try_from(grid.num_chunks).unwrap_or(0)],
            last_modified: Utc::now(),
            version: STATE_VERSION,
        }
    }

    /// Whether this state belongs to the same transfer grid.
    ///
    /// A mismatch in any identity field means the state is stale and must be
    /// discarded.
    #[must_use]
    pub fn is_compatible(&self, grid: &ChunkGrid) -> bool {
        self.file_size == grid.file_size
            && self.chunk_size == grid.chunk_size
            && self.num_chunks == grid.num_chunks
            && self.chunks_received.len() as u64 == grid.num_chunks
    }

    /// Number of chunks already received.
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.chunks_received.iter().filter(|c| **c).count() as u64
    }

    /// Advisory resume offset: completed chunk count times chunk size.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.received_count() * self.chunk_size
    }
}

/// Path of the state document for a given output basename.
#[must_use]
pub fn state_path(output_dir: &Path, basename: &str) -> PathBuf {
    output_dir.join(format!("{basename}{STATE_FILE_EXT}"))
}

/// Persist the state atomically.
///
/// Stamps `last_modified` and the current version before writing.
///
/// # Errors
///
/// Returns a state error if serialization fails or a filesystem error if the
/// write or rename fails.
pub async fn save(state: &mut TransferState, output_dir: &Path) -> Result<()> {
    state.last_modified = Utc::now();
    state.version = STATE_VERSION;

    let path = state_path(output_dir, &state.filename);
    let json = serde_json::to_string_pretty(state).map_err(|e| Error::State(e.to_string()))?;

    let temp_path = path.with_extension("state.tmp");
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| Error::filesystem("write_state", e))?;
    file.write_all(json.as_bytes())
        .await
        .map_err(|e| Error::filesystem("write_state", e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::filesystem("sync_state", e))?;
    drop(file);

    fs::rename(&temp_path, &path)
        .await
        .map_err(|e| Error::filesystem("rename_state", e))?;

    Ok(())
}

/// Load the state for a basename, if a usable document exists.
///
/// A missing file yields `None`; an unreadable or unparsable document is
/// treated the same (the transfer just starts fresh). A version of zero is
/// upgraded to the current version on load.
pub async fn load(output_dir: &Path, basename: &str) -> Option<TransferState> {
    let path = state_path(output_dir, basename);

    let data = match fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read transfer state, starting fresh");
            return None;
        }
    };

    match serde_json::from_slice::<TransferState>(&data) {
        Ok(mut state) => {
            if state.version == 0 {
                state.version = STATE_VERSION;
            }
            Some(state)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse transfer state, starting fresh");
            None
        }
    }
}

/// Remove the state document. Missing files are not an error.
///
/// # Errors
///
/// Returns a filesystem error if an existing document cannot be deleted.
pub async fn remove(output_dir: &Path, basename: &str) -> Result<()> {
    let path = state_path(output_dir, basename);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::filesystem("remove_state", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn grid() -> ChunkGrid {
        ChunkGrid::new(10 * 1024 * 1024, 1024 * 1024)
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let mut state = TransferState::new("data.bin", &grid());
        state.chunks_received[0] = true;
        state.chunks_received[4] = true;

        save(&mut state, dir.path()).await.expect("save");

        let loaded = load(dir.path(), "data.bin").await.expect("state exists");
        assert_eq!(loaded.filename, "data.bin");
        assert_eq!(loaded.num_chunks, 10);
        assert_eq!(loaded.received_count(), 2);
        assert_eq!(loaded.version, STATE_VERSION);
        assert!(loaded.chunks_received[0]);
        assert!(loaded.chunks_received[4]);
        assert!(!loaded.chunks_received[1]);
    }

    #[tokio::test]
    async fn test_state_file_uses_wire_suffix() {
        let dir = TempDir::new().expect("temp dir");
        let mut state = TransferState::new("data.bin", &grid());
        save(&mut state, dir.path()).await.expect("save");

        assert!(dir
            .path()
            .join("data.bin.justdatacopier.state")
            .exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = TempDir::new().expect("temp dir");
        assert!(load(dir.path(), "absent.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_is_none() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(state_path(dir.path(), "data.bin"), b"{not json")
            .expect("write corrupt state");
        assert!(load(dir.path(), "data.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let mut state = TransferState::new("data.bin", &grid());
        save(&mut state, dir.path()).await.expect("save");

        remove(dir.path(), "data.bin").await.expect("remove");
        assert!(load(dir.path(), "data.bin").await.is_none());
        remove(dir.path(), "data.bin").await.expect("second remove");
    }

    #[test]
    fn test_compatibility_check() {
        let state = TransferState::new("data.bin", &grid());
        assert!(state.is_compatible(&grid()));

        assert!(!state.is_compatible(&ChunkGrid::new(11 * 1024 * 1024, 1024 * 1024)));
        assert!(!state.is_compatible(&ChunkGrid::new(10 * 1024 * 1024, 512 * 1024)));
    }

    #[test]
    fn test_resume_offset() {
        let mut state = TransferState::new("data.bin", &grid());
        assert_eq!(state.resume_offset(), 0);
        state.chunks_received[0] = true;
        state.chunks_received[1] = true;
        state.chunks_received[2] = true;
        assert_eq!(state.resume_offset(), 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_zero_version_upgraded_on_load() {
        let dir = TempDir::new().expect("temp dir");
        let json = serde_json::json!({
            "filename": "data.bin",
            "file_size": 1024,
            "chunk_size": 512,
            "num_chunks": 2,
            "chunks_received": [true, false],
            "last_modified": Utc::now(),
        });
        std::fs::write(
            state_path(dir.path(), "data.bin"),
            serde_json::to_vec(&json).unwrap(),
        )
        .expect("write state");

        let loaded = load(dir.path(), "data.bin").await.expect("state exists");
        assert_eq!(loaded.version, STATE_VERSION);
    }
}
