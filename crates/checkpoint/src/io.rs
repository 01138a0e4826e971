//! Saving, loading and removing state dict checkpoints

use crate::format::CheckpointHeader;
use bytes::Bytes;
use chrono::Utc;
use runtime_core::{CheckpointType, Error, Result, StateDict, TrainerState};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Pluggable checkpoint I/O
///
/// Implementations must be usable from worker processes created by
/// `fork`, so they perform blocking I/O and hold no runtime handles.
pub trait CheckpointIo: Send + Sync {
    /// Write `state_dict` to `path`, stamped with the progress in `state`,
    /// returning the file size in bytes
    fn save_checkpoint(&self, state_dict: &StateDict, state: &TrainerState, path: &Path)
        -> Result<u64>;

    /// Read a state dict back from `path`
    fn load_checkpoint(&self, path: &Path) -> Result<StateDict>;

    /// Delete the checkpoint at `path`; a missing file is not an error
    fn remove_checkpoint(&self, path: &Path) -> Result<()>;
}

/// Local filesystem checkpoint I/O with atomic writes
#[derive(Debug, Clone)]
pub struct LocalCheckpointIo {
    /// fsync before renaming into place
    sync_on_write: bool,
}

impl LocalCheckpointIo {
    pub fn new(sync_on_write: bool) -> Self {
        Self { sync_on_write }
    }

    /// Sibling path the data is staged at before the rename
    fn staging_path(path: &Path) -> PathBuf {
        let staging_name = format!(
            ".{}.{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        path.with_file_name(staging_name)
    }

    /// Delete staging files an interrupted save of `path` left behind,
    /// returning how many were removed
    pub fn remove_staged(&self, path: &Path) -> Result<usize> {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(0);
        };
        let prefix = format!(".{}.", name.to_string_lossy());

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let entry_name = entry.file_name().to_string_lossy().into_owned();
            if entry_name.starts_with(&prefix) && entry_name.ends_with(".tmp") {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }
        }
        if removed > 0 {
            debug!(path = %path.display(), removed, "Removed staged checkpoint data");
        }
        Ok(removed)
    }
}

impl Default for LocalCheckpointIo {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CheckpointIo for LocalCheckpointIo {
    #[instrument(
        skip(self, state_dict, state),
        fields(path = %path.display(), tensors = state_dict.len(), step = state.global_step)
    )]
    fn save_checkpoint(
        &self,
        state_dict: &StateDict,
        state: &TrainerState,
        path: &Path,
    ) -> Result<u64> {
        let start = Instant::now();
        let data = bincode::serialize(state_dict)?;

        let mut header = CheckpointHeader::new(CheckpointType::ModelOnly, data.len() as u64);
        header.step = state.global_step;
        header.epoch = state.current_epoch;
        header
            .metadata
            .insert("created_at".to_string(), Utc::now().to_rfc3339());
        header
            .metadata
            .insert("status".to_string(), state.status.to_string());
        if let Some(fn_) = state.fn_ {
            header.metadata.insert("trainer_fn".to_string(), fn_.to_string());
        }
        let encoded = header.encode(&data)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::CheckpointWriteFailed {
                message: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let staging = Self::staging_path(path);
        let mut file = fs::File::create(&staging).map_err(|e| Error::CheckpointWriteFailed {
            message: format!("Failed to create {:?}: {}", staging, e),
        })?;
        file.write_all(&encoded)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        // Atomic rename
        fs::rename(&staging, path).map_err(|e| Error::CheckpointWriteFailed {
            message: format!("Failed to rename {:?} to {:?}: {}", staging, path, e),
        })?;

        let size = encoded.len() as u64;
        info!(
            size_bytes = size,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Checkpoint saved"
        );
        Ok(size)
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    fn load_checkpoint(&self, path: &Path) -> Result<StateDict> {
        let bytes = match fs::read(path) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CheckpointNotFound {
                    path: path.display().to_string(),
                })
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let origin = path.display().to_string();
        let (header, data) = CheckpointHeader::decode(bytes, &origin)?;
        if header.checkpoint_type != CheckpointType::ModelOnly {
            return Err(Error::CheckpointCorrupted {
                path: origin,
                reason: format!("expected model weights, found {:?}", header.checkpoint_type),
            });
        }

        let state_dict: StateDict = bincode::deserialize(&data)?;
        debug!(tensors = state_dict.len(), "Checkpoint loaded");
        Ok(state_dict)
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    fn remove_checkpoint(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Checkpoint removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Checkpoint already absent");
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}
