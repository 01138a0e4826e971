//! Naming for transient checkpoints used to hand weights across processes

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Reserved suffix marking a checkpoint as a transient handoff artifact
pub const TEMP_CHECKPOINT_SUFFIX: &str = ".temp.ckpt";

/// A fresh, unique temporary checkpoint path under `dir`.
///
/// Names are hidden and carry a random component so sequential or concurrent
/// launches in the same directory never collide.
pub fn temp_checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(format!(".{}{}", Uuid::new_v4().simple(), TEMP_CHECKPOINT_SUFFIX))
}

/// Returns true if `path` names a temporary checkpoint
pub fn is_temp_checkpoint(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(TEMP_CHECKPOINT_SUFFIX))
        .unwrap_or(false)
}
