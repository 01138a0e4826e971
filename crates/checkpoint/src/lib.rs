//! Checkpoint handling for the multiprocessing launcher
//!
//! Provides the on-disk checkpoint format, a pluggable [`CheckpointIo`]
//! for saving, loading and removing state dicts, and naming for the
//! temporary checkpoints used to hand weights from a worker back to the
//! coordinating process.

pub mod format;
pub mod io;
pub mod temp;

pub use format::{CheckpointHeader, CHECKPOINT_MAGIC, CHECKPOINT_VERSION};
pub use io::{CheckpointIo, LocalCheckpointIo};
pub use temp::{is_temp_checkpoint, temp_checkpoint_path, TEMP_CHECKPOINT_SUFFIX};
