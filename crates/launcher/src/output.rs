//! Rank-zero result collection and the temporary checkpoint handoff
//!
//! A worker on local rank zero packages what the coordinator needs into a
//! [`SpawnOutput`]. Weights travel through a temporary checkpoint file under
//! the run's root directory; the coordinator loads and deletes it in
//! [`consume_spawn_output`] before `launch` returns.

use crate::trainer::Trainer;
use crate::worker::WorkerContext;
use checkpoint::{temp_checkpoint_path, CheckpointIo};
use runtime_core::{Metrics, Result, StateDict, TrainerState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Result a collector worker hands back to the coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpawnOutput {
    /// Best checkpoint the run recorded, if any
    pub best_model_path: Option<PathBuf>,

    /// Temporary checkpoint holding the trained weights (fitting runs only)
    pub weights_path: Option<PathBuf>,

    /// State the run reached, to resume it in the coordinator
    pub trainer_state: Option<TrainerState>,

    /// Whatever the worker function returned
    pub trainer_results: Value,

    /// Callback metrics logged during the run
    pub extra: Metrics,
}

impl SpawnOutput {
    /// Output of a worker that drove no run
    pub fn from_results(results: Value) -> Self {
        Self {
            trainer_results: results,
            ..Default::default()
        }
    }
}

/// Package a worker's run for the coordinator.
///
/// The state dict is computed on every rank; only local rank zero returns
/// output, and only a fitting run writes a temporary weights checkpoint.
pub fn collect_rank_zero_results(
    ctx: &WorkerContext,
    trainer: &dyn Trainer,
    results: Value,
    io: &dyn CheckpointIo,
) -> Result<Option<SpawnOutput>> {
    debug!(rank = ctx.global_rank, "Collecting results from rank 0 process");
    let best_model_path = trainer.best_model_path();
    let state_dict = trainer.state_dict()?;

    if !ctx.is_collector() {
        return Ok(None);
    }

    let state = trainer.state();
    let weights_path = if state.is_fitting() {
        let path = temp_checkpoint_path(trainer.default_root_dir());
        io.save_checkpoint(&state_dict, &state, &path)?;
        Some(path)
    } else {
        None
    };

    Ok(Some(SpawnOutput {
        best_model_path,
        weights_path,
        trainer_state: Some(state),
        trainer_results: results,
        extra: trainer.callback_metrics(),
    }))
}

/// What `launch` returns once the coordinator consumed the rank-zero output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOutput {
    pub best_model_path: Option<PathBuf>,

    /// Weights loaded from the temporary checkpoint
    pub weights: Option<StateDict>,

    pub trainer_state: Option<TrainerState>,
    pub trainer_results: Value,
    pub extra: Metrics,

    /// Temporary files that could not be removed
    pub cleanup_warnings: Vec<String>,
}

impl LaunchOutput {
    /// Write the worker's run back into the coordinator's trainer,
    /// returning the worker function's results
    pub fn recover_into(self, trainer: &mut dyn Trainer) -> Result<Value> {
        trainer.set_best_model_path(self.best_model_path);
        if let Some(weights) = self.weights {
            trainer.load_state_dict(weights)?;
        }
        if let Some(state) = self.trainer_state {
            trainer.set_state(state);
        }
        trainer.set_callback_metrics(self.extra);
        Ok(self.trainer_results)
    }
}

/// Load the weights a worker left behind and delete the temporary file.
///
/// The file is removed even when loading fails. A failed removal is not
/// fatal; it is logged and listed in [`LaunchOutput::cleanup_warnings`].
pub fn consume_spawn_output(output: SpawnOutput, io: &dyn CheckpointIo) -> Result<LaunchOutput> {
    let mut cleanup_warnings = Vec::new();

    let weights = match &output.weights_path {
        Some(path) => {
            let loaded = io.load_checkpoint(path);
            if let Err(e) = io.remove_checkpoint(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove temporary checkpoint");
                cleanup_warnings.push(format!("{}: {}", path.display(), e));
            }
            let weights = loaded?;
            info!(path = %path.display(), tensors = weights.len(), "Recovered weights from worker");
            Some(weights)
        }
        None => None,
    };

    Ok(LaunchOutput {
        best_model_path: output.best_model_path,
        weights,
        trainer_state: output.trainer_state,
        trainer_results: output.trainer_results,
        extra: output.extra,
        cleanup_warnings,
    })
}
