//! The training run as seen by the launcher

use runtime_core::{Metrics, Result, StateDict, TrainerState};
use std::path::{Path, PathBuf};

/// Run collaborator whose results are handed back to the coordinator.
///
/// The launcher never drives training itself; it only reads the state a
/// worker's run reached and writes it into the coordinator's run afterwards.
pub trait Trainer {
    fn state(&self) -> TrainerState;

    fn set_state(&mut self, state: TrainerState);

    /// Directory temporary checkpoints are written under
    fn default_root_dir(&self) -> &Path;

    /// Current model weights
    fn state_dict(&self) -> Result<StateDict>;

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()>;

    fn best_model_path(&self) -> Option<PathBuf> {
        None
    }

    fn set_best_model_path(&mut self, _path: Option<PathBuf>) {}

    /// Metrics logged by callbacks during the run
    fn callback_metrics(&self) -> Metrics {
        Metrics::new()
    }

    fn set_callback_metrics(&mut self, _metrics: Metrics) {}
}

/// A [`Trainer`] that only holds values, for coordinators that keep the
/// model elsewhere and for tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryTrainer {
    pub state: TrainerState,
    pub root_dir: PathBuf,
    pub weights: StateDict,
    pub best_model_path: Option<PathBuf>,
    pub metrics: Metrics,
}

impl InMemoryTrainer {
    pub fn new(root_dir: impl Into<PathBuf>, state: TrainerState) -> Self {
        Self {
            state,
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }
}

impl Trainer for InMemoryTrainer {
    fn state(&self) -> TrainerState {
        self.state.clone()
    }

    fn set_state(&mut self, state: TrainerState) {
        self.state = state;
    }

    fn default_root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn state_dict(&self) -> Result<StateDict> {
        Ok(self.weights.clone())
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()> {
        self.weights = state_dict;
        Ok(())
    }

    fn best_model_path(&self) -> Option<PathBuf> {
        self.best_model_path.clone()
    }

    fn set_best_model_path(&mut self, path: Option<PathBuf>) {
        self.best_model_path = path;
    }

    fn callback_metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    fn set_callback_metrics(&mut self, metrics: Metrics) {
        self.metrics = metrics;
    }
}
