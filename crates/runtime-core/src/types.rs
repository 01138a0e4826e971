//! Core type definitions shared by the launcher and checkpoint crates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Rank and launch identifier types
pub type Rank = usize;
pub type LaunchId = String;

/// Training step and epoch counters
pub type Step = u64;
pub type Epoch = u64;

/// Named parameter tensors, flattened to `f32` buffers
pub type StateDict = BTreeMap<String, Vec<f32>>;

/// Logged metric values keyed by name
pub type Metrics = BTreeMap<String, f64>;

/// The activity a run is performing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrainerFn {
    /// Fitting produces new weights
    Fitting,

    /// Validation loop only
    Validating,

    /// Test loop only
    Testing,

    /// Prediction loop only
    Predicting,
}

impl TrainerFn {
    /// Returns true if the activity produces weights that must be handed back
    pub fn produces_weights(&self) -> bool {
        matches!(self, TrainerFn::Fitting)
    }
}

impl fmt::Display for TrainerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainerFn::Fitting => "fit",
            TrainerFn::Validating => "validate",
            TrainerFn::Testing => "test",
            TrainerFn::Predicting => "predict",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TrainerStatus {
    #[default]
    Initializing,
    Running,
    Finished,
    Interrupted,
}

impl fmt::Display for TrainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainerStatus::Initializing => "initializing",
            TrainerStatus::Running => "running",
            TrainerStatus::Finished => "finished",
            TrainerStatus::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Resumable run state carried from a worker back to the coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrainerState {
    /// Activity being performed, if any
    pub fn_: Option<TrainerFn>,

    /// Lifecycle status
    pub status: TrainerStatus,

    /// Global step reached
    pub global_step: Step,

    /// Epoch reached
    pub current_epoch: Epoch,
}

impl TrainerState {
    /// State for a run performing `fn_`
    pub fn new(fn_: TrainerFn) -> Self {
        Self {
            fn_: Some(fn_),
            ..Default::default()
        }
    }

    /// Returns true if the run is fitting
    pub fn is_fitting(&self) -> bool {
        self.fn_.map(|f| f.produces_weights()).unwrap_or(false)
    }
}

/// Checkpoint type enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CheckpointType {
    /// Full checkpoint with all state
    Full,

    /// Model weights only
    ModelOnly,
}

impl CheckpointType {
    pub fn as_u8(&self) -> u8 {
        match self {
            CheckpointType::Full => 0,
            CheckpointType::ModelOnly => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CheckpointType::Full),
            1 => Some(CheckpointType::ModelOnly),
            _ => None,
        }
    }
}
