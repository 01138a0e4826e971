//! Capture and restore of process-wide reproducibility flags
//!
//! Workers started with [`StartMethod::Spawn`](crate::StartMethod::Spawn) begin
//! with default-initialized flags. The coordinator captures a
//! [`GlobalStateSnapshot`] right before starting them and ships it as the
//! trailing worker argument; each worker restores it before running its
//! function.

use runtime_core::{process_globals, FlagValues, GlobalFlags, Result, RngState};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Immutable capture of the reproducibility flags at a point in time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalStateSnapshot {
    values: FlagValues,
}

impl GlobalStateSnapshot {
    /// Capture the flags of the calling process
    pub fn capture() -> Self {
        Self::capture_from(process_globals())
    }

    /// Capture the flags of an explicit store
    pub fn capture_from(flags: &GlobalFlags) -> Self {
        let snapshot = Self {
            values: flags.values(),
        };
        debug!(?snapshot, "Captured global state");
        snapshot
    }

    /// Apply the captured flags to the calling process.
    ///
    /// Either every flag is restored or none is; a store that refuses a
    /// change surfaces [`runtime_core::Error::GlobalStateLocked`].
    pub fn restore(&self) -> Result<()> {
        self.restore_into(process_globals())
    }

    /// Apply the captured flags to an explicit store
    pub fn restore_into(&self, flags: &GlobalFlags) -> Result<()> {
        flags.apply(&self.values)
    }

    pub fn deterministic_algorithms(&self) -> bool {
        self.values.deterministic_algorithms
    }

    pub fn deterministic_warn_only(&self) -> bool {
        self.values.deterministic_warn_only
    }

    pub fn autotune(&self) -> bool {
        self.values.autotune
    }

    pub fn seed(&self) -> u64 {
        self.values.rng.seed
    }

    pub fn rng_state(&self) -> RngState {
        self.values.rng
    }
}
