//! Process-wide reproducibility flags
//!
//! Every process owns one flag store (see [`process_globals`]). Worker
//! processes started without inheriting parent memory begin with a fresh,
//! default-initialized store, so the launcher ships a snapshot of these
//! values across the process boundary and applies it with [`GlobalFlags::apply`].

use crate::{Error, Result};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

/// Position of the global generator: its seed and how far it has advanced
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RngState {
    /// Seed the generator was last seeded with
    pub seed: u64,

    /// Word position within the ChaCha stream
    pub word_pos: u128,
}

/// Plain values of every flag in a store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagValues {
    pub deterministic_algorithms: bool,
    pub deterministic_warn_only: bool,
    pub autotune: bool,
    pub rng: RngState,
}

#[derive(Debug)]
struct FlagState {
    deterministic_algorithms: bool,
    deterministic_warn_only: bool,
    autotune: bool,
    seed: u64,
    rng: ChaCha8Rng,
    locked: bool,
}

impl FlagState {
    fn rng_state(&self) -> RngState {
        RngState {
            seed: self.seed,
            word_pos: self.rng.get_word_pos(),
        }
    }

    fn ensure_unlocked(&self, flag: &str, changes: bool) -> Result<()> {
        if self.locked && changes {
            return Err(Error::GlobalStateLocked {
                flag: flag.to_string(),
            });
        }
        Ok(())
    }
}

/// A store of reproducibility flags
#[derive(Debug)]
pub struct GlobalFlags {
    state: Mutex<FlagState>,
}

impl GlobalFlags {
    /// Create a store with default flags and a random seed
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Create a store with default flags and the given seed
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(FlagState {
                deterministic_algorithms: false,
                deterministic_warn_only: false,
                autotune: false,
                seed,
                rng: ChaCha8Rng::seed_from_u64(seed),
                locked: false,
            }),
        }
    }

    /// Enable or disable deterministic algorithms
    pub fn use_deterministic_algorithms(&self, mode: bool, warn_only: bool) -> Result<()> {
        let mut state = self.state.lock();
        let changes =
            state.deterministic_algorithms != mode || state.deterministic_warn_only != warn_only;
        state.ensure_unlocked("deterministic_algorithms", changes)?;
        state.deterministic_algorithms = mode;
        state.deterministic_warn_only = warn_only;
        Ok(())
    }

    pub fn are_deterministic_algorithms_enabled(&self) -> bool {
        self.state.lock().deterministic_algorithms
    }

    pub fn is_deterministic_warn_only(&self) -> bool {
        self.state.lock().deterministic_warn_only
    }

    /// Enable or disable the kernel autotuning heuristic
    pub fn set_autotune(&self, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        let changes = state.autotune != enabled;
        state.ensure_unlocked("autotune", changes)?;
        state.autotune = enabled;
        Ok(())
    }

    pub fn autotune(&self) -> bool {
        self.state.lock().autotune
    }

    /// Reseed the global generator
    pub fn manual_seed(&self, seed: u64) -> Result<()> {
        let mut state = self.state.lock();
        let changes = state.rng_state()
            != RngState {
                seed,
                word_pos: 0,
            };
        state.ensure_unlocked("rng_state", changes)?;
        state.seed = seed;
        state.rng = ChaCha8Rng::seed_from_u64(seed);
        Ok(())
    }

    /// Seed the global generator was last seeded with
    pub fn initial_seed(&self) -> u64 {
        self.state.lock().seed
    }

    /// Draw the next value from the global generator
    pub fn next_u64(&self) -> u64 {
        self.state.lock().rng.next_u64()
    }

    pub fn rng_state(&self) -> RngState {
        self.state.lock().rng_state()
    }

    /// Move the global generator to an exact seed and stream position
    pub fn set_rng_state(&self, rng: RngState) -> Result<()> {
        let mut state = self.state.lock();
        let changes = state.rng_state() != rng;
        state.ensure_unlocked("rng_state", changes)?;
        state.seed = rng.seed;
        state.rng = ChaCha8Rng::seed_from_u64(rng.seed);
        state.rng.set_word_pos(rng.word_pos);
        Ok(())
    }

    /// Read every flag at once
    pub fn values(&self) -> FlagValues {
        let state = self.state.lock();
        FlagValues {
            deterministic_algorithms: state.deterministic_algorithms,
            deterministic_warn_only: state.deterministic_warn_only,
            autotune: state.autotune,
            rng: state.rng_state(),
        }
    }

    /// Apply every flag at once.
    ///
    /// All flags are checked against the lock before any is written, so a
    /// rejected apply leaves the store untouched.
    pub fn apply(&self, values: &FlagValues) -> Result<()> {
        let mut state = self.state.lock();

        state.ensure_unlocked(
            "deterministic_algorithms",
            state.deterministic_algorithms != values.deterministic_algorithms
                || state.deterministic_warn_only != values.deterministic_warn_only,
        )?;
        state.ensure_unlocked("autotune", state.autotune != values.autotune)?;
        state.ensure_unlocked("rng_state", state.rng_state() != values.rng)?;

        state.deterministic_algorithms = values.deterministic_algorithms;
        state.deterministic_warn_only = values.deterministic_warn_only;
        state.autotune = values.autotune;
        state.seed = values.rng.seed;
        state.rng = ChaCha8Rng::seed_from_u64(values.rng.seed);
        state.rng.set_word_pos(values.rng.word_pos);

        debug!(
            deterministic = values.deterministic_algorithms,
            autotune = values.autotune,
            seed = values.rng.seed,
            "Applied global flags"
        );
        Ok(())
    }

    /// Freeze the store; later changes to any flag are rejected
    pub fn lock(&self) {
        self.state.lock().locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }
}

impl Default for GlobalFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// The flag store of the calling process
pub fn process_globals() -> &'static GlobalFlags {
    static GLOBALS: OnceLock<GlobalFlags> = OnceLock::new();
    GLOBALS.get_or_init(GlobalFlags::new)
}
