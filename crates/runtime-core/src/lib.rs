//! Runtime Core - Foundation for the multiprocessing launcher
//!
//! Provides core types, error handling, configuration, the process-wide
//! reproducibility flags, and tracing setup shared by every crate.

pub mod config;
pub mod error;
pub mod globals;
pub mod telemetry;
pub mod types;

pub use config::{LauncherConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use globals::{process_globals, FlagValues, GlobalFlags, RngState};
pub use types::*;
