//! Multiprocessing launcher
//!
//! Starts one worker process per local device with either the `fork` or the
//! `spawn` start method, carries the coordinator's global reproducibility
//! flags into spawned workers, and hands the rank-zero result (weights
//! included) back to the coordinator through a temporary checkpoint.
//!
//! Binaries that launch with `spawn` must call [`run_if_worker`] first thing
//! in `main`, since spawned workers re-execute the same program.

pub mod backend;
pub mod launcher;
pub mod output;
pub mod snapshot;
pub mod start_method;
pub mod strategy;
pub mod trainer;
pub mod worker;

pub use backend::{JoinPolicy, OsProcessBackend, ProcessBackend, ProcessJob, WorkerEnv};
pub use launcher::MultiProcessingLauncher;
pub use output::{collect_rank_zero_results, consume_spawn_output, LaunchOutput, SpawnOutput};
pub use snapshot::GlobalStateSnapshot;
pub use start_method::{StartMethod, StartMethodSet};
pub use strategy::{ClusterEnvironment, DdpSpawnStrategy, Strategy};
pub use trainer::{InMemoryTrainer, Trainer};
pub use worker::{
    run_if_worker, wrapping_function, FunctionRegistry, WorkerArg, WorkerContext, WorkerFn,
    WorkerFunction, WorkerReturn,
};
