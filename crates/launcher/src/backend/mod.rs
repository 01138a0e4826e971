//! Process-start mechanisms
//!
//! A [`ProcessBackend`] starts `nprocs` workers for a [`ProcessJob`], waits
//! for all of them, and returns the output of process 0. Workers leave their
//! outcome in a report file next to the job's other launch files; the join
//! loop turns failed reports into errors.

#[cfg(unix)]
mod fork;
mod join;
pub(crate) mod spawn;

use crate::output::SpawnOutput;
use crate::start_method::{StartMethod, StartMethodSet};
use crate::worker::{handoff_path, WorkerArg, WorkerContext, WorkerFunction};
use runtime_core::{Error, LaunchId, Rank, Result};
use std::path::PathBuf;
use tracing::info;

pub use join::JoinPolicy;

/// Cluster coordinates shared by every worker of a launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub node_rank: Rank,
    pub num_processes: usize,
    pub world_size: usize,
    pub main_address: String,
    pub main_port: u16,
    /// Global rank of each local process, as the strategy assigns them
    pub global_ranks: Vec<Rank>,
}

impl WorkerEnv {
    /// Global rank of local process `local_rank`; node-major order when the
    /// strategy assigned none
    pub fn global_rank(&self, local_rank: Rank) -> Rank {
        self.global_ranks
            .get(local_rank)
            .copied()
            .unwrap_or(self.node_rank * self.num_processes + local_rank)
    }
}

/// Everything a backend needs to start the workers of one launch
#[derive(Debug, Clone)]
pub struct ProcessJob {
    pub launch_id: LaunchId,
    pub function: WorkerFunction,
    /// Argument list shipped to every worker
    pub args: Vec<WorkerArg>,
    pub env: WorkerEnv,
    /// Directory for payload and report files
    pub report_dir: PathBuf,
    /// fsync checkpoints written by workers
    pub sync_on_write: bool,
    pub join: JoinPolicy,
}

impl ProcessJob {
    /// Identity of the worker started as `process_idx`
    pub fn context(&self, process_idx: usize) -> WorkerContext {
        WorkerContext {
            launch_id: self.launch_id.clone(),
            process_idx,
            local_rank: process_idx,
            node_rank: self.env.node_rank,
            global_rank: self.env.global_rank(process_idx),
            world_size: self.env.world_size,
            num_processes: self.env.num_processes,
            main_address: self.env.main_address.clone(),
            main_port: self.env.main_port,
        }
    }

    pub fn report_path(&self, process_idx: usize) -> PathBuf {
        self.report_dir
            .join(format!("{}-{}.report", self.launch_id, process_idx))
    }

    /// Where process `process_idx` names a checkpoint before writing it
    pub fn handoff_path(&self, process_idx: usize) -> PathBuf {
        handoff_path(&self.report_path(process_idx))
    }

    pub fn payload_path(&self, process_idx: usize) -> PathBuf {
        self.report_dir
            .join(format!("{}-{}.payload", self.launch_id, process_idx))
    }
}

/// The process-start mechanism the launcher drives
pub trait ProcessBackend: Send + Sync {
    /// Start methods this backend can honour on the current platform
    fn supported_start_methods(&self) -> StartMethodSet;

    /// Start `nprocs` workers, block until all exit, and return the output
    /// of process 0
    fn start_processes(
        &self,
        job: ProcessJob,
        nprocs: usize,
        start_method: StartMethod,
    ) -> Result<Option<SpawnOutput>>;
}

/// Backend that starts real OS processes
#[derive(Debug, Clone, Default)]
pub struct OsProcessBackend {
    /// Program spawned workers execute; the current executable if unset
    worker_program: Option<PathBuf>,
}

impl OsProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_program(program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: Some(program.into()),
        }
    }

    fn worker_program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| Error::Internal {
                message: format!("Failed to determine current executable: {}", e),
            }),
        }
    }
}

impl ProcessBackend for OsProcessBackend {
    fn supported_start_methods(&self) -> StartMethodSet {
        StartMethodSet::platform()
    }

    fn start_processes(
        &self,
        job: ProcessJob,
        nprocs: usize,
        start_method: StartMethod,
    ) -> Result<Option<SpawnOutput>> {
        std::fs::create_dir_all(&job.report_dir)?;
        info!(
            launch_id = %job.launch_id,
            function = job.function.name(),
            nprocs,
            start_method = %start_method,
            "Starting worker processes"
        );

        match start_method {
            #[cfg(unix)]
            StartMethod::Fork => fork::start_processes(&job, nprocs),
            #[cfg(not(unix))]
            StartMethod::Fork => Err(Error::UnsupportedStartMethod {
                method: start_method.to_string(),
                available: "spawn".to_string(),
            }),
            StartMethod::Spawn => spawn::start_processes(&job, nprocs, &self.worker_program()?),
        }
    }
}
