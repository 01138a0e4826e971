//! Worker-side execution: function registry, argument list, and the
//! wrapping function every worker process runs

use crate::backend::spawn;
use crate::output::{collect_rank_zero_results, SpawnOutput};
use crate::snapshot::GlobalStateSnapshot;
use crate::trainer::Trainer;
use checkpoint::{CheckpointIo, LocalCheckpointIo};
use runtime_core::config::LoggingConfig;
use runtime_core::{telemetry, Error, LaunchId, Rank, Result, StateDict, TrainerState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, info_span};

/// Environment variable pointing a spawned worker at its payload file
pub const ENV_LAUNCH_PAYLOAD: &str = "STRATA_LAUNCH_PAYLOAD";

/// Signature of a function run in every worker process
pub type WorkerFn = fn(&WorkerContext, Vec<Value>) -> Result<WorkerReturn>;

/// A worker function together with the name spawned processes resolve it by
#[derive(Debug, Clone, Copy)]
pub struct WorkerFunction {
    name: &'static str,
    func: WorkerFn,
}

impl WorkerFunction {
    pub const fn new(name: &'static str, func: WorkerFn) -> Self {
        Self { name, func }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn func(&self) -> WorkerFn {
        self.func
    }
}

/// Worker functions a binary can run when started as a spawned worker
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, WorkerFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, replacing any previous one with the same name
    pub fn register(&mut self, function: WorkerFunction) -> &mut Self {
        self.functions.insert(function.name.to_string(), function.func);
        self
    }

    pub fn with(mut self, function: WorkerFunction) -> Self {
        self.register(function);
        self
    }

    pub fn get(&self, name: &str) -> Result<WorkerFn> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownWorkerFunction {
                name: name.to_string(),
            })
    }
}

/// One entry of the argument list shipped to every worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WorkerArg {
    /// A user argument
    Value(Value),

    /// Captured coordinator flags, always the trailing argument
    GlobalStates(GlobalStateSnapshot),
}

impl WorkerArg {
    pub fn as_snapshot(&self) -> Option<&GlobalStateSnapshot> {
        match self {
            WorkerArg::GlobalStates(snapshot) => Some(snapshot),
            WorkerArg::Value(_) => None,
        }
    }
}

/// Identity of a worker process within a launch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerContext {
    pub launch_id: LaunchId,
    pub process_idx: usize,
    pub local_rank: Rank,
    pub node_rank: Rank,
    pub global_rank: Rank,
    pub world_size: usize,
    pub num_processes: usize,
    pub main_address: String,
    pub main_port: u16,
}

impl WorkerContext {
    /// Standard distributed environment variables for this worker
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("RANK", self.global_rank.to_string()),
            ("LOCAL_RANK", self.local_rank.to_string()),
            ("NODE_RANK", self.node_rank.to_string()),
            ("WORLD_SIZE", self.world_size.to_string()),
            ("LOCAL_WORLD_SIZE", self.num_processes.to_string()),
            ("MASTER_ADDR", self.main_address.clone()),
            ("MASTER_PORT", self.main_port.to_string()),
        ]
    }

    /// Whether this worker hands results back to the coordinator
    pub fn is_collector(&self) -> bool {
        self.local_rank == 0
    }
}

/// What a worker function hands back
pub struct WorkerReturn {
    /// Arbitrary results, returned to the coordinator from rank zero
    pub results: Value,

    /// The run the function drove, if any
    pub trainer: Option<Box<dyn Trainer>>,
}

impl WorkerReturn {
    pub fn value(results: Value) -> Self {
        Self {
            results,
            trainer: None,
        }
    }

    pub fn with_trainer(trainer: Box<dyn Trainer>, results: Value) -> Self {
        Self {
            results,
            trainer: Some(trainer),
        }
    }
}

/// Outcome a worker process leaves for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReport {
    Completed { output: Option<SpawnOutput> },
    Failed { message: String },
}

/// Body of every worker process.
///
/// Restores the trailing snapshot (if any) before the function runs, then
/// collects rank-zero results. Only local rank zero returns output.
pub fn wrapping_function(
    ctx: &WorkerContext,
    func: WorkerFn,
    mut args: Vec<WorkerArg>,
    io: &dyn CheckpointIo,
) -> Result<Option<SpawnOutput>> {
    if let Some(snapshot) = args.last().and_then(WorkerArg::as_snapshot).copied() {
        args.pop();
        snapshot.restore()?;
        debug!(seed = snapshot.seed(), "Restored global state in worker");
    }

    let values = args
        .into_iter()
        .map(|arg| match arg {
            WorkerArg::Value(value) => Ok(value),
            WorkerArg::GlobalStates(_) => Err(Error::Internal {
                message: "global state snapshot must be the trailing worker argument".to_string(),
            }),
        })
        .collect::<Result<Vec<_>>>()?;

    let returned = func(ctx, values)?;

    match returned.trainer {
        Some(trainer) => collect_rank_zero_results(ctx, trainer.as_ref(), returned.results, io),
        None if ctx.is_collector() => Ok(Some(SpawnOutput::from_results(returned.results))),
        None => Ok(None),
    }
}

/// Run the wrapping function and write its report; returns the exit code.
///
/// Panics in the worker function are reported as failures.
pub(crate) fn execute_worker(
    ctx: &WorkerContext,
    func: WorkerFn,
    args: Vec<WorkerArg>,
    sync_on_write: bool,
    report_path: &Path,
) -> i32 {
    let span = info_span!("worker", process_idx = ctx.process_idx, rank = ctx.global_rank);
    let _guard = span.enter();

    let local = LocalCheckpointIo::new(sync_on_write);
    let handoff = handoff_path(report_path);
    let io = AnnouncingIo {
        inner: &local,
        handoff_path: &handoff,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        wrapping_function(ctx, func, args, &io)
    }));

    let report = match outcome {
        Ok(Ok(output)) => WorkerReport::Completed { output },
        Ok(Err(e)) => WorkerReport::Failed {
            message: e.to_string(),
        },
        Err(payload) => WorkerReport::Failed {
            message: panic_message(payload.as_ref()),
        },
    };

    let exit_code = match report {
        WorkerReport::Completed { .. } => 0,
        WorkerReport::Failed { ref message } => {
            error!(error = %message, "Worker function failed");
            1
        }
    };

    if let Err(e) = write_report(report_path, &report) {
        error!(error = %e, path = %report_path.display(), "Failed to write worker report");
        return 2;
    }

    info!(exit_code, "Worker finished");
    exit_code
}

/// Write a report so the coordinator never observes a partial file
pub(crate) fn write_report(path: &Path, report: &WorkerReport) -> Result<()> {
    let staging = path.with_extension("report.tmp");
    let mut file = fs::File::create(&staging)?;
    file.write_all(&serde_json::to_vec(report)?)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&staging, path)?;
    Ok(())
}

pub(crate) fn read_report(path: &Path) -> Result<Option<WorkerReport>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Checkpoint I/O that records each path in a handoff file before writing
/// to it, so the coordinator can find the checkpoint even if this worker is
/// killed mid-save
struct AnnouncingIo<'a> {
    inner: &'a dyn CheckpointIo,
    handoff_path: &'a Path,
}

impl CheckpointIo for AnnouncingIo<'_> {
    fn save_checkpoint(
        &self,
        state_dict: &StateDict,
        state: &TrainerState,
        path: &Path,
    ) -> Result<u64> {
        write_handoff(self.handoff_path, path)?;
        self.inner.save_checkpoint(state_dict, state, path)
    }

    fn load_checkpoint(&self, path: &Path) -> Result<StateDict> {
        self.inner.load_checkpoint(path)
    }

    fn remove_checkpoint(&self, path: &Path) -> Result<()> {
        self.inner.remove_checkpoint(path)
    }
}

/// Handoff file kept next to a worker's report
pub(crate) fn handoff_path(report_path: &Path) -> PathBuf {
    report_path.with_extension("handoff")
}

pub(crate) fn write_handoff(path: &Path, checkpoint: &Path) -> Result<()> {
    let staging = path.with_extension("handoff.tmp");
    let mut file = fs::File::create(&staging)?;
    file.write_all(&serde_json::to_vec(checkpoint)?)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&staging, path)?;
    debug!(checkpoint = %checkpoint.display(), "Announced temporary checkpoint");
    Ok(())
}

pub(crate) fn read_handoff(path: &Path) -> Result<Option<PathBuf>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        "worker panicked".to_string()
    }
}

/// Entry hook for binaries that can act as spawned workers.
///
/// Call first thing in `main`. Returns `None` in an ordinary process; in a
/// process started by the spawn backend it runs the requested function and
/// returns the exit code the process should leave with.
pub fn run_if_worker(registry: &FunctionRegistry) -> Option<i32> {
    let payload_path = std::env::var_os(ENV_LAUNCH_PAYLOAD)?;
    telemetry::init_tracing(&LoggingConfig::default().default_filter);
    Some(spawn::run_spawned_worker(Path::new(&payload_path), registry))
}
