//! `spawn` start method: workers are fresh process images
//!
//! Each worker re-executes a worker program (the current executable by
//! default) with [`ENV_LAUNCH_PAYLOAD`] pointing at a JSON payload naming the
//! function, its argument list and the worker's identity. The program must
//! call [`run_if_worker`](crate::run_if_worker) first thing in `main`.

use super::join::{join_workers, ExitState, WorkerProcess};
use super::ProcessJob;
use crate::output::SpawnOutput;
use crate::worker::{
    execute_worker, write_report, FunctionRegistry, WorkerArg, WorkerContext, WorkerReport,
    ENV_LAUNCH_PAYLOAD,
};
use runtime_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, error, warn};

/// What a spawned worker reads at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SpawnPayload {
    pub context: WorkerContext,
    pub function: String,
    pub args: Vec<WorkerArg>,
    pub sync_on_write: bool,
    pub report_path: PathBuf,
}

/// A spawned child process
pub(crate) struct SpawnedWorker {
    child: Child,
    process_idx: usize,
}

impl WorkerProcess for SpawnedWorker {
    fn process_idx(&self) -> usize {
        self.process_idx
    }

    fn try_wait(&mut self) -> Result<Option<ExitState>> {
        Ok(self.child.try_wait()?.map(exit_state))
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(process_idx = self.process_idx, error = %e, "Worker already gone");
        }
        let _ = self.child.wait();
    }
}

#[cfg(unix)]
fn exit_state(status: std::process::ExitStatus) -> ExitState {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitState::Code(code),
        (None, Some(signal)) => ExitState::Signal(signal),
        (None, None) => ExitState::Code(-1),
    }
}

#[cfg(not(unix))]
fn exit_state(status: std::process::ExitStatus) -> ExitState {
    ExitState::Code(status.code().unwrap_or(-1))
}

pub(crate) fn start_processes(
    job: &ProcessJob,
    nprocs: usize,
    program: &Path,
) -> Result<Option<SpawnOutput>> {
    let result = spawn_all(job, nprocs, program).and_then(|workers| join_workers(job, workers));

    for idx in 0..nprocs {
        let _ = fs::remove_file(job.payload_path(idx));
    }
    result
}

fn spawn_all(job: &ProcessJob, nprocs: usize, program: &Path) -> Result<Vec<SpawnedWorker>> {
    let mut workers: Vec<SpawnedWorker> = Vec::with_capacity(nprocs);

    for process_idx in 0..nprocs {
        let context = job.context(process_idx);
        let env_vars = context.env_vars();
        let payload = SpawnPayload {
            context,
            function: job.function.name().to_string(),
            args: job.args.clone(),
            sync_on_write: job.sync_on_write,
            report_path: job.report_path(process_idx),
        };
        let payload_path = job.payload_path(process_idx);
        fs::write(&payload_path, serde_json::to_vec(&payload)?)?;

        let spawned = Command::new(program)
            .env(ENV_LAUNCH_PAYLOAD, &payload_path)
            .envs(env_vars)
            .stdin(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                debug!(process_idx, pid = child.id(), program = %program.display(), "Spawned worker");
                workers.push(SpawnedWorker { child, process_idx });
            }
            Err(e) => {
                warn!(process_idx, error = %e, "Failed to spawn worker, terminating started workers");
                for mut worker in workers {
                    worker.terminate();
                }
                return Err(Error::Internal {
                    message: format!(
                        "Failed to spawn worker {} from {}: {}",
                        process_idx,
                        program.display(),
                        e
                    ),
                });
            }
        }
    }

    Ok(workers)
}

/// Worker-side half of the spawn protocol; returns the exit code
pub(crate) fn run_spawned_worker(payload_path: &Path, registry: &FunctionRegistry) -> i32 {
    let payload: SpawnPayload = match fs::read(payload_path)
        .map_err(Error::from)
        .and_then(|bytes| Ok(serde_json::from_slice::<SpawnPayload>(&bytes)?))
    {
        Ok(payload) => payload,
        Err(e) => {
            error!(path = %payload_path.display(), error = %e, "Failed to read launch payload");
            return 2;
        }
    };

    match registry.get(&payload.function) {
        Ok(func) => execute_worker(
            &payload.context,
            func,
            payload.args,
            payload.sync_on_write,
            &payload.report_path,
        ),
        Err(e) => {
            error!(function = %payload.function, "Worker function not registered in this program");
            let report = WorkerReport::Failed {
                message: e.to_string(),
            };
            if write_report(&payload.report_path, &report).is_err() {
                return 2;
            }
            1
        }
    }
}
