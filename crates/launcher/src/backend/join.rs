//! Waiting for worker processes and reading their reports

use super::ProcessJob;
use crate::output::SpawnOutput;
use crate::worker::{read_handoff, read_report, WorkerReport};
use checkpoint::{CheckpointIo, LocalCheckpointIo};
use runtime_core::{Error, Result};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How the coordinator waits for its workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    /// Give up and kill the workers after this long; `None` waits indefinitely
    pub timeout: Option<Duration>,

    /// Delay between liveness polls
    pub poll_interval: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitState {
    Code(i32),
    Signal(i32),
}

impl ExitState {
    pub(crate) fn success(&self) -> bool {
        matches!(self, ExitState::Code(0))
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Code(code) => write!(f, "exit code {}", code),
            ExitState::Signal(signal) => write!(f, "killed by signal {}", signal),
        }
    }
}

/// A running worker process the join loop can poll and kill
pub(crate) trait WorkerProcess {
    fn process_idx(&self) -> usize;

    /// Non-blocking check; `Some` once the process has exited
    fn try_wait(&mut self) -> Result<Option<ExitState>>;

    /// Kill the process and reap it
    fn terminate(&mut self);
}

/// Block until every worker exits, then return the output of process 0.
///
/// The first failed worker terminates the rest. Report and handoff files are
/// removed on every path. When the launch fails, every temporary checkpoint a
/// worker announced or reported is removed too, including one whose writer
/// was killed mid-save.
pub(crate) fn join_workers<P: WorkerProcess>(
    job: &ProcessJob,
    mut pending: Vec<P>,
) -> Result<Option<SpawnOutput>> {
    let nprocs = pending.len();
    let result = wait_all(job, &mut pending).and_then(|()| read_output(job));

    if result.is_err() {
        discard_output(job, nprocs);
    }
    for idx in 0..nprocs {
        let _ = std::fs::remove_file(job.report_path(idx));
        let _ = std::fs::remove_file(job.handoff_path(idx));
    }
    result
}

fn wait_all<P: WorkerProcess>(job: &ProcessJob, pending: &mut Vec<P>) -> Result<()> {
    let deadline = job.join.timeout.map(|timeout| Instant::now() + timeout);

    while !pending.is_empty() {
        let mut i = 0;
        while i < pending.len() {
            let exit = match pending[i].try_wait() {
                Ok(exit) => exit,
                Err(e) => {
                    terminate_all(pending);
                    return Err(e);
                }
            };

            match exit {
                Some(exit) => {
                    let worker = pending.swap_remove(i);
                    let idx = worker.process_idx();
                    debug!(process_idx = idx, %exit, "Worker exited");
                    if !exit.success() {
                        terminate_all(pending);
                        return Err(worker_failure(job, idx, exit));
                    }
                }
                None => i += 1,
            }
        }

        if pending.is_empty() {
            break;
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                warn!(
                    launch_id = %job.launch_id,
                    remaining = pending.len(),
                    "Join timeout reached, terminating workers"
                );
                terminate_all(pending);
                return Err(Error::Timeout {
                    operation: "join worker processes".to_string(),
                    timeout_ms: job.join.timeout.map(millis).unwrap_or(0),
                });
            }
        }

        std::thread::sleep(job.join.poll_interval);
    }

    Ok(())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn terminate_all<P: WorkerProcess>(pending: &mut Vec<P>) {
    for mut worker in pending.drain(..) {
        warn!(process_idx = worker.process_idx(), "Terminating worker");
        worker.terminate();
    }
}

fn worker_failure(job: &ProcessJob, process_idx: usize, exit: ExitState) -> Error {
    let error = match read_report(&job.report_path(process_idx)) {
        Ok(Some(WorkerReport::Failed { message })) => Error::WorkerFailed {
            process_idx,
            message,
        },
        Ok(_) => Error::WorkerCrashed {
            process_idx,
            status: exit.to_string(),
        },
        Err(e) => Error::WorkerCrashed {
            process_idx,
            status: format!("{}, unreadable report: {}", exit, e),
        },
    };
    error!(launch_id = %job.launch_id, error = %error, "Worker process failed");
    error
}

fn read_output(job: &ProcessJob) -> Result<Option<SpawnOutput>> {
    match read_report(&job.report_path(0))? {
        Some(WorkerReport::Completed { output }) => Ok(output),
        Some(WorkerReport::Failed { message }) => Err(Error::WorkerFailed {
            process_idx: 0,
            message,
        }),
        None => Err(Error::WorkerCrashed {
            process_idx: 0,
            status: "exit code 0 without a report".to_string(),
        }),
    }
}

/// Remove the temporary checkpoints of a launch that is being abandoned
fn discard_output(job: &ProcessJob, nprocs: usize) {
    let mut paths = Vec::new();
    if let Ok(Some(WorkerReport::Completed { output: Some(output) })) =
        read_report(&job.report_path(0))
    {
        paths.extend(output.weights_path);
    }
    for idx in 0..nprocs {
        match read_handoff(&job.handoff_path(idx)) {
            Ok(Some(path)) => paths.push(path),
            Ok(None) => {}
            Err(e) => warn!(process_idx = idx, error = %e, "Unreadable handoff file"),
        }
    }
    paths.sort();
    paths.dedup();

    let io = LocalCheckpointIo::new(false);
    for path in paths {
        if let Err(e) = io.remove_checkpoint(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary checkpoint");
        }
        if let Err(e) = io.remove_staged(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove staged checkpoint data");
        }
        debug!(path = %path.display(), "Discarded temporary checkpoint of failed launch");
    }
}
