//! `fork` start method: workers are copies of the coordinator
//!
//! Children inherit the coordinator's memory, including its global flags, so
//! the job's argument list carries no snapshot. A child runs the wrapping
//! function directly and leaves with `_exit` so it never unwinds into the
//! coordinator's stack or runs its destructors.
//!
//! Forking a multi-threaded coordinator only carries the calling thread into
//! the child; worker functions must not rely on other threads of the parent.

use super::join::{join_workers, ExitState, WorkerProcess};
use super::ProcessJob;
use crate::output::SpawnOutput;
use crate::worker::execute_worker;
use runtime_core::{Error, Result};
use tracing::{debug, warn};

/// A forked child, identified by pid
pub(crate) struct ForkedWorker {
    pid: libc::pid_t,
    process_idx: usize,
}

impl WorkerProcess for ForkedWorker {
    fn process_idx(&self) -> usize {
        self.process_idx
    }

    fn try_wait(&mut self) -> Result<Option<ExitState>> {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        match rc {
            0 => Ok(None),
            -1 => Err(Error::Io(std::io::Error::last_os_error())),
            _ => Ok(Some(decode_status(status))),
        }
    }

    fn terminate(&mut self) {
        let mut status: libc::c_int = 0;
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
            libc::waitpid(self.pid, &mut status, 0);
        }
    }
}

fn decode_status(status: libc::c_int) -> ExitState {
    if libc::WIFEXITED(status) {
        ExitState::Code(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitState::Signal(libc::WTERMSIG(status))
    } else {
        ExitState::Code(-1)
    }
}

pub(crate) fn start_processes(job: &ProcessJob, nprocs: usize) -> Result<Option<SpawnOutput>> {
    let mut workers = Vec::with_capacity(nprocs);

    for process_idx in 0..nprocs {
        let ctx = job.context(process_idx);
        let report_path = job.report_path(process_idx);

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                let err = std::io::Error::last_os_error();
                warn!(process_idx, error = %err, "fork failed, terminating started workers");
                for mut worker in workers {
                    ForkedWorker::terminate(&mut worker);
                }
                return Err(Error::Io(err));
            }
            0 => {
                // Child: the process is single-threaded from here on
                for (key, value) in ctx.env_vars() {
                    std::env::set_var(key, value);
                }
                let code = execute_worker(
                    &ctx,
                    job.function.func(),
                    job.args.clone(),
                    job.sync_on_write,
                    &report_path,
                );
                unsafe { libc::_exit(code) }
            }
            pid => {
                debug!(process_idx, pid, "Forked worker");
                workers.push(ForkedWorker { pid, process_idx });
            }
        }
    }

    join_workers(job, workers)
}
