//! Multiprocessing launcher

use crate::backend::{JoinPolicy, OsProcessBackend, ProcessBackend, ProcessJob, WorkerEnv};
use crate::output::{consume_spawn_output, LaunchOutput};
use crate::snapshot::GlobalStateSnapshot;
use crate::start_method::StartMethod;
use crate::strategy::Strategy;
use crate::trainer::Trainer;
use crate::worker::{WorkerArg, WorkerFunction};
use checkpoint::LocalCheckpointIo;
use runtime_core::{Error, Result, RuntimeConfig};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, info_span};
use uuid::Uuid;

/// Progress of a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchPhase {
    Validated,
    Launched,
    Collecting,
    Done,
}

impl fmt::Display for LaunchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LaunchPhase::Validated => "validated",
            LaunchPhase::Launched => "launched",
            LaunchPhase::Collecting => "collecting",
            LaunchPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Starts one worker process per local device and collects the rank-zero
/// result back into the calling process.
///
/// A launcher is validated on construction and consumed by `launch`, so each
/// instance drives exactly one run.
pub struct MultiProcessingLauncher<S: Strategy, B: ProcessBackend = OsProcessBackend> {
    strategy: Arc<S>,
    start_method: StartMethod,
    backend: B,
    join: JoinPolicy,
    report_dir: PathBuf,
    checkpoint_io: LocalCheckpointIo,
    sync_on_write: bool,
}

impl<S: Strategy> MultiProcessingLauncher<S, OsProcessBackend> {
    /// Launcher over real OS processes
    pub fn new(strategy: Arc<S>, start_method: StartMethod) -> Result<Self> {
        Self::with_backend(strategy, start_method, OsProcessBackend::new())
    }

    /// Launcher over real OS processes configured from `config`
    pub fn from_config(strategy: Arc<S>, config: &RuntimeConfig) -> Result<Self> {
        let start_method = config.launcher.start_method.parse()?;
        let backend = match &config.launcher.worker_program {
            Some(program) => OsProcessBackend::with_worker_program(program),
            None => OsProcessBackend::new(),
        };
        Ok(Self::with_backend(strategy, start_method, backend)?.with_config(config))
    }
}

impl<S: Strategy, B: ProcessBackend> MultiProcessingLauncher<S, B> {
    /// Create a launcher, rejecting start methods the backend cannot honour
    /// before any process exists
    pub fn with_backend(strategy: Arc<S>, start_method: StartMethod, backend: B) -> Result<Self> {
        backend.supported_start_methods().validate(start_method)?;
        debug!(start_method = %start_method, phase = %LaunchPhase::Validated, "Launcher validated");

        Ok(Self {
            strategy,
            start_method,
            backend,
            join: JoinPolicy::default(),
            report_dir: std::env::temp_dir(),
            checkpoint_io: LocalCheckpointIo::default(),
            sync_on_write: true,
        })
    }

    /// Apply join, report directory and checkpoint settings
    pub fn with_config(mut self, config: &RuntimeConfig) -> Self {
        self.join = JoinPolicy {
            timeout: config.launcher.join_timeout,
            poll_interval: config.launcher.poll_interval,
        };
        self.report_dir = config.launcher.report_dir();
        self.sync_on_write = config.checkpoint.sync_on_write;
        self.checkpoint_io = LocalCheckpointIo::new(config.checkpoint.sync_on_write);
        self
    }

    pub fn with_join_policy(mut self, join: JoinPolicy) -> Self {
        self.join = join;
        self
    }

    pub fn start_method(&self) -> StartMethod {
        self.start_method
    }

    pub fn strategy(&self) -> &Arc<S> {
        &self.strategy
    }

    /// Whether the launcher can run from an interactive session, where the
    /// worker function only exists in the coordinator's memory
    pub fn is_interactive_compatible(&self) -> bool {
        self.start_method == StartMethod::Fork
    }

    /// Start the workers, block until all exit, and return the consumed
    /// rank-zero output.
    ///
    /// With `spawn`, a snapshot of the coordinator's global flags is appended
    /// to `args`; with `fork` the workers inherit them and `args` is shipped
    /// as is. Any temporary weights checkpoint is loaded and deleted before
    /// this returns.
    pub fn launch(self, function: WorkerFunction, args: Vec<Value>) -> Result<LaunchOutput> {
        let launch_id = Uuid::new_v4().simple().to_string();
        let span = info_span!("launch", %launch_id, start_method = %self.start_method);
        let _guard = span.enter();

        let nprocs = self.strategy.num_processes();
        if nprocs == 0 {
            return Err(Error::InvalidConfig {
                message: "strategy requested zero worker processes".to_string(),
            });
        }

        let mut worker_args: Vec<WorkerArg> = args.into_iter().map(WorkerArg::Value).collect();
        if !self.start_method.inherits_parent_state() {
            worker_args.push(WorkerArg::GlobalStates(GlobalStateSnapshot::capture()));
        }

        let job = ProcessJob {
            launch_id: launch_id.clone(),
            function,
            args: worker_args,
            env: WorkerEnv {
                node_rank: self.strategy.node_rank(),
                num_processes: nprocs,
                world_size: self.strategy.world_size(),
                main_address: self.strategy.main_address(),
                main_port: self.strategy.main_port(),
                global_ranks: (0..nprocs).map(|local| self.strategy.global_rank(local)).collect(),
            },
            report_dir: self.report_dir.clone(),
            sync_on_write: self.sync_on_write,
            join: self.join,
        };

        info!(
            function = function.name(),
            nprocs,
            world_size = job.env.world_size,
            phase = %LaunchPhase::Launched,
            "Launching workers"
        );
        let output = self
            .backend
            .start_processes(job, nprocs, self.start_method)?
            .ok_or_else(|| Error::Internal {
                message: "process 0 returned no output".to_string(),
            })?;

        debug!(phase = %LaunchPhase::Collecting, "Consuming rank zero output");
        let launched = consume_spawn_output(output, &self.checkpoint_io)?;

        info!(
            phase = %LaunchPhase::Done,
            recovered_weights = launched.weights.is_some(),
            "Launch complete"
        );
        Ok(launched)
    }

    /// Launch, then write the worker's run back into `trainer`, returning the
    /// worker function's results
    pub fn launch_with_trainer(
        self,
        function: WorkerFunction,
        args: Vec<Value>,
        trainer: &mut dyn Trainer,
    ) -> Result<Value> {
        self.launch(function, args)?.recover_into(trainer)
    }

    /// [`launch`](Self::launch) on tokio's blocking pool, for coordinators
    /// running inside an async runtime.
    ///
    /// Only `spawn` is accepted here. Forking from a runtime thread would copy
    /// the runtime's locks into the children in whatever state the other
    /// runtime threads left them, so a `fork` launcher must call
    /// [`launch`](Self::launch) from a plain thread instead.
    pub async fn launch_async(
        self,
        function: WorkerFunction,
        args: Vec<Value>,
    ) -> Result<LaunchOutput>
    where
        S: 'static,
        B: 'static,
    {
        if self.start_method.inherits_parent_state() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "start method '{}' cannot launch from an async runtime, call launch() from a plain thread",
                    self.start_method
                ),
            });
        }
        tokio::task::spawn_blocking(move || self.launch(function, args))
            .await
            .map_err(|e| Error::Internal {
                message: format!("Launch task failed: {}", e),
            })?
    }
}
