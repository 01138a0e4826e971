//! End-to-end launches with the `fork` start method
//!
//! Forked workers run the worker functions defined here directly, so these
//! tests drive real child processes without re-executing the test binary.
//! They run serially to keep forks away from other test threads.

#![cfg(unix)]

use anyhow::Result;
use checkpoint::is_temp_checkpoint;
use launcher::{
    ClusterEnvironment, DdpSpawnStrategy, InMemoryTrainer, MultiProcessingLauncher, StartMethod,
    Trainer, WorkerContext, WorkerFunction, WorkerReturn,
};
use runtime_core::{
    process_globals, Error, Metrics, RuntimeConfig, StateDict, TrainerFn, TrainerState,
    TrainerStatus,
};
use serde_json::{json, Value};
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn fork_launcher(
    nprocs: usize,
    report_dir: &Path,
    join_timeout: Option<Duration>,
) -> Result<MultiProcessingLauncher<DdpSpawnStrategy>> {
    let cluster = ClusterEnvironment {
        main_address: "127.0.0.1".to_string(),
        main_port: 29531,
        node_rank: 0,
        num_nodes: 1,
    };
    let strategy = Arc::new(DdpSpawnStrategy::new(cluster, nprocs)?);

    let mut config = RuntimeConfig::default();
    config.launcher.report_dir = Some(report_dir.to_path_buf());
    config.launcher.join_timeout = join_timeout;
    config.launcher.poll_interval = Duration::from_millis(5);
    config.checkpoint.sync_on_write = false;

    Ok(MultiProcessingLauncher::new(strategy, StartMethod::Fork)?.with_config(&config))
}

fn temp_checkpoints(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| is_temp_checkpoint(path))
        .collect()
}

fn trainer_for(ctx: &WorkerContext, args: &[Value], fn_: TrainerFn) -> InMemoryTrainer {
    let root = args[0].as_str().unwrap_or_default();
    let mut state = TrainerState::new(fn_);
    state.global_step = 10;
    state.current_epoch = 2;
    state.status = TrainerStatus::Finished;

    let mut trainer = InMemoryTrainer::new(root, state);
    let mut weights = StateDict::new();
    weights.insert("w".to_string(), vec![ctx.global_rank as f32 + 1.0; 3]);
    trainer.weights = weights;
    trainer.metrics.insert("loss".to_string(), 0.5);
    trainer
}

fn fit(ctx: &WorkerContext, args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    let trainer = trainer_for(ctx, &args, TrainerFn::Fitting);
    Ok(WorkerReturn::with_trainer(
        Box::new(trainer),
        json!({ "rank": ctx.global_rank }),
    ))
}

fn validate(ctx: &WorkerContext, args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    let trainer = trainer_for(ctx, &args, TrainerFn::Validating);
    Ok(WorkerReturn::with_trainer(Box::new(trainer), json!("validated")))
}

fn fail_on_rank_one(ctx: &WorkerContext, _args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    if ctx.global_rank == 1 {
        return Err(Error::Internal {
            message: "rank 1 diverged".to_string(),
        });
    }
    Ok(WorkerReturn::value(Value::Null))
}

/// Rank zero is still gathering metrics, after its checkpoint is on disk,
/// when rank one fails
struct SlowMetricsTrainer(InMemoryTrainer);

impl Trainer for SlowMetricsTrainer {
    fn state(&self) -> TrainerState {
        self.0.state()
    }

    fn set_state(&mut self, state: TrainerState) {
        self.0.set_state(state)
    }

    fn default_root_dir(&self) -> &Path {
        self.0.default_root_dir()
    }

    fn state_dict(&self) -> runtime_core::Result<StateDict> {
        self.0.state_dict()
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> runtime_core::Result<()> {
        self.0.load_state_dict(state_dict)
    }

    fn callback_metrics(&self) -> Metrics {
        std::thread::sleep(Duration::from_secs(2));
        self.0.callback_metrics()
    }
}

fn fit_then_fail_on_rank_one(
    ctx: &WorkerContext,
    args: Vec<Value>,
) -> runtime_core::Result<WorkerReturn> {
    if ctx.global_rank == 1 {
        std::thread::sleep(Duration::from_millis(500));
        return Err(Error::Internal {
            message: "rank 1 diverged".to_string(),
        });
    }
    let trainer = SlowMetricsTrainer(trainer_for(ctx, &args, TrainerFn::Fitting));
    Ok(WorkerReturn::with_trainer(Box::new(trainer), Value::Null))
}

fn panics(_ctx: &WorkerContext, _args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    panic!("boom");
}

fn hangs(_ctx: &WorkerContext, _args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    std::thread::sleep(Duration::from_secs(30));
    Ok(WorkerReturn::value(Value::Null))
}

fn report_env(ctx: &WorkerContext, _args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    let var = |name: &str| std::env::var(name).unwrap_or_default();
    Ok(WorkerReturn::value(json!({
        "RANK": var("RANK"),
        "LOCAL_RANK": var("LOCAL_RANK"),
        "WORLD_SIZE": var("WORLD_SIZE"),
        "MASTER_ADDR": var("MASTER_ADDR"),
        "MASTER_PORT": var("MASTER_PORT"),
        "ctx_rank": ctx.global_rank,
    })))
}

fn report_globals(_ctx: &WorkerContext, args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    let flags = process_globals();
    Ok(WorkerReturn::value(json!({
        "seed": flags.initial_seed(),
        "deterministic": flags.are_deterministic_algorithms_enabled(),
        "num_args": args.len(),
    })))
}

#[test]
#[serial]
fn test_fit_weights_recovered_and_temp_checkpoint_removed() -> Result<()> {
    let reports = tempdir()?;
    let root = tempdir()?;

    let output = fork_launcher(2, reports.path(), None)?.launch(
        WorkerFunction::new("fit", fit),
        vec![json!(root.path().display().to_string())],
    )?;

    let mut expected = StateDict::new();
    expected.insert("w".to_string(), vec![1.0; 3]);
    assert_eq!(output.weights, Some(expected));
    assert_eq!(output.trainer_results, json!({ "rank": 0 }));
    let state = output.trainer_state.as_ref().unwrap();
    assert_eq!(state.global_step, 10);
    assert_eq!(state.status, TrainerStatus::Finished);
    assert_eq!(output.extra.get("loss"), Some(&0.5));
    assert!(output.cleanup_warnings.is_empty());

    assert!(temp_checkpoints(root.path()).is_empty());
    assert_eq!(std::fs::read_dir(reports.path())?.count(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_recover_into_coordinator_trainer() -> Result<()> {
    let reports = tempdir()?;
    let root = tempdir()?;
    let mut trainer = InMemoryTrainer::new(root.path(), TrainerState::new(TrainerFn::Fitting));

    let results = fork_launcher(1, reports.path(), None)?.launch_with_trainer(
        WorkerFunction::new("fit", fit),
        vec![json!(root.path().display().to_string())],
        &mut trainer,
    )?;

    assert_eq!(results, json!({ "rank": 0 }));
    assert_eq!(trainer.weights.get("w"), Some(&vec![1.0; 3]));
    assert_eq!(trainer.state.current_epoch, 2);
    assert_eq!(trainer.metrics.get("loss"), Some(&0.5));
    Ok(())
}

#[test]
#[serial]
fn test_validation_run_writes_no_checkpoint() -> Result<()> {
    let reports = tempdir()?;
    let root = tempdir()?;

    let output = fork_launcher(2, reports.path(), None)?.launch(
        WorkerFunction::new("validate", validate),
        vec![json!(root.path().display().to_string())],
    )?;

    assert!(output.weights.is_none());
    assert_eq!(output.trainer_results, json!("validated"));
    assert!(temp_checkpoints(root.path()).is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_sequential_launches_do_not_collide() -> Result<()> {
    let reports = tempdir()?;
    let root = tempdir()?;
    let args = vec![json!(root.path().display().to_string())];

    for _ in 0..2 {
        let output =
            fork_launcher(2, reports.path(), None)?.launch(WorkerFunction::new("fit", fit), args.clone())?;
        assert!(output.weights.is_some());
        assert!(temp_checkpoints(root.path()).is_empty());
    }
    Ok(())
}

#[test]
#[serial]
fn test_worker_error_fails_launch() -> Result<()> {
    let reports = tempdir()?;

    let result = fork_launcher(2, reports.path(), None)?
        .launch(WorkerFunction::new("fail_on_rank_one", fail_on_rank_one), vec![]);

    match result {
        Err(Error::WorkerFailed {
            process_idx,
            message,
        }) => {
            assert_eq!(process_idx, 1);
            assert!(message.contains("rank 1 diverged"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    Ok(())
}

#[test]
#[serial]
fn test_failed_launch_removes_checkpoint_of_unreported_rank_zero() -> Result<()> {
    let reports = tempdir()?;
    let root = tempdir()?;

    let result = fork_launcher(2, reports.path(), None)?.launch(
        WorkerFunction::new("fit_then_fail_on_rank_one", fit_then_fail_on_rank_one),
        vec![json!(root.path().display().to_string())],
    );

    assert!(matches!(result, Err(Error::WorkerFailed { process_idx: 1, .. })));
    let leftovers: Vec<_> = std::fs::read_dir(root.path())?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
    Ok(())
}

#[test]
#[serial]
fn test_worker_panic_fails_launch() -> Result<()> {
    let reports = tempdir()?;

    let result = fork_launcher(1, reports.path(), None)?
        .launch(WorkerFunction::new("panics", panics), vec![]);

    match result {
        Err(Error::WorkerFailed { message, .. }) => assert!(message.contains("boom")),
        other => panic!("unexpected result: {:?}", other),
    }
    Ok(())
}

#[test]
#[serial]
fn test_join_timeout_kills_workers() -> Result<()> {
    let reports = tempdir()?;

    let started = std::time::Instant::now();
    let result = fork_launcher(2, reports.path(), Some(Duration::from_millis(200)))?
        .launch(WorkerFunction::new("hangs", hangs), vec![]);

    assert!(matches!(result, Err(Error::Timeout { timeout_ms: 200, .. })));
    assert!(started.elapsed() < Duration::from_secs(10));
    Ok(())
}

#[test]
#[serial]
fn test_workers_see_distributed_env() -> Result<()> {
    let reports = tempdir()?;

    let output = fork_launcher(2, reports.path(), None)?
        .launch(WorkerFunction::new("report_env", report_env), vec![])?;

    assert_eq!(
        output.trainer_results,
        json!({
            "RANK": "0",
            "LOCAL_RANK": "0",
            "WORLD_SIZE": "2",
            "MASTER_ADDR": "127.0.0.1",
            "MASTER_PORT": "29531",
            "ctx_rank": 0,
        })
    );
    Ok(())
}

#[test]
#[serial]
fn test_forked_workers_inherit_globals_without_snapshot() -> Result<()> {
    let reports = tempdir()?;
    let flags = process_globals();
    let previous = flags.values();
    flags.manual_seed(7)?;
    flags.use_deterministic_algorithms(true, false)?;

    let output = fork_launcher(1, reports.path(), None)?.launch(
        WorkerFunction::new("report_globals", report_globals),
        vec![json!("a"), json!("b")],
    );
    flags.apply(&previous)?;

    assert_eq!(
        output?.trainer_results,
        json!({ "seed": 7, "deterministic": true, "num_args": 2 })
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_launch_async_refuses_to_fork() -> Result<()> {
    let reports = tempdir()?;
    let root = tempdir()?;

    let result = fork_launcher(2, reports.path(), None)?
        .launch_async(
            WorkerFunction::new("fit", fit),
            vec![json!(root.path().display().to_string())],
        )
        .await;

    assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    assert!(temp_checkpoints(root.path()).is_empty());
    assert_eq!(std::fs::read_dir(reports.path())?.count(), 0);
    Ok(())
}
