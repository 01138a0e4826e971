//! End-to-end launches with the `spawn` start method
//!
//! Spawned workers re-execute this test binary, so it runs without the
//! libtest harness and hands control to the worker hook before anything else.

use anyhow::{ensure, Context, Result};
use checkpoint::is_temp_checkpoint;
use launcher::{
    run_if_worker, ClusterEnvironment, DdpSpawnStrategy, FunctionRegistry, InMemoryTrainer,
    JoinPolicy, MultiProcessingLauncher, StartMethod, WorkerContext, WorkerFunction, WorkerReturn,
};
use runtime_core::{process_globals, Error, RuntimeConfig, StateDict, TrainerFn, TrainerState};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const FIT: WorkerFunction = WorkerFunction::new("fit", fit);
const REPORT_GLOBALS: WorkerFunction = WorkerFunction::new("report_globals", report_globals);

fn fit(ctx: &WorkerContext, args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    let root = args.first().and_then(Value::as_str).unwrap_or_default();
    let mut trainer = InMemoryTrainer::new(root, TrainerState::new(TrainerFn::Fitting));
    let mut weights = StateDict::new();
    weights.insert("w".to_string(), vec![ctx.global_rank as f32 + 0.5; 2]);
    trainer.weights = weights;
    Ok(WorkerReturn::with_trainer(Box::new(trainer), json!({ "rank": ctx.global_rank })))
}

fn report_globals(_ctx: &WorkerContext, args: Vec<Value>) -> runtime_core::Result<WorkerReturn> {
    let flags = process_globals();
    Ok(WorkerReturn::value(json!({
        "seed": flags.initial_seed(),
        "deterministic": flags.are_deterministic_algorithms_enabled(),
        "warn_only": flags.is_deterministic_warn_only(),
        "autotune": flags.autotune(),
        "first_draw": flags.next_u64(),
        "num_args": args.len(),
    })))
}

fn spawn_launcher(
    nprocs: usize,
    report_dir: &Path,
) -> Result<MultiProcessingLauncher<DdpSpawnStrategy>> {
    let strategy = Arc::new(DdpSpawnStrategy::new(ClusterEnvironment::local()?, nprocs)?);

    let mut config = RuntimeConfig::default();
    config.launcher.report_dir = Some(report_dir.to_path_buf());
    config.checkpoint.sync_on_write = false;

    Ok(MultiProcessingLauncher::new(strategy, StartMethod::Spawn)?
        .with_config(&config)
        .with_join_policy(JoinPolicy {
            timeout: Some(Duration::from_secs(60)),
            poll_interval: Duration::from_millis(10),
        }))
}

fn spawned_workers_restore_global_state() -> Result<()> {
    let reports = tempdir()?;
    let flags = process_globals();
    flags.manual_seed(123)?;
    flags.use_deterministic_algorithms(true, true)?;
    flags.set_autotune(true)?;

    let output = spawn_launcher(2, reports.path())?
        .launch(REPORT_GLOBALS, vec![json!("x"), json!(2)])?;

    // Capturing the snapshot leaves the coordinator's generator untouched
    let expected_draw = flags.next_u64();
    ensure!(
        output.trainer_results
            == json!({
                "seed": 123,
                "deterministic": true,
                "warn_only": true,
                "autotune": true,
                "first_draw": expected_draw,
                "num_args": 2,
            }),
        "unexpected worker globals: {}",
        output.trainer_results
    );
    Ok(())
}

fn spawned_fit_hands_back_weights() -> Result<()> {
    let reports = tempdir()?;
    let root = tempdir()?;

    let output = spawn_launcher(2, reports.path())?
        .launch(FIT, vec![json!(root.path().display().to_string())])?;

    let weights = output.weights.context("fitting run returned no weights")?;
    ensure!(weights.get("w") == Some(&vec![0.5; 2]), "unexpected weights: {:?}", weights);
    ensure!(output.trainer_results == json!({ "rank": 0 }));

    let leftovers = std::fs::read_dir(root.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_temp_checkpoint(&entry.path()))
        .count();
    ensure!(leftovers == 0, "{} temporary checkpoints left behind", leftovers);
    ensure!(std::fs::read_dir(reports.path())?.count() == 0, "launch files left behind");
    Ok(())
}

fn spawn_launch_from_async_runtime() -> Result<()> {
    let reports = tempdir()?;
    let root = tempdir()?;
    let launcher = spawn_launcher(1, reports.path())?;

    let runtime = tokio::runtime::Runtime::new()?;
    let output = runtime.block_on(
        launcher.launch_async(FIT, vec![json!(root.path().display().to_string())]),
    )?;

    ensure!(output.weights.map(|w| w.len()) == Some(1), "fitting run returned no weights");
    ensure!(
        std::fs::read_dir(root.path())?.count() == 0,
        "temporary checkpoint left behind"
    );
    Ok(())
}

fn unregistered_function_fails_launch() -> Result<()> {
    let reports = tempdir()?;

    let result = spawn_launcher(1, reports.path())?
        .launch(WorkerFunction::new("not_registered", fit), vec![]);

    match result {
        Err(Error::WorkerFailed { message, .. }) => {
            ensure!(message.contains("not_registered"), "unexpected message: {}", message);
            Ok(())
        }
        other => anyhow::bail!("unexpected result: {:?}", other),
    }
}

fn main() {
    let registry = FunctionRegistry::new().with(FIT).with(REPORT_GLOBALS);
    if let Some(code) = run_if_worker(&registry) {
        std::process::exit(code);
    }

    let tests: [(&str, fn() -> Result<()>); 4] = [
        ("spawned_workers_restore_global_state", spawned_workers_restore_global_state),
        ("spawned_fit_hands_back_weights", spawned_fit_hands_back_weights),
        ("spawn_launch_from_async_runtime", spawn_launch_from_async_runtime),
        ("unregistered_function_fails_launch", unregistered_function_fails_launch),
    ];

    let mut failed = 0;
    for (name, test) in tests {
        match test() {
            Ok(()) => println!("test {} ... ok", name),
            Err(e) => {
                println!("test {} ... FAILED: {:#}", name, e);
                failed += 1;
            }
        }
    }

    println!("\n{} passed; {} failed", tests.len() - failed, failed);
    if failed > 0 {
        std::process::exit(1);
    }
}
