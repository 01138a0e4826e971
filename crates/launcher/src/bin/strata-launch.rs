//! Launcher demo binary
//!
//! Runs a small fitting job across local worker processes and prints what
//! the coordinator recovered. Usage: `strata-launch [NUM_PROCESSES]`.
//! The start method, join timeout and report directory come from the
//! `STRATA_*` environment variables.

use std::sync::Arc;

use launcher::{
    ClusterEnvironment, DdpSpawnStrategy, FunctionRegistry, InMemoryTrainer, MultiProcessingLauncher,
    WorkerContext, WorkerFunction, WorkerReturn,
};
use runtime_core::{
    process_globals, telemetry, Result, RuntimeConfig, StateDict, TrainerFn, TrainerState,
    TrainerStatus,
};
use serde_json::{json, Value};

const FIT: WorkerFunction = WorkerFunction::new("fit", fit);

/// Pretend to train: every rank derives weights from the shared seed
fn fit(ctx: &WorkerContext, args: Vec<Value>) -> Result<WorkerReturn> {
    let root_dir = args
        .first()
        .and_then(Value::as_str)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    let flags = process_globals();
    let mut weights = StateDict::new();
    weights.insert(
        "layer.weight".to_string(),
        (0..4).map(|_| (flags.next_u64() % 1000) as f32 / 1000.0).collect(),
    );

    let mut state = TrainerState::new(TrainerFn::Fitting);
    state.global_step = 100;
    state.current_epoch = 1;
    state.status = TrainerStatus::Finished;

    let mut trainer = InMemoryTrainer::new(root_dir, state);
    trainer.weights = weights;
    trainer.metrics.insert("train_loss".to_string(), 0.25);

    tracing::info!(rank = ctx.global_rank, seed = flags.initial_seed(), "Fit finished");
    Ok(WorkerReturn::with_trainer(
        Box::new(trainer),
        json!({ "rank": ctx.global_rank, "seed": flags.initial_seed() }),
    ))
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = FunctionRegistry::new().with(FIT);
    if let Some(code) = launcher::run_if_worker(&registry) {
        std::process::exit(code);
    }

    let config = RuntimeConfig::from_env()?;
    telemetry::init_tracing(&config.logging.default_filter);

    let num_processes: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 2,
    };

    process_globals().manual_seed(42)?;

    let strategy = Arc::new(DdpSpawnStrategy::new(ClusterEnvironment::from_env()?, num_processes)?);
    let launcher = MultiProcessingLauncher::from_config(strategy, &config)?;
    tracing::info!(start_method = %launcher.start_method(), num_processes, "Starting demo launch");

    let root_dir = std::env::temp_dir();
    let args = vec![json!(root_dir.display().to_string())];

    // Forking has to happen off the async runtime
    let output = if launcher.is_interactive_compatible() {
        launcher.launch(FIT, args)?
    } else {
        tokio::runtime::Runtime::new()?.block_on(launcher.launch_async(FIT, args))?
    };

    println!("results:       {}", output.trainer_results);
    if let Some(state) = &output.trainer_state {
        println!("progress:      step {} epoch {} ({})", state.global_step, state.current_epoch, state.status);
    }
    println!("weights:       {:?}", output.weights);
    println!("metrics:       {:?}", output.extra);
    for warning in &output.cleanup_warnings {
        println!("cleanup:       {}", warning);
    }

    Ok(())
}
