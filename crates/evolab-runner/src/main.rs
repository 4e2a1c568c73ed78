//! Runner binary for Evolab.
//!
//! Loads a runtime config, runs the configured plugin for a fixed number of
//! steps with checkpointing, and then replays to the last checkpoint to
//! confirm the run is reproducible.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration from `EVOLAB_CONFIG` (default `evolab-config.yaml`)
//! 3. Build the plugin registry
//! 4. Start the event bus and subscribe to checkpoint events
//! 5. Run the simulation
//! 6. Replay to the last checkpoint and compare metrics
//! 7. Log the result

mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use evolab_core::replay::DEFAULT_CACHE_SIZE;
use evolab_core::{
    BusEvent, CheckpointStore, EventBus, ReplayEngine, RuntimeConfig, Simulator, SimulatorOptions, Topic,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::RunnerError;

const DEFAULT_CONFIG_PATH: &str = "evolab-config.yaml";
const DEFAULT_STEPS: u64 = 100;
const DEFAULT_EXPERIMENTS_DIR: &str = "experiments";

fn main() -> anyhow::Result<()> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("evolab-runner starting");
    run()?;
    Ok(())
}

fn run() -> Result<(), RunnerError> {
    // 2. Load configuration.
    let config_path = PathBuf::from(env_or("EVOLAB_CONFIG", DEFAULT_CONFIG_PATH));
    let config = RuntimeConfig::from_file(&config_path)?;
    let steps = parse_steps()?;
    let experiment_dir =
        Path::new(&env_or("EVOLAB_EXPERIMENTS_DIR", DEFAULT_EXPERIMENTS_DIR)).join(&config.logging.experiment_name);
    info!(
        config = %config_path.display(),
        simulation = config.simulation,
        seed = config.seed(),
        steps,
        checkpoint_interval = config.checkpoint_interval(),
        experiment_dir = %experiment_dir.display(),
        "Configuration loaded"
    );

    // 3. Build the plugin registry once for the whole process.
    let registry = evolab_plugins::builtin_registry()?;
    info!(plugins = ?registry.names(), "Plugin registry built");

    // 4. Start the event bus.
    let bus = Arc::new(EventBus::new(2, 64)?);
    let saved = Arc::new(AtomicU64::new(0));
    let saved_counter = Arc::clone(&saved);
    bus.subscribe(Topic::CheckpointSaved, move |event| {
        if let BusEvent::CheckpointSaved { path, step_index } = event {
            saved_counter.fetch_add(1, Ordering::Relaxed);
            info!(step_index, path = %path.display(), "Checkpoint saved");
        }
    });

    // 5. Run the simulation.
    let options = SimulatorOptions {
        event_bus: Some(Arc::clone(&bus)),
        experiment_dir: Some(experiment_dir.clone()),
        store: CheckpointStore::new(),
    };
    let mut simulator = Simulator::new(config.clone(), &registry, options)?;
    let rows = simulator.run(steps)?;
    if !bus.wait_idle(Duration::from_secs(5)) {
        warn!("Event bus still busy after run");
    }
    info!(
        steps = rows.len(),
        checkpoints = saved.load(Ordering::Relaxed),
        final_metrics = ?rows.last(),
        "Run finished"
    );

    // 6. Replay to the last checkpoint.
    let mut replay = ReplayEngine::new(config, &registry, &experiment_dir, CheckpointStore::new(), DEFAULT_CACHE_SIZE)?;
    let Some(last_checkpoint) = replay.checkpoint_steps().last().copied() else {
        info!("No checkpoints written, skipping replay check");
        return Ok(());
    };
    replay.jump_to_generation(last_checkpoint)?;
    let live = usize::try_from(last_checkpoint)
        .ok()
        .and_then(|step| step.checked_sub(1))
        .and_then(|index| rows.get(index));

    // 7. Log the result.
    if live == Some(replay.current_metrics()) {
        info!(step_index = last_checkpoint, "Replay matches live run");
    } else {
        warn!(
            step_index = last_checkpoint,
            live = ?live,
            replayed = ?replay.current_metrics(),
            "Replay diverged from live run"
        );
    }
    Ok(())
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn parse_steps() -> Result<u64, RunnerError> {
    match std::env::var("EVOLAB_STEPS") {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|e| RunnerError::Env {
            name: "EVOLAB_STEPS",
            message: e.to_string(),
        }),
        Err(_) => Ok(DEFAULT_STEPS),
    }
}
