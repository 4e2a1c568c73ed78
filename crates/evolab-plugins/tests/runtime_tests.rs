//! End-to-end runtime tests over the built-in plugins.
//!
//! Covers reproducibility, checkpoint cadence, checkpoint resume, and
//! replay equivalence against live runs.

#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::float_cmp)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evolab_core::{
    BusEvent, CheckpointStore, EventBus, PluginRegistry, ReplayEngine, RuntimeConfig, Simulator,
    SimulatorOptions, Topic,
};
use evolab_plugins::builtin_registry;

fn wander_config(seed: u64, checkpoint_interval: u64) -> RuntimeConfig {
    RuntimeConfig::parse(&format!(
        "
simulation: wander
params:
  world_size: 10
  num_agents: 5
evolution:
  population_size: 5
  mutation_rate: 0.05
  crossover_rate: 0.5
  elite_fraction: 0.1
  random_seed: {seed}
logging:
  log_interval: 1
  checkpoint_interval: {checkpoint_interval}
  experiment_name: wander-test
"
    ))
    .unwrap()
}

fn dummy_config(seed: u64) -> RuntimeConfig {
    RuntimeConfig::parse(&format!(
        "
simulation: dummy_evolution
params:
  num_agents: 2
evolution:
  population_size: 2
  mutation_rate: 0.0
  crossover_rate: 0.0
  elite_fraction: 0.0
  random_seed: {seed}
logging:
  log_interval: 1
  checkpoint_interval: 0
  experiment_name: dummy-test
"
    ))
    .unwrap()
}

fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("evolab-{label}-{}", uuid::Uuid::new_v4()))
}

fn checkpointed_run(registry: &PluginRegistry, dir: &Path, steps: u64) -> Vec<evolab_types::MetricRow> {
    let options = SimulatorOptions {
        experiment_dir: Some(dir.to_path_buf()),
        ..SimulatorOptions::default()
    };
    let mut sim = Simulator::new(wander_config(42, 2), registry, options).unwrap();
    sim.run(steps).unwrap()
}

#[test]
fn identical_config_gives_identical_metrics() {
    let registry = builtin_registry().unwrap();
    let mut a = Simulator::new(wander_config(7, 0), &registry, SimulatorOptions::default()).unwrap();
    let mut b = Simulator::new(wander_config(7, 0), &registry, SimulatorOptions::default()).unwrap();
    let rows = a.run(25).unwrap();
    assert_eq!(rows, b.run(25).unwrap());

    let mut c = Simulator::new(wander_config(8, 0), &registry, SimulatorOptions::default()).unwrap();
    assert_ne!(rows, c.run(25).unwrap());
}

#[test]
fn dummy_evolution_is_reproducible_from_scratch() {
    let registry = builtin_registry().unwrap();
    let run = || {
        let mut sim = Simulator::new(dummy_config(123), &registry, SimulatorOptions::default()).unwrap();
        sim.run(5)
            .unwrap()
            .iter()
            .map(|row| row["mean_fitness"])
            .collect::<Vec<f64>>()
    };
    let first = run();
    assert_eq!(first.len(), 5);
    assert_eq!(first, run());
}

#[test]
fn checkpoints_follow_interval() {
    let registry = builtin_registry().unwrap();
    let dir = temp_dir("cadence");
    checkpointed_run(&registry, &dir, 6);

    let steps: Vec<u64> = CheckpointStore::list_checkpoints(&dir)
        .unwrap()
        .iter()
        .filter_map(|p| CheckpointStore::step_from_path(p))
        .collect();
    assert_eq!(steps, vec![2, 4, 6]);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn last_checkpoint_reproduces_final_metrics() {
    let registry = builtin_registry().unwrap();
    let dir = temp_dir("resume");
    let live = checkpointed_run(&registry, &dir, 6);

    let store = CheckpointStore::new();
    let checkpoint = store
        .load(&CheckpointStore::checkpoint_path(&dir, 6))
        .unwrap();
    assert_eq!(checkpoint.metrics, live[5]);

    let mut resumed = Simulator::new(wander_config(42, 0), &registry, SimulatorOptions::default()).unwrap();
    resumed.restore_from_checkpoint(&checkpoint).unwrap();
    assert_eq!(resumed.step_index(), 6);
    assert_eq!(resumed.last_metrics(), &live[5]);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn resumed_run_continues_like_uninterrupted_run() {
    let registry = builtin_registry().unwrap();
    let dir = temp_dir("continue");
    let _ = checkpointed_run(&registry, &dir, 4);

    let mut full = Simulator::new(wander_config(42, 0), &registry, SimulatorOptions::default()).unwrap();
    let uninterrupted = full.run(8).unwrap();

    let checkpoint = CheckpointStore::new()
        .load(&CheckpointStore::checkpoint_path(&dir, 4))
        .unwrap();
    let mut resumed = Simulator::new(wander_config(42, 0), &registry, SimulatorOptions::default()).unwrap();
    resumed.restore_from_checkpoint(&checkpoint).unwrap();
    for expected in &uninterrupted[4..] {
        assert_eq!(&resumed.advance().unwrap(), expected);
    }
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn replay_matches_live_run() {
    let registry = builtin_registry().unwrap();
    let dir = temp_dir("replay");
    let live = checkpointed_run(&registry, &dir, 12);

    let mut replay = ReplayEngine::new(
        wander_config(42, 2),
        &registry,
        &dir,
        CheckpointStore::new(),
        4,
    )
    .unwrap();

    for target in [12_u64, 3, 9, 1, 11] {
        replay.jump_to_generation(target).unwrap();
        let index = usize::try_from(target).unwrap() - 1;
        assert_eq!(replay.current_metrics(), &live[index], "step {target}");
    }

    replay.jump_to_step(6).unwrap();
    let at_six = replay.render_state();
    replay.step_backward(5).unwrap();
    assert_eq!(replay.current_step(), 1);
    assert_ne!(replay.render_state().agents, at_six.agents);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn bus_receives_lifecycle_and_checkpoint_events() {
    let registry = builtin_registry().unwrap();
    let dir = temp_dir("bus");
    let bus = Arc::new(EventBus::new(2, 64).unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));
    for topic in [
        Topic::RenderState,
        Topic::CheckpointSaved,
        Topic::GenerationEnd,
        Topic::SimulationEnd,
    ] {
        let seen = Arc::clone(&seen);
        bus.subscribe(topic, move |event: &BusEvent| {
            seen.lock().unwrap().push(event.topic());
        });
    }

    let options = SimulatorOptions {
        event_bus: Some(Arc::clone(&bus)),
        experiment_dir: Some(dir.clone()),
        ..SimulatorOptions::default()
    };
    let mut sim = Simulator::new(wander_config(1, 2), &registry, options).unwrap();
    sim.run(4).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)));

    let seen = seen.lock().unwrap();
    let count = |topic: Topic| seen.iter().filter(|t| **t == topic).count();
    assert_eq!(count(Topic::RenderState), 4);
    assert_eq!(count(Topic::CheckpointSaved), 2);
    assert_eq!(count(Topic::GenerationEnd), 1);
    assert_eq!(count(Topic::SimulationEnd), 1);
    drop(seen);
    std::fs::remove_dir_all(&dir).unwrap();
}
