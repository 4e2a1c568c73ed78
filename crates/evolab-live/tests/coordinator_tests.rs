//! Coordinator scenarios over concurrent sessions.

#![allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::arithmetic_side_effects
)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use evolab_core::{
    PluginContext, PluginError, PluginRegistration, PluginRegistry, RuntimeConfig, RuntimeOverrides,
    Simulation, StepUnit,
};
use evolab_live::ExperimentCoordinator;
use evolab_plugins::register_builtin;
use evolab_types::{ExperimentId, ExperimentStatus, MetricRow};

const WANDER_YAML: &str = "
simulation: wander
params:
  world_size: 20
  num_agents: 6
evolution:
  population_size: 6
  mutation_rate: 0.05
  crossover_rate: 0.5
  elite_fraction: 0.1
  random_seed: 1
logging:
  log_interval: 1
  checkpoint_interval: 2
  experiment_name: coordinator-test
";

/// Fails on its fourth step.
struct Flaky {
    steps: u64,
}

impl Simulation for Flaky {
    fn reset(&mut self) -> Result<(), PluginError> {
        self.steps = 0;
        Ok(())
    }

    fn step(&mut self) -> Result<(), PluginError> {
        if self.steps >= 3 {
            return Err(PluginError::Failed {
                reason: "flaky plugin gave out".to_owned(),
            });
        }
        self.steps += 1;
        Ok(())
    }

    fn metrics(&self) -> MetricRow {
        MetricRow::from([("step_count".to_owned(), f64::from(u32::try_from(self.steps).unwrap()))])
    }

    fn render_state(&self) -> Value {
        json!({})
    }

    fn close(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[allow(clippy::unnecessary_wraps)]
fn build_flaky(_ctx: PluginContext) -> Result<Box<dyn Simulation>, PluginError> {
    Ok(Box::new(Flaky { steps: 0 }))
}

fn registry() -> Arc<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    register_builtin(&mut registry).unwrap();
    registry
        .register(PluginRegistration {
            name: "flaky",
            unit: StepUnit::Generation,
            factory: build_flaky,
            render_adapter: None,
        })
        .unwrap();
    Arc::new(registry)
}

struct Fixture {
    dir: PathBuf,
    config_path: PathBuf,
    coordinator: ExperimentCoordinator,
}

impl Fixture {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("evolab-coordinator-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("wander.yaml");
        std::fs::write(&config_path, WANDER_YAML).unwrap();
        let coordinator = ExperimentCoordinator::new(dir.join("experiments"), registry())
            .unwrap()
            .with_base_delay(Duration::from_millis(1));
        Self {
            dir,
            config_path,
            coordinator,
        }
    }

    fn start_wander(&self, seed: u64, mutation_rate: f64, steps: u64) -> ExperimentId {
        let overrides = RuntimeOverrides {
            random_seed: Some(seed),
            mutation_rate: Some(mutation_rate),
            ..RuntimeOverrides::default()
        };
        self.coordinator
            .start_plugin_experiment(&self.config_path, steps, 1.0, &overrides)
            .unwrap()
    }

    fn wait_for(&self, id: &ExperimentId, status: ExperimentStatus) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.coordinator.status(id) != Some(status) {
            assert!(Instant::now() < deadline, "{id} never reached {status}");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.coordinator.stop_all();
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

fn dummy_config(seed: u64, mutation_rate: f64, simulation: &str) -> RuntimeConfig {
    RuntimeConfig::parse(&format!(
        "
simulation: {simulation}
params: {{}}
evolution:
  population_size: 3
  mutation_rate: {mutation_rate}
  crossover_rate: 0.0
  elite_fraction: 0.0
  random_seed: {seed}
logging:
  log_interval: 1
  checkpoint_interval: 0
  experiment_name: leaderboard
"
    ))
    .unwrap()
}

fn step_counts(history: &[MetricRow]) -> Vec<f64> {
    history.iter().map(|row| row["step_count"]).collect()
}

#[test]
fn concurrent_sessions_stay_isolated() {
    let fx = Fixture::new();
    let a = fx.start_wander(11, 0.01, 40);
    let b = fx.start_wander(22, 0.02, 40);
    let c = fx.start_wander(33, 0.03, 1_000_000);

    fx.coordinator.stop_experiment(&c);
    fx.wait_for(&c, ExperimentStatus::Stopped);
    fx.wait_for(&a, ExperimentStatus::Completed);
    fx.wait_for(&b, ExperimentStatus::Completed);

    let expected: Vec<f64> = (1..=40).map(f64::from).collect();
    let history_a = fx.coordinator.get_metrics_history(&a);
    let history_b = fx.coordinator.get_metrics_history(&b);
    assert_eq!(step_counts(&history_a), expected);
    assert_eq!(step_counts(&history_b), expected);
    assert_ne!(history_a, history_b);
    assert!(fx.coordinator.get_metrics_history(&c).len() < 1_000_000);

    let listing = fx.coordinator.list_experiments();
    let ids: Vec<&ExperimentId> = listing.iter().map(|row| &row.experiment_id).collect();
    assert_eq!(ids, vec![&a, &b, &c]);
    assert_eq!(listing[1].mutation_rate, 0.02);
    assert_eq!(listing[1].seed, 22);
    assert!(fx.coordinator.get_render_state(&a).is_some());
}

#[test]
fn pause_step_resume_through_coordinator() {
    let fx = Fixture::new();
    let id = fx.start_wander(5, 0.05, 200);
    thread::sleep(Duration::from_millis(20));
    fx.coordinator.pause_experiment(&id);
    assert!(fx.coordinator.is_experiment_paused(&id));
    thread::sleep(Duration::from_millis(80));

    let before = fx.coordinator.get_metrics_history(&id).len();
    assert!(fx.coordinator.step_experiment(&id, Duration::from_secs(2)));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(fx.coordinator.get_metrics_history(&id).len(), before + 1);
    assert_eq!(fx.coordinator.status(&id), Some(ExperimentStatus::Paused));

    fx.coordinator.set_experiment_speed(&id, 10.0);
    fx.coordinator.resume_experiment(&id);
    assert!(!fx.coordinator.is_experiment_paused(&id));
    fx.wait_for(&id, ExperimentStatus::Completed);
    assert_eq!(fx.coordinator.get_metrics_history(&id).len(), 200);
    assert!(!fx.coordinator.step_experiment(&id, Duration::from_millis(50)));
}

#[test]
fn paused_status_survives_units_in_flight() {
    let fx = Fixture::new();
    let id = fx.start_wander(9, 0.05, 1_000_000);
    thread::sleep(Duration::from_millis(10));
    for _ in 0..20 {
        fx.coordinator.pause_experiment(&id);
        thread::sleep(Duration::from_millis(15));
        assert_eq!(fx.coordinator.status(&id), Some(ExperimentStatus::Paused));
        assert_eq!(fx.coordinator.list_experiments()[0].status, ExperimentStatus::Paused);
        fx.coordinator.resume_experiment(&id);
        thread::sleep(Duration::from_millis(3));
    }
    fx.coordinator.stop_experiment(&id);
    fx.wait_for(&id, ExperimentStatus::Stopped);
}

#[test]
fn leaderboard_ranks_by_metric_descending() {
    let fx = Fixture::new();
    let ids: Vec<ExperimentId> = [(1, 0.1), (2, 0.2), (3, 0.3), (4, 0.4)]
        .into_iter()
        .map(|(seed, rate)| {
            fx.coordinator
                .start_experiment(dummy_config(seed, rate, "dummy_evolution"), 6, 1.0)
                .unwrap()
        })
        .collect();
    for id in &ids {
        fx.wait_for(id, ExperimentStatus::Completed);
        assert_eq!(fx.coordinator.get_metrics_history(id).len(), 6);
    }

    let board = fx.coordinator.leaderboard("max_fitness", None, None);
    assert_eq!(board.len(), 4);
    for pair in board.windows(2) {
        assert!(pair[0].metric("max_fitness") >= pair[1].metric("max_fitness"));
    }

    let filtered = fx.coordinator.leaderboard("max_fitness", Some("dummy_evolution"), Some((0.15, 0.35)));
    assert_eq!(filtered.len(), 2);
    assert!(fx.coordinator.leaderboard("max_fitness", Some("wander"), None).is_empty());

    let overlay = fx.coordinator.comparison(&ids, &[]);
    assert_eq!(overlay.keys, ["mean_fitness", "max_fitness", "diversity", "mutation_stats"]);
    assert_eq!(overlay.runs.len(), 4);
    assert_eq!(overlay.stats["mean_fitness"].mean.len(), 6);
    let pooled = fx
        .coordinator
        .comparison_async(&ids, Vec::new())
        .blocking_recv()
        .unwrap();
    assert_eq!(pooled, overlay);
}

#[test]
fn delete_removes_artifacts() {
    let fx = Fixture::new();
    let id = fx.start_wander(9, 0.05, 6);
    fx.wait_for(&id, ExperimentStatus::Completed);

    let base = fx.coordinator.base_dir().to_path_buf();
    let runtime = base.join(format!("{id}_runtime.yaml"));
    let log = base.join(format!("{id}_metrics.jsonl"));
    let checkpoints = fx.coordinator.checkpoint_dir(&id).unwrap();
    assert!(runtime.exists());
    assert!(log.exists());
    assert!(has_checkpoint(&checkpoints, 6));

    assert!(fx.coordinator.delete_experiment(&id, true));
    assert!(!runtime.exists());
    assert!(!log.exists());
    assert!(!checkpoints.exists());
    assert!(fx.coordinator.list_experiments().is_empty());
    assert!(!fx.coordinator.delete_experiment(&id, true));
}

fn has_checkpoint(dir: &Path, step: u64) -> bool {
    dir.join("checkpoints")
        .join("shard_000000")
        .join(format!("gen_{step:08}.chk"))
        .exists()
}

#[test]
fn failing_plugin_marks_experiment_failed() {
    let fx = Fixture::new();
    let id = fx
        .coordinator
        .start_experiment(dummy_config(1, 0.1, "flaky"), 10, 1.0)
        .unwrap();
    fx.wait_for(&id, ExperimentStatus::Failed);

    let error = fx.coordinator.last_error(&id).unwrap();
    assert!(error.contains("flaky plugin gave out"), "{error}");
    let row = fx
        .coordinator
        .list_experiments()
        .into_iter()
        .find(|row| row.experiment_id == id)
        .unwrap();
    assert_eq!(row.status, ExperimentStatus::Failed);
    assert_eq!(row.error, error);
    assert_eq!(fx.coordinator.get_metrics_history(&id).len(), 3);
}

#[test]
fn unknown_plugin_is_rejected_at_start() {
    let fx = Fixture::new();
    let err = fx
        .coordinator
        .start_experiment(dummy_config(1, 0.1, "missing"), 3, 1.0)
        .unwrap_err();
    assert!(err.to_string().contains("available"), "{err}");
    assert!(fx.coordinator.list_experiments().is_empty());
}
