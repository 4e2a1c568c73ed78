//! Replay and time-travel over a checkpointed run.
//!
//! A [`ReplayEngine`] reconstructs the state at any step by restoring the
//! nearest checkpoint at or before the target and stepping forward the
//! remainder. Moving backwards works the same way: plugin steps are not
//! invertible, so `step_backward` re-derives the earlier state from a
//! checkpoint plus forward replay instead of undoing steps.
//!
//! Recently visited steps are kept in a small LRU cache of render frames
//! and metrics so scrubbing back and forth over a short window is cheap.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use evolab_types::{MetricRow, RenderState};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::RuntimeConfig;
use crate::registry::PluginRegistry;
use crate::simulator::{Simulator, SimulatorError, SimulatorOptions};

/// Default number of cached steps.
pub const DEFAULT_CACHE_SIZE: usize = 16;

/// Errors raised while replaying.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The hosted simulator failed.
    #[error(transparent)]
    Simulator(#[from] SimulatorError),

    /// A checkpoint could not be listed or loaded.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Cached view of one visited step.
#[derive(Debug, Clone)]
struct CachedStep {
    frame: RenderState,
    metrics: MetricRow,
}

/// Fixed-capacity least-recently-used cache keyed by step index.
#[derive(Debug)]
struct StepCache {
    capacity: usize,
    order: VecDeque<u64>,
    entries: HashMap<u64, CachedStep>,
}

impl StepCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn touch(&mut self, step: u64) {
        if let Some(pos) = self.order.iter().position(|s| *s == step) {
            self.order.remove(pos);
        }
        self.order.push_back(step);
    }

    fn get(&mut self, step: u64) -> Option<&CachedStep> {
        if self.entries.contains_key(&step) {
            self.touch(step);
        }
        self.entries.get(&step)
    }

    fn peek(&self, step: u64) -> Option<&CachedStep> {
        self.entries.get(&step)
    }

    fn put(&mut self, step: u64, entry: CachedStep) {
        self.entries.insert(step, entry);
        self.touch(step);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Reconstructs arbitrary steps of a checkpointed run.
#[derive(Debug)]
pub struct ReplayEngine {
    simulator: Simulator,
    store: CheckpointStore,
    index: Vec<(u64, PathBuf)>,
    cache: StepCache,
    current_step: u64,
    current_metrics: MetricRow,
    /// Step the plugin's live state corresponds to. Differs from
    /// `current_step` after a cache hit moved only the cursor.
    plugin_step: u64,
}

impl ReplayEngine {
    /// Build an engine over the checkpoints under `experiment_dir`.
    pub fn new(
        config: RuntimeConfig,
        registry: &PluginRegistry,
        experiment_dir: &Path,
        store: CheckpointStore,
        cache_size: usize,
    ) -> Result<Self, ReplayError> {
        let mut simulator = Simulator::new(config, registry, SimulatorOptions::default())?;
        simulator.begin()?;
        let index = build_index(&store, experiment_dir)?;
        debug!(
            experiment_dir = %experiment_dir.display(),
            checkpoints = index.len(),
            "replay index built"
        );
        Ok(Self {
            current_metrics: simulator.last_metrics().clone(),
            simulator,
            store,
            index,
            cache: StepCache::new(cache_size),
            current_step: 0,
            plugin_step: 0,
        })
    }

    /// Load a config file and build an engine with default settings.
    pub fn from_config_path(
        config_path: &Path,
        registry: &PluginRegistry,
        experiment_dir: &Path,
    ) -> Result<Self, ReplayError> {
        let config = RuntimeConfig::from_file(config_path).map_err(SimulatorError::from)?;
        Self::new(
            config,
            registry,
            experiment_dir,
            CheckpointStore::new(),
            DEFAULT_CACHE_SIZE,
        )
    }

    /// Restore the checkpoint at `path` and move the cursor to its step.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<(), ReplayError> {
        let checkpoint = self.store.load(path)?;
        self.simulator.begin()?;
        self.simulator.restore_from_checkpoint(&checkpoint)?;
        self.current_step = checkpoint.step_index;
        self.plugin_step = checkpoint.step_index;
        self.current_metrics = checkpoint.metrics;
        self.cache_current();
        Ok(())
    }

    /// Move to `target`, restoring and replaying as needed.
    pub fn jump_to_generation(&mut self, target: u64) -> Result<(), ReplayError> {
        if let Some(hit) = self.cache.get(target) {
            self.current_metrics = hit.metrics.clone();
            self.current_step = target;
            return Ok(());
        }
        self.materialize(target)
    }

    /// Alias of [`jump_to_generation`](Self::jump_to_generation) for
    /// step-based timelines.
    pub fn jump_to_step(&mut self, target: u64) -> Result<(), ReplayError> {
        self.jump_to_generation(target)
    }

    /// Advance `n` steps from the cursor, caching every visited step.
    pub fn step_forward(&mut self, n: u64) -> Result<(), ReplayError> {
        if n == 0 {
            return Ok(());
        }
        if self.plugin_step != self.current_step {
            self.materialize(self.current_step)?;
        }
        for _ in 0..n {
            let metrics = self.simulator.advance()?;
            self.current_step = self.simulator.step_index();
            self.plugin_step = self.current_step;
            self.current_metrics = metrics;
            self.cache_current();
        }
        Ok(())
    }

    /// Move `n` steps back by re-deriving the earlier state.
    pub fn step_backward(&mut self, n: u64) -> Result<(), ReplayError> {
        self.jump_to_generation(self.current_step.saturating_sub(n))
    }

    /// Render frame at the cursor.
    pub fn render_state(&self) -> RenderState {
        if let Some(hit) = self.cache.peek(self.current_step) {
            return hit.frame.clone();
        }
        self.simulator.render_frame()
    }

    /// Metrics at the cursor.
    pub const fn current_metrics(&self) -> &MetricRow {
        &self.current_metrics
    }

    /// Step index of the cursor.
    pub const fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Indexed checkpoint steps, ascending.
    pub fn checkpoint_steps(&self) -> Vec<u64> {
        self.index.iter().map(|(step, _)| *step).collect()
    }

    /// Number of cached steps.
    pub fn cached_steps(&self) -> usize {
        self.cache.len()
    }

    /// Rebuild plugin state at `target` from the nearest checkpoint.
    fn materialize(&mut self, target: u64) -> Result<(), ReplayError> {
        match self.nearest_checkpoint(target).map(Path::to_path_buf) {
            Some(path) => self.load_checkpoint(&path)?,
            None => {
                self.simulator.begin()?;
                self.current_step = 0;
                self.plugin_step = 0;
                self.current_metrics = self.simulator.last_metrics().clone();
            }
        }
        self.step_forward(target.saturating_sub(self.current_step))
    }

    /// Checkpoint with the greatest step at or before `target`.
    fn nearest_checkpoint(&self, target: u64) -> Option<&Path> {
        let upper = self.index.partition_point(|(step, _)| *step <= target);
        let pos = upper.checked_sub(1)?;
        self.index.get(pos).map(|(_, path)| path.as_path())
    }

    fn cache_current(&mut self) {
        let frame = self.simulator.render_frame();
        self.cache.put(
            self.current_step,
            CachedStep {
                frame,
                metrics: self.current_metrics.clone(),
            },
        );
    }
}

/// Sorted `(step, path)` pairs for every readable checkpoint.
fn build_index(store: &CheckpointStore, experiment_dir: &Path) -> Result<Vec<(u64, PathBuf)>, ReplayError> {
    let mut index = Vec::new();
    for path in CheckpointStore::list_checkpoints(experiment_dir)? {
        let step = match CheckpointStore::step_from_path(&path) {
            Some(step) => step,
            None => match store.load(&path) {
                Ok(checkpoint) => checkpoint.step_index,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                    continue;
                }
            },
        };
        index.push((step, path));
    }
    index.sort_by_key(|(step, _)| *step);
    Ok(index)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use rand::Rng;
    use serde_json::{Value, json};

    use super::*;
    use crate::config::{EvolutionConfig, LoggingConfig};
    use crate::plugin::{PluginContext, PluginError, PluginState, RestoreRequest, Simulation};
    use crate::registry::{PluginRegistration, StepUnit};
    use crate::rng::RngHandle;

    /// One-dimensional random walk with checkpoint support.
    struct Walk {
        rng: RngHandle,
        position: f64,
    }

    impl Simulation for Walk {
        fn reset(&mut self) -> Result<(), PluginError> {
            self.position = 0.0;
            Ok(())
        }
        fn step(&mut self) -> Result<(), PluginError> {
            let delta: f64 = self.rng.with(|rng| rng.stream("walk").random_range(-1.0..1.0));
            self.position += delta;
            Ok(())
        }
        fn metrics(&self) -> MetricRow {
            MetricRow::from([("position".to_owned(), self.position)])
        }
        fn render_state(&self) -> Value {
            json!({"agents": [{"id": "w", "x": self.position, "y": 0.0}]})
        }
        fn close(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
        fn export_state(&self) -> Option<Result<PluginState, PluginError>> {
            Some(PluginState::encode(&self.position, &Value::Null))
        }
        fn import_state(&mut self, request: &RestoreRequest) -> Result<(), PluginError> {
            self.position = request.state.decode_population()?;
            Ok(())
        }
        fn supports_import(&self) -> bool {
            true
        }
    }

    fn build_walk(ctx: PluginContext) -> Result<Box<dyn Simulation>, PluginError> {
        Ok(Box::new(Walk {
            rng: ctx.rng,
            position: 0.0,
        }))
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register(PluginRegistration {
                name: "walk",
                unit: StepUnit::Step,
                factory: build_walk,
                render_adapter: None,
            })
            .unwrap();
        registry
    }

    fn config(interval: u64) -> RuntimeConfig {
        RuntimeConfig {
            simulation: "walk".to_owned(),
            params: serde_json::Map::new(),
            evolution: EvolutionConfig {
                population_size: 1,
                mutation_rate: 0.0,
                crossover_rate: 0.0,
                elite_fraction: 0.0,
                random_seed: 2024,
            },
            logging: LoggingConfig {
                log_interval: 1,
                checkpoint_interval: interval,
                experiment_name: "replay".to_owned(),
            },
        }
    }

    fn record_run(dir: &Path, steps: u64) -> Vec<MetricRow> {
        let options = SimulatorOptions {
            experiment_dir: Some(dir.to_path_buf()),
            ..SimulatorOptions::default()
        };
        let mut sim = Simulator::new(config(3), &registry(), options).unwrap();
        sim.run(steps).unwrap()
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("evolab-replay-{}", uuid::Uuid::new_v4()))
    }

    fn engine(dir: &Path, cache: usize) -> ReplayEngine {
        ReplayEngine::new(config(3), &registry(), dir, CheckpointStore::new(), cache).unwrap()
    }

    #[test]
    fn jump_matches_live_metrics() {
        let dir = temp_dir();
        let live = record_run(&dir, 10);
        let mut replay = engine(&dir, DEFAULT_CACHE_SIZE);
        assert_eq!(replay.checkpoint_steps(), vec![3, 6, 9]);

        for target in [7_u64, 2, 10, 6] {
            replay.jump_to_generation(target).unwrap();
            assert_eq!(replay.current_step(), target);
            let expected = usize::try_from(target - 1).unwrap();
            assert_eq!(replay.current_metrics(), &live[expected]);
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn backward_then_forward_stays_consistent() {
        let dir = temp_dir();
        let live = record_run(&dir, 9);
        let mut replay = engine(&dir, 2);

        replay.jump_to_step(8).unwrap();
        replay.step_backward(3).unwrap();
        assert_eq!(replay.current_step(), 5);
        assert_eq!(replay.current_metrics(), &live[4]);

        replay.step_forward(2).unwrap();
        assert_eq!(replay.current_metrics(), &live[6]);
        assert!(replay.cached_steps() <= 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn cache_hit_then_forward_rematerializes() {
        let dir = temp_dir();
        let live = record_run(&dir, 6);
        let mut replay = engine(&dir, DEFAULT_CACHE_SIZE);

        replay.jump_to_step(5).unwrap();
        replay.jump_to_step(4).unwrap();
        replay.step_forward(1).unwrap();
        assert_eq!(replay.current_metrics(), &live[4]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn no_checkpoints_replays_from_origin() {
        let dir = temp_dir();
        let mut live = Simulator::new(config(0), &registry(), SimulatorOptions::default()).unwrap();
        let rows = live.run(4).unwrap();

        let mut replay = engine(&dir, DEFAULT_CACHE_SIZE);
        replay.step_forward(2).unwrap();
        replay.jump_to_step(4).unwrap();
        assert_eq!(replay.current_metrics(), &rows[3]);
        replay.jump_to_step(0).unwrap();
        assert_eq!(replay.current_step(), 0);
        assert_eq!(replay.current_metrics().get("position").copied(), Some(0.0));
    }

    #[test]
    fn frames_differ_between_steps() {
        let dir = temp_dir();
        record_run(&dir, 6);
        let mut replay = engine(&dir, DEFAULT_CACHE_SIZE);
        replay.jump_to_step(2).unwrap();
        let early = replay.render_state();
        replay.jump_to_step(5).unwrap();
        let late = replay.render_state();
        assert_ne!(early.agents, late.agents);
        assert_eq!(late.step_index, 5);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn lru_evicts_oldest_entry() {
        let mut cache = StepCache::new(2);
        let entry = CachedStep {
            frame: RenderState::normalize(&Value::Null, 0, 0, MetricRow::new(), 0.0),
            metrics: MetricRow::new(),
        };
        cache.put(1, entry.clone());
        cache.put(2, entry.clone());
        assert!(cache.get(1).is_some());
        cache.put(3, entry);
        assert!(cache.peek(1).is_some());
        assert!(cache.peek(2).is_none());
        assert!(cache.peek(3).is_some());
    }
}
