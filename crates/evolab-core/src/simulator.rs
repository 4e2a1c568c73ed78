//! Plugin-hosting simulator.
//!
//! The [`Simulator`] resolves a plugin from the registry, owns the run's
//! RNG and checkpoint cadence, and drives the plugin one step at a time:
//!
//! 1. `step()` the plugin
//! 2. collect metrics
//! 3. build and publish the render frame
//! 4. enqueue a checkpoint when `step_index % checkpoint_interval == 0`
//!
//! Step `N + 1` never starts before step `N`'s checkpoint is enqueued.
//! Checkpoint writes themselves happen on a background writer so disk I/O
//! never stalls the loop. Plugin failures are wrapped with the plugin name
//! and failing phase and returned, never swallowed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use evolab_types::{MetricRow, RenderState, sanitize_metrics};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, CheckpointWriter, SCHEMA_VERSION};
use crate::clock::unix_timestamp;
use crate::config::{ConfigError, RuntimeConfig};
use crate::event_bus::{BusEvent, EventBus};
use crate::plugin::{PluginContext, PluginError, PluginState, RestoreRequest, Simulation};
use crate::registry::{PluginRegistration, PluginRegistry, RegistryError, RenderContext, StepUnit};
use crate::rng::RngHandle;

/// Plugin lifecycle phase in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Plugin construction.
    Init,
    /// `reset()`.
    Reset,
    /// `step()`.
    Step,
    /// `close()`.
    Close,
    /// `export_state()`.
    Export,
    /// `import_state()`.
    Import,
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Reset => "reset",
            Self::Step => "step",
            Self::Close => "close",
            Self::Export => "export",
            Self::Import => "import",
        };
        f.write_str(name)
    }
}

/// Errors raised by the simulator.
#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    /// The plugin failed; carries the plugin name and phase.
    #[error("simulation plugin '{plugin}' failed during {phase}: {source}")]
    Plugin {
        /// Plugin name.
        plugin: String,
        /// Failing phase.
        phase: Phase,
        /// The plugin's error.
        #[source]
        source: PluginError,
    },

    /// The configured plugin is not registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The config could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The plugin cannot import checkpoint state.
    #[error("simulation plugin '{plugin}' does not support restoring from a checkpoint")]
    RestoreUnsupported {
        /// Plugin name.
        plugin: String,
    },

    /// Checkpoint persistence failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Optional collaborators for a simulator.
#[derive(Debug, Clone, Default)]
pub struct SimulatorOptions {
    /// Bus receiving render and lifecycle events.
    pub event_bus: Option<Arc<EventBus>>,
    /// Directory checkpoints are written under; `None` disables them.
    pub experiment_dir: Option<PathBuf>,
    /// Store used to write checkpoints.
    pub store: CheckpointStore,
}

/// Drives one plugin instance.
pub struct Simulator {
    config: RuntimeConfig,
    registration: PluginRegistration,
    plugin: Box<dyn Simulation>,
    rng: RngHandle,
    bus: Option<Arc<EventBus>>,
    store: CheckpointStore,
    experiment_dir: Option<PathBuf>,
    writer: Option<CheckpointWriter>,
    generation_index: u64,
    step_index: u64,
    last_metrics: MetricRow,
    closed: bool,
}

impl Simulator {
    /// Resolve the configured plugin and construct it.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::Registry`] if the plugin name is unknown
    /// and [`SimulatorError::Plugin`] with [`Phase::Init`] if the plugin
    /// rejects its parameters.
    pub fn new(
        config: RuntimeConfig,
        registry: &PluginRegistry,
        options: SimulatorOptions,
    ) -> Result<Self, SimulatorError> {
        let registration = *registry.get(&config.simulation)?;
        let rng = RngHandle::new(config.seed());
        let ctx = PluginContext {
            params: config.params_value(),
            evolution: config.evolution.clone(),
            rng: rng.clone(),
        };
        let plugin = (registration.factory)(ctx).map_err(|source| SimulatorError::Plugin {
            plugin: registration.name.to_owned(),
            phase: Phase::Init,
            source,
        })?;

        info!(
            plugin = registration.name,
            seed = config.seed(),
            checkpoint_interval = config.checkpoint_interval(),
            "simulator initialized"
        );

        Ok(Self {
            config,
            registration,
            plugin,
            rng,
            bus: options.event_bus,
            store: options.store,
            experiment_dir: options.experiment_dir,
            writer: None,
            generation_index: 0,
            step_index: 0,
            last_metrics: MetricRow::new(),
            closed: false,
        })
    }

    /// Load a config file and construct the simulator.
    pub fn from_config_path(
        path: &Path,
        registry: &PluginRegistry,
        options: SimulatorOptions,
    ) -> Result<Self, SimulatorError> {
        let config = RuntimeConfig::from_file(path)?;
        Self::new(config, registry, options)
    }

    /// Run `steps` steps from the initial state and return every metric row.
    ///
    /// On failure the plugin is still closed and pending checkpoint writes
    /// are still drained before the error is returned.
    pub fn run(&mut self, steps: u64) -> Result<Vec<MetricRow>, SimulatorError> {
        match self.run_steps(steps) {
            Ok(rows) => {
                self.finish()?;
                Ok(rows)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn run_steps(&mut self, steps: u64) -> Result<Vec<MetricRow>, SimulatorError> {
        self.begin()?;
        let mut rows = Vec::new();
        for _ in 0..steps {
            rows.push(self.advance()?);
        }
        Ok(rows)
    }

    /// Rewind to step zero: reseed the RNG and reset the plugin.
    pub fn begin(&mut self) -> Result<(), SimulatorError> {
        self.rng.reseed();
        self.generation_index = 0;
        self.step_index = 0;
        self.closed = false;
        self.plugin.reset().map_err(|e| self.plugin_error(Phase::Reset, e))?;
        self.last_metrics = sanitize_metrics(&self.plugin.metrics());
        Ok(())
    }

    /// Advance one step and return its metrics, without non-finite values.
    pub fn advance(&mut self) -> Result<MetricRow, SimulatorError> {
        self.step_index = self.step_index.saturating_add(1);
        if self.registration.unit == StepUnit::Generation {
            self.generation_index = self.step_index;
        }
        self.plugin.step().map_err(|e| self.plugin_error(Phase::Step, e))?;

        let metrics = sanitize_metrics(&self.plugin.metrics());
        self.last_metrics.clone_from(&metrics);

        // Adapters may have side effects, so the frame is built every step.
        let frame = self.render_frame();
        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::RenderState {
                state: Box::new(frame),
            });
        }

        if self.checkpoint_due() {
            self.enqueue_checkpoint(&metrics)?;
        }

        debug!(plugin = self.registration.name, step_index = self.step_index, "step complete");
        Ok(metrics)
    }

    /// Publish end-of-run events, close the plugin, and drain checkpoint writes.
    pub fn finish(&mut self) -> Result<(), SimulatorError> {
        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::GenerationEnd {
                generation_index: self.generation_index,
                step_index: self.step_index,
            });
            bus.publish(BusEvent::SimulationEnd {
                generation_index: self.generation_index,
                step_index: self.step_index,
            });
        }
        let closed = self.close_plugin();
        let drained = self.drain_checkpoints();
        closed?;
        drained?;
        info!(
            plugin = self.registration.name,
            step_index = self.step_index,
            "simulation finished"
        );
        Ok(())
    }

    /// Close the plugin and drain writes after a failure, logging any
    /// secondary error instead of masking the original one.
    ///
    /// A plugin already closed by [`finish`](Self::finish) is not closed again.
    pub fn abort(&mut self) {
        if let Err(e) = self.close_plugin() {
            warn!(plugin = self.registration.name, error = %e, "plugin close failed after error");
        }
        if let Err(e) = self.drain_checkpoints() {
            warn!(plugin = self.registration.name, error = %e, "checkpoint drain failed after error");
        }
    }

    fn close_plugin(&mut self) -> Result<(), SimulatorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.plugin.close().map_err(|e| self.plugin_error(Phase::Close, e))
    }

    /// Block until every queued checkpoint is on disk.
    pub fn drain_checkpoints(&mut self) -> Result<(), SimulatorError> {
        if let Some(mut writer) = self.writer.take() {
            writer.drain()?;
        }
        Ok(())
    }

    /// Restore simulator and plugin state from `checkpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::RestoreUnsupported`] if the plugin has no
    /// import hook; nothing is modified in that case.
    pub fn restore_from_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), SimulatorError> {
        if !self.plugin.supports_import() {
            return Err(SimulatorError::RestoreUnsupported {
                plugin: self.registration.name.to_owned(),
            });
        }
        self.generation_index = checkpoint.generation_index;
        self.step_index = checkpoint.step_index;
        self.rng.restore(&checkpoint.rng_state);
        let request = RestoreRequest {
            state: PluginState {
                population: checkpoint.population_state.clone(),
                environment: checkpoint.environment_state.clone(),
            },
            step_index: checkpoint.step_index,
            generation_index: checkpoint.generation_index,
        };
        self.plugin
            .import_state(&request)
            .map_err(|e| self.plugin_error(Phase::Import, e))?;
        self.last_metrics.clone_from(&checkpoint.metrics);
        debug!(
            plugin = self.registration.name,
            step_index = self.step_index,
            "restored from checkpoint"
        );
        Ok(())
    }

    /// Capture the current state as a checkpoint.
    ///
    /// Prefers the plugin's exported state; otherwise derives best-effort
    /// payloads from its render output.
    pub fn build_checkpoint(&self, metrics: &MetricRow) -> Result<Checkpoint, SimulatorError> {
        let state = match self.plugin.export_state() {
            Some(exported) => exported.map_err(|e| self.plugin_error(Phase::Export, e))?,
            None => state_from_render(&self.plugin.render_state()),
        };
        Ok(Checkpoint {
            generation_index: self.generation_index,
            step_index: self.step_index,
            population_state: state.population,
            environment_state: state.environment,
            metrics: sanitize_metrics(metrics),
            rng_state: self.rng.snapshot(),
            timestamp: unix_timestamp(),
            schema_version: SCHEMA_VERSION.to_owned(),
        })
    }

    /// Render frame for the current step.
    pub fn render_frame(&self) -> RenderState {
        let raw = self.plugin.render_state();
        self.registration.render(&RenderContext {
            raw: &raw,
            generation_index: self.generation_index,
            step_index: self.step_index,
            metrics: &self.last_metrics,
            timestamp: unix_timestamp(),
        })
    }

    /// Raw render payload straight from the plugin.
    pub fn raw_render_state(&self) -> Value {
        self.plugin.render_state()
    }

    /// Metrics of the most recent step (or of the restored checkpoint).
    pub const fn last_metrics(&self) -> &MetricRow {
        &self.last_metrics
    }

    /// Current step counter.
    pub const fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Current generation counter.
    pub const fn generation_index(&self) -> u64 {
        self.generation_index
    }

    /// Name of the hosted plugin.
    pub const fn plugin_name(&self) -> &'static str {
        self.registration.name
    }

    /// What one step means for the hosted plugin.
    pub const fn unit(&self) -> StepUnit {
        self.registration.unit
    }

    /// Runtime config of this run.
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Shared handle to the run's RNG.
    pub const fn rng(&self) -> &RngHandle {
        &self.rng
    }

    fn checkpoint_due(&self) -> bool {
        let interval = self.config.checkpoint_interval();
        self.experiment_dir.is_some()
            && interval > 0
            && self.step_index.checked_rem(interval) == Some(0)
    }

    fn enqueue_checkpoint(&mut self, metrics: &MetricRow) -> Result<(), SimulatorError> {
        let Some(dir) = self.experiment_dir.as_deref() else {
            return Ok(());
        };
        let path = CheckpointStore::checkpoint_path(dir, self.step_index);
        let checkpoint = self.build_checkpoint(metrics)?;
        if self.writer.is_none() {
            self.writer = Some(CheckpointWriter::spawn(self.store.clone(), self.bus.clone())?);
        }
        if let Some(writer) = &self.writer {
            writer.submit(checkpoint, path)?;
        }
        Ok(())
    }

    fn plugin_error(&self, phase: Phase, source: PluginError) -> SimulatorError {
        SimulatorError::Plugin {
            plugin: self.registration.name.to_owned(),
            phase,
            source,
        }
    }
}

impl core::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Simulator")
            .field("plugin", &self.registration.name)
            .field("generation_index", &self.generation_index)
            .field("step_index", &self.step_index)
            .field("experiment_dir", &self.experiment_dir)
            .finish_non_exhaustive()
    }
}

/// Best-effort payloads for plugins that cannot export their state.
fn state_from_render(raw: &Value) -> PluginState {
    match raw {
        Value::Object(map) => PluginState {
            population: map.get("agents").cloned().unwrap_or(Value::Null),
            environment: map.get("environment").cloned().unwrap_or_else(|| raw.clone()),
        },
        other => PluginState {
            population: Value::Null,
            environment: other.clone(),
        },
    }
}
