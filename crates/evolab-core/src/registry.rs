//! Explicit registry of simulation plugins.
//!
//! The process entry point builds one [`PluginRegistry`], registers every
//! available plugin by name, and passes the registry down to whatever
//! constructs simulators. There is no global discovery cache.

use std::collections::BTreeMap;

use serde_json::Value;

use evolab_types::{MetricRow, RenderState};

use crate::plugin::{PluginContext, PluginError, Simulation};

/// Errors returned by registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No plugin is registered under the requested name.
    #[error("simulation plugin '{name}' not found; available: [{}]", available.join(", "))]
    PluginNotFound {
        /// The requested name.
        name: String,
        /// Every registered name, sorted.
        available: Vec<String>,
    },

    /// A plugin with the same name is already registered.
    #[error("simulation plugin '{name}' is already registered")]
    Duplicate {
        /// The conflicting name.
        name: String,
    },
}

/// Constructor for a plugin instance.
pub type PluginFactory = fn(PluginContext) -> Result<Box<dyn Simulation>, PluginError>;

/// Inputs handed to a render adapter.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// The plugin's raw render payload.
    pub raw: &'a Value,
    /// Current generation index.
    pub generation_index: u64,
    /// Current step index.
    pub step_index: u64,
    /// Metrics for the current step.
    pub metrics: &'a MetricRow,
    /// Frame timestamp in seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Plugin-specific conversion of a raw render payload into a frame.
pub type RenderAdapter = fn(&RenderContext<'_>) -> RenderState;

/// What one call to `step` represents for a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepUnit {
    /// A tick inside one generation.
    Step,
    /// A full generation: evaluation plus population replacement.
    Generation,
}

/// Everything the runtime knows about one plugin.
#[derive(Debug, Clone, Copy)]
pub struct PluginRegistration {
    /// Unique plugin name used in configs.
    pub name: &'static str,
    /// What one step means for this plugin.
    pub unit: StepUnit,
    /// Plugin constructor.
    pub factory: PluginFactory,
    /// Optional render adapter; frames are normalized from raw JSON otherwise.
    pub render_adapter: Option<RenderAdapter>,
}

impl PluginRegistration {
    /// Build the frame for the current step.
    pub fn render(&self, ctx: &RenderContext<'_>) -> RenderState {
        self.render_adapter.map_or_else(
            || {
                RenderState::normalize(
                    ctx.raw,
                    ctx.generation_index,
                    ctx.step_index,
                    ctx.metrics.clone(),
                    ctx.timestamp,
                )
            },
            |adapter| adapter(ctx),
        )
    }
}

/// Name to constructor map, built once per process.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, PluginRegistration>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the name is taken.
    pub fn register(&mut self, registration: PluginRegistration) -> Result<(), RegistryError> {
        if self.plugins.contains_key(registration.name) {
            return Err(RegistryError::Duplicate {
                name: registration.name.to_owned(),
            });
        }
        self.plugins.insert(registration.name, registration);
        Ok(())
    }

    /// Look up a plugin by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PluginNotFound`] listing every known name.
    pub fn get(&self, name: &str) -> Result<&PluginRegistration, RegistryError> {
        self.plugins
            .get(name)
            .ok_or_else(|| RegistryError::PluginNotFound {
                name: name.to_owned(),
                available: self.names().iter().map(|n| (*n).to_owned()).collect(),
            })
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
