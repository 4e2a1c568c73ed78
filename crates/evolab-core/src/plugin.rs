//! Contract every simulation plugin implements.
//!
//! The runtime only ever talks to a plugin through [`Simulation`]. All
//! plugin state is instance-local; the runtime never reaches past this
//! trait. Checkpoint support is optional: plugins that cannot export or
//! import their state still run, but cannot be restored mid-run.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use evolab_types::MetricRow;

use crate::config::EvolutionConfig;
use crate::rng::RngHandle;

/// Errors raised by a plugin.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Construction parameters were rejected.
    #[error("invalid plugin parameters: {reason}")]
    Invalid {
        /// Why the parameters were rejected.
        reason: String,
    },

    /// The plugin failed while running.
    #[error("{reason}")]
    Failed {
        /// What went wrong.
        reason: String,
    },

    /// The plugin does not implement an optional hook.
    #[error("plugin does not support {hook}")]
    Unsupported {
        /// Name of the missing hook.
        hook: &'static str,
    },

    /// A state payload could not be encoded or decoded.
    #[error("plugin state payload is malformed: {source}")]
    State {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Population and environment payloads exported for a checkpoint.
///
/// Each plugin decides the shape of both payloads. The typed
/// [`encode`](Self::encode) and [`decode_population`](Self::decode_population)
/// helpers let a plugin round-trip its own structs through this container
/// without handling JSON directly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginState {
    /// Plugin-defined population payload.
    pub population: Value,
    /// Plugin-defined environment payload.
    pub environment: Value,
}

impl PluginState {
    /// Encode typed payloads.
    pub fn encode<P, E>(population: &P, environment: &E) -> Result<Self, PluginError>
    where
        P: Serialize,
        E: Serialize,
    {
        Ok(Self {
            population: serde_json::to_value(population)?,
            environment: serde_json::to_value(environment)?,
        })
    }

    /// Decode the population payload into a typed value.
    pub fn decode_population<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        Ok(T::deserialize(&self.population)?)
    }

    /// Decode the environment payload into a typed value.
    pub fn decode_environment<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        Ok(T::deserialize(&self.environment)?)
    }
}

/// Everything a plugin receives when restored from a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreRequest {
    /// Exported payloads.
    pub state: PluginState,
    /// Step index at which the checkpoint was taken.
    pub step_index: u64,
    /// Generation index at which the checkpoint was taken.
    pub generation_index: u64,
}

/// Construction context handed to a plugin factory.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Raw plugin parameters from the runtime config.
    pub params: Value,
    /// Evolution section of the runtime config.
    pub evolution: EvolutionConfig,
    /// Shared handle to the run's deterministic RNG.
    pub rng: RngHandle,
}

impl PluginContext {
    /// Decode the raw parameters into the plugin's typed parameter struct.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Invalid`] if the parameters do not match.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        T::deserialize(&self.params).map_err(|source| PluginError::Invalid {
            reason: source.to_string(),
        })
    }
}

/// A simulation plugin driven by the runtime.
pub trait Simulation: Send {
    /// Put the plugin in its initial state.
    fn reset(&mut self) -> Result<(), PluginError>;

    /// Advance the plugin by one step.
    fn step(&mut self) -> Result<(), PluginError>;

    /// Metrics describing the current state.
    fn metrics(&self) -> MetricRow;

    /// Render payload describing the current state.
    fn render_state(&self) -> Value;

    /// Release plugin resources.
    fn close(&mut self) -> Result<(), PluginError>;

    /// Export population and environment payloads, if supported.
    fn export_state(&self) -> Option<Result<PluginState, PluginError>> {
        None
    }

    /// Restore population and environment payloads, if supported.
    fn import_state(&mut self, request: &RestoreRequest) -> Result<(), PluginError> {
        let _ = request;
        Err(PluginError::Unsupported {
            hook: "import_state",
        })
    }

    /// Whether [`import_state`](Self::import_state) is implemented.
    fn supports_import(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cell {
        x: i64,
        y: i64,
    }

    #[test]
    fn typed_state_round_trips() {
        let cells = vec![Cell { x: 1, y: 2 }];
        let state = PluginState::encode(&cells, &10_u32).unwrap();
        let decoded: Vec<Cell> = state.decode_population().unwrap();
        let size: u32 = state.decode_environment().unwrap();
        assert_eq!(decoded, cells);
        assert_eq!(size, 10);
    }

    #[test]
    fn mismatched_payload_is_state_error() {
        let state = PluginState {
            population: Value::from("not a list"),
            environment: Value::Null,
        };
        let result: Result<Vec<Cell>, _> = state.decode_population();
        assert!(matches!(result, Err(PluginError::State { .. })));
    }

    #[test]
    fn context_rejects_bad_params() {
        #[derive(Debug, Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Params {
            #[allow(dead_code)]
            size: u32,
        }

        let ctx = PluginContext {
            params: serde_json::json!({"size": 3, "bogus": true}),
            evolution: EvolutionConfig {
                population_size: 1,
                mutation_rate: 0.0,
                crossover_rate: 0.0,
                elite_fraction: 0.0,
                random_seed: 0,
            },
            rng: RngHandle::new(0),
        };
        let result: Result<Params, _> = ctx.params();
        assert!(matches!(result, Err(PluginError::Invalid { .. })));
    }
}
