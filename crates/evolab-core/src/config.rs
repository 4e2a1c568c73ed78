//! Runtime configuration loading and typed config structures.
//!
//! A runtime config file names the simulation plugin, carries the plugin's
//! parameters verbatim, and fixes the evolution and logging sections:
//!
//! ```yaml
//! simulation: wander
//! params:
//!   world_size: 10
//!   num_agents: 5
//! evolution:
//!   population_size: 5
//!   mutation_rate: 0.05
//!   crossover_rate: 0.5
//!   elite_fraction: 0.1
//!   random_seed: 42
//! logging:
//!   log_interval: 1
//!   checkpoint_interval: 10
//!   experiment_name: demo
//! ```
//!
//! Unknown fields are rejected at every level except `params`, whose shape
//! belongs to the plugin and is validated by the plugin's own parameter
//! struct at construction time.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write the configuration file.
    #[error("failed to access config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse or render YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML error.
        source: serde_yml::Error,
    },

    /// The document parsed but holds values outside their allowed range.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What is wrong with the document.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Normalized runtime configuration for one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Registered name of the simulation plugin.
    pub simulation: String,

    /// Plugin parameters, passed through to the plugin untouched.
    pub params: Map<String, Value>,

    /// Evolution parameters.
    pub evolution: EvolutionConfig,

    /// Logging and checkpoint cadence.
    pub logging: LoggingConfig,
}

/// Evolution section of the runtime config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvolutionConfig {
    /// Number of individuals per generation.
    pub population_size: u32,

    /// Per-gene mutation probability.
    pub mutation_rate: f64,

    /// Crossover probability.
    pub crossover_rate: f64,

    /// Fraction of the population carried over unchanged.
    pub elite_fraction: f64,

    /// Base seed for every random stream of the run.
    pub random_seed: u64,
}

/// Logging section of the runtime config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Steps between metric log lines.
    pub log_interval: u64,

    /// Steps between checkpoints; zero disables checkpointing.
    pub checkpoint_interval: u64,

    /// Human-readable experiment name.
    pub experiment_name: String,
}

impl RuntimeConfig {
    /// Load and validate configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content does not match the schema, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation.trim().is_empty() {
            return Err(invalid("simulation must be a non-empty plugin name"));
        }
        let rates = [
            ("mutation_rate", self.evolution.mutation_rate),
            ("crossover_rate", self.evolution.crossover_rate),
            ("elite_fraction", self.evolution.elite_fraction),
        ];
        for (name, value) in rates {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!(
                    "evolution.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Base seed of the run.
    pub const fn seed(&self) -> u64 {
        self.evolution.random_seed
    }

    /// Steps between checkpoints; zero disables checkpointing.
    pub const fn checkpoint_interval(&self) -> u64 {
        self.logging.checkpoint_interval
    }

    /// Plugin parameters as a JSON object.
    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// Apply per-session overrides in place.
    ///
    /// Parameter overrides only replace keys the config already defines;
    /// unknown keys are ignored so an override can never smuggle in a
    /// parameter the plugin would reject.
    pub fn apply_overrides(&mut self, overrides: &RuntimeOverrides) {
        if let Some(population_size) = overrides.population_size {
            self.evolution.population_size = population_size;
        }
        if let Some(mutation_rate) = overrides.mutation_rate {
            self.evolution.mutation_rate = mutation_rate;
        }
        if let Some(seed) = overrides.random_seed {
            self.evolution.random_seed = seed;
        }
        for (key, value) in &overrides.params {
            if let Some(slot) = self.params.get_mut(key) {
                slot.clone_from(value);
            }
        }
    }

    /// Write the config as YAML, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}

/// Per-session overrides applied on top of a base config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOverrides {
    /// Replacement population size.
    #[serde(default)]
    pub population_size: Option<u32>,

    /// Replacement mutation rate.
    #[serde(default)]
    pub mutation_rate: Option<f64>,

    /// Replacement base seed.
    #[serde(default)]
    pub random_seed: Option<u64>,

    /// Replacement values for existing plugin parameters.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
simulation: wander
params:
  world_size: 10
  num_agents: 5
evolution:
  population_size: 5
  mutation_rate: 0.05
  crossover_rate: 0.5
  elite_fraction: 0.1
  random_seed: 42
logging:
  log_interval: 1
  checkpoint_interval: 2
  experiment_name: demo
";

    #[test]
    fn parses_sample_config() {
        let config = RuntimeConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.simulation, "wander");
        assert_eq!(config.seed(), 42);
        assert_eq!(config.checkpoint_interval(), 2);
        assert_eq!(config.params.get("num_agents"), Some(&Value::from(5)));
    }

    #[test]
    fn rejects_unknown_top_level_field() {
        let yaml = format!("{SAMPLE}extra: 1\n");
        assert!(matches!(
            RuntimeConfig::parse(&yaml),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn rejects_missing_section() {
        let yaml = "simulation: wander\nparams: {}\n";
        assert!(RuntimeConfig::parse(yaml).is_err());
    }

    #[test]
    fn rejects_out_of_range_rate() {
        let yaml = SAMPLE.replace("mutation_rate: 0.05", "mutation_rate: 1.5");
        assert!(matches!(
            RuntimeConfig::parse(&yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn overrides_only_touch_existing_params() {
        let mut config = RuntimeConfig::parse(SAMPLE).unwrap();
        let mut overrides = RuntimeOverrides {
            population_size: Some(9),
            mutation_rate: Some(0.2),
            random_seed: Some(7),
            ..RuntimeOverrides::default()
        };
        overrides.params.insert("num_agents".to_owned(), Value::from(3));
        overrides.params.insert("unknown".to_owned(), Value::from(1));

        config.apply_overrides(&overrides);
        assert_eq!(config.evolution.population_size, 9);
        assert_eq!(config.evolution.mutation_rate, 0.2);
        assert_eq!(config.seed(), 7);
        assert_eq!(config.params.get("num_agents"), Some(&Value::from(3)));
        assert!(!config.params.contains_key("unknown"));
    }

    #[test]
    fn written_config_parses_back() {
        let config = RuntimeConfig::parse(SAMPLE).unwrap();
        let path = std::env::temp_dir()
            .join(format!("evolab-config-{}", uuid::Uuid::new_v4()))
            .join("runtime.yaml");
        config.write_to(&path).unwrap();
        let reloaded = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(reloaded, config);
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
