//! Error types for the runner binary.
//!
//! [`RunnerError`] wraps every failure mode of startup, the run itself,
//! and the replay check, so `main` can propagate with `?`.

/// Top-level error for the runner binary.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: evolab_core::ConfigError,
    },

    /// Plugin registration failed.
    #[error("registry error: {source}")]
    Registry {
        /// The underlying registry error.
        #[from]
        source: evolab_core::RegistryError,
    },

    /// The event bus could not start.
    #[error("event bus error: {source}")]
    EventBus {
        /// The underlying bus error.
        #[from]
        source: evolab_core::EventBusError,
    },

    /// The simulation run failed.
    #[error("simulator error: {source}")]
    Simulator {
        /// The underlying simulator error.
        #[from]
        source: evolab_core::SimulatorError,
    },

    /// The replay check failed to run.
    #[error("replay error: {source}")]
    Replay {
        /// The underlying replay error.
        #[from]
        source: evolab_core::ReplayError,
    },

    /// An environment variable held an unusable value.
    #[error("invalid value for {name}: {message}")]
    Env {
        /// Variable name.
        name: &'static str,
        /// Why the value was rejected.
        message: String,
    },
}
