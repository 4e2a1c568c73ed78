//! Deterministic plugin runtime for Evolab.
//!
//! This crate hosts simulation plugins and makes their runs reproducible,
//! resumable, and navigable:
//!
//! - [`rng`] -- Seeded RNG with named, hash-derived sub-streams and exact snapshots
//! - [`plugin`] -- The contract every simulation plugin implements
//! - [`registry`] -- Explicit name to constructor registry
//! - [`config`] -- Runtime config loading and per-session overrides
//! - [`event_bus`] -- Non-blocking publish/subscribe fan-out
//! - [`checkpoint`] -- Versioned checkpoints, atomic store, background writer
//! - [`simulator`] -- Plugin-hosting simulator with checkpoint cadence
//! - [`replay`] -- Checkpoint-plus-forward-replay time travel
//! - [`clock`] -- Wall-clock timestamps for frames and checkpoints

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod event_bus;
pub mod plugin;
pub mod registry;
pub mod replay;
pub mod rng;
pub mod simulator;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, CheckpointWriter, SCHEMA_VERSION};
pub use config::{ConfigError, EvolutionConfig, LoggingConfig, RuntimeConfig, RuntimeOverrides};
pub use event_bus::{BusEvent, EventBus, EventBusError, Topic};
pub use plugin::{PluginContext, PluginError, PluginState, RestoreRequest, Simulation};
pub use registry::{
    PluginFactory, PluginRegistration, PluginRegistry, RegistryError, RenderAdapter, RenderContext,
    StepUnit,
};
pub use replay::{ReplayEngine, ReplayError};
pub use rng::{DeterministicRng, RngHandle, RngSnapshot, StateDecodeError};
pub use simulator::{Phase, Simulator, SimulatorError, SimulatorOptions};
