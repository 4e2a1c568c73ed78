//! Shared type definitions for the Evolab simulation runtime.
//!
//! This crate is the single source of truth for the data that crosses
//! crate boundaries: metric rows, render frames, experiment identifiers,
//! and the update events a live session streams to its coordinator.
//!
//! # Modules
//!
//! - [`ids`] -- Experiment identifier wrapper
//! - [`metrics`] -- Metric rows and sanitization
//! - [`render`] -- Immutable render frames and raw-state normalization
//! - [`experiment`] -- Experiment status and session mode enums
//! - [`session`] -- Session update events

pub mod experiment;
pub mod ids;
pub mod metrics;
pub mod render;
pub mod session;

// Re-export all public types at crate root for convenience.
pub use experiment::{ExperimentStatus, SessionMode};
pub use ids::ExperimentId;
pub use metrics::{MetricRow, sanitize_metrics};
pub use render::{AgentState, EnvironmentState, RenderState};
pub use session::SessionEvent;
