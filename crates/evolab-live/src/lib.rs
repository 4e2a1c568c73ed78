//! Live experiment control for Evolab.
//!
//! Runs simulations on background workers under pause, resume, single-step,
//! and stop control, and tracks many of them at once:
//!
//! - [`control`] -- Tagged control state machine with ticketed single steps
//! - [`session`] -- One worker thread driving one simulator
//! - [`metrics_log`] -- Append-only JSON-lines metric history
//! - [`sink`] -- Persistence collaborator for generation-mode sessions
//! - [`analytics`] -- Summaries and multi-run overlays
//! - [`coordinator`] -- Registry of concurrent experiments

pub mod analytics;
pub mod control;
pub mod coordinator;
pub mod metrics_log;
pub mod session;
pub mod sink;

pub use analytics::{AnalyticsPool, Overlay, SeriesStats, Summary, build_overlay, build_summary};
pub use control::{ControlState, SessionControl, WorkerAction};
pub use coordinator::{CoordinatorError, ExperimentCoordinator, ExperimentListing, MAX_HISTORY_POINTS};
pub use metrics_log::{MetricsLog, MetricsLogError};
pub use session::{LiveSession, SessionError, SessionSettings, UpdateCallback};
pub use sink::{JsonlMetricsSink, MetricsSink, SinkError};
