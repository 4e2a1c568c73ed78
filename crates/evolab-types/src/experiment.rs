//! Experiment lifecycle enumerations.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an experiment tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Registered but not yet running.
    Queued,
    /// The session worker is advancing the simulation.
    Running,
    /// The session is parked waiting for resume or a single step.
    Paused,
    /// The session ran all planned units.
    Completed,
    /// The session was stopped before running all planned units.
    Stopped,
    /// The session terminated on an error.
    Failed,
}

impl ExperimentStatus {
    /// Return the lowercase status label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Whether the session can still produce updates.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }
}

impl core::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of session backs an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Generation-based run; metrics go to the persistence collaborator.
    Generation,
    /// Plugin step-based run; metrics go to an append-only JSON-lines log.
    Plugin,
}

impl SessionMode {
    /// Prefix used for experiment ids of this mode.
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Generation => "live",
            Self::Plugin => "plugin",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ExperimentStatus::Completed).unwrap_or_default();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn terminal_states_are_inactive() {
        assert!(ExperimentStatus::Running.is_active());
        assert!(ExperimentStatus::Paused.is_active());
        assert!(!ExperimentStatus::Completed.is_active());
        assert!(!ExperimentStatus::Stopped.is_active());
        assert!(!ExperimentStatus::Failed.is_active());
    }
}
