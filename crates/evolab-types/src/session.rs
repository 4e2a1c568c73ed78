//! Update events a live session streams to its consumer.
//!
//! Events are tagged by an `event` field on the wire so that consumers in
//! other processes see `{"event": "generation", ...}` rows.

use serde::{Deserialize, Serialize};

use crate::metrics::MetricRow;
use crate::render::RenderState;

/// One update emitted by a live session worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The worker thread is up and about to run its first unit.
    Started {
        /// Planned number of units.
        total_generations: u64,
    },
    /// One unit (generation or plugin step) completed.
    Generation {
        /// One-based index of the completed unit.
        generation: u64,
        /// Planned number of units.
        total_generations: u64,
        /// Sanitized metrics for the unit.
        metrics: MetricRow,
        /// Render frame, attached at a throttled rate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        render_state: Option<Box<RenderState>>,
        /// Experiment id assigned by the persistence collaborator, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        logger_experiment_id: Option<String>,
    },
    /// The worker finished, either after all units or on stop.
    Complete {
        /// Whether the run ended early because of a stop request.
        stopped: bool,
        /// Planned number of units.
        total_generations: u64,
    },
    /// The worker failed while advancing the simulation and exited.
    Error {
        /// One-based index of the unit that failed.
        generation: u64,
        /// Failure description.
        message: String,
    },
}

impl SessionEvent {
    /// Short name of the event kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Generation { .. } => "generation",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_on_the_wire() {
        let event = SessionEvent::Complete {
            stopped: true,
            total_generations: 10,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "complete");
        assert_eq!(value["stopped"], true);
    }

    #[test]
    fn generation_event_omits_missing_render_state() {
        let event = SessionEvent::Generation {
            generation: 1,
            total_generations: 2,
            metrics: MetricRow::new(),
            render_state: None,
            logger_experiment_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("render_state").is_none());
        assert_eq!(event.kind(), "generation");
    }
}
