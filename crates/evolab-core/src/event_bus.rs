//! Non-blocking in-process publish/subscribe fan-out.
//!
//! The simulator publishes lifecycle and render events here without knowing
//! who listens. Each subscriber callback runs on a pooled worker of a small
//! tokio runtime. A counting semaphore caps the number of callbacks in
//! flight; once saturated, further deliveries are dropped rather than
//! queued, so [`EventBus::publish`] never blocks the simulation thread.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use evolab_types::RenderState;

/// Poll interval used while waiting for in-flight callbacks.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Errors raised while building the bus.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// The worker runtime could not be started.
    #[error("failed to start event bus workers: {source}")]
    Runtime {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

/// Topics the simulator publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// One render frame per step.
    RenderState,
    /// A checkpoint file was written.
    CheckpointSaved,
    /// The current generation finished.
    GenerationEnd,
    /// The run finished.
    SimulationEnd,
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum BusEvent {
    /// A render frame.
    RenderState {
        /// The frame.
        state: Box<RenderState>,
    },
    /// A checkpoint file was written.
    CheckpointSaved {
        /// Final path of the checkpoint file.
        path: PathBuf,
        /// Step index stored in the checkpoint.
        step_index: u64,
    },
    /// The current generation finished.
    GenerationEnd {
        /// Generation counter.
        generation_index: u64,
        /// Step counter.
        step_index: u64,
    },
    /// The run finished.
    SimulationEnd {
        /// Generation counter.
        generation_index: u64,
        /// Step counter.
        step_index: u64,
    },
}

impl BusEvent {
    /// Topic this event is published on.
    pub const fn topic(&self) -> Topic {
        match self {
            Self::RenderState { .. } => Topic::RenderState,
            Self::CheckpointSaved { .. } => Topic::CheckpointSaved,
            Self::GenerationEnd { .. } => Topic::GenerationEnd,
            Self::SimulationEnd { .. } => Topic::SimulationEnd,
        }
    }
}

/// Subscriber callback.
pub type Subscriber = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// In-process event bus with bounded, lossy delivery.
pub struct EventBus {
    runtime: Runtime,
    subscribers: RwLock<HashMap<Topic, Vec<Subscriber>>>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl EventBus {
    /// Start a bus with `workers` pooled threads and at most
    /// `max_in_flight` concurrent callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Runtime`] if the worker pool cannot start.
    pub fn new(workers: usize, max_in_flight: usize) -> Result<Self, EventBusError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .max_blocking_threads(max_in_flight.max(1))
            .thread_name("evolab-event-bus")
            .build()?;
        Ok(Self {
            runtime,
            subscribers: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            max_in_flight: max_in_flight.max(1),
        })
    }

    /// Register a callback for `topic`.
    pub fn subscribe<F>(&self, topic: Topic, callback: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Deliver `event` to every subscriber of its topic without blocking.
    ///
    /// Returns the number of callbacks dispatched; callbacks that found the
    /// pool saturated are dropped and not counted.
    pub fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        let targets: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            return 0;
        }

        let event = Arc::new(event);
        let mut dispatched = 0_usize;
        for callback in targets {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!(?topic, "event bus saturated, dropping delivery");
                continue;
            };
            let event = Arc::clone(&event);
            self.runtime.spawn_blocking(move || {
                let _permit = permit;
                invoke_guarded(topic, &callback, &event);
            });
            dispatched = dispatched.saturating_add(1);
        }
        dispatched
    }

    /// Wait until no callback is in flight or `timeout` elapses.
    ///
    /// Returns whether the bus went idle in time.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.permits.available_permits() >= self.max_in_flight {
                return true;
            }
            if deadline.is_none_or(|d| Instant::now() >= d) {
                return false;
            }
            std::thread::sleep(IDLE_POLL);
        }
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("max_in_flight", &self.max_in_flight)
            .field("available", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

/// Run a subscriber, logging and discarding any panic it raises.
fn invoke_guarded(topic: Topic, callback: &Subscriber, event: &BusEvent) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        warn!(?topic, "event bus subscriber panicked; delivery discarded");
    }
}
