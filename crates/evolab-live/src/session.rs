//! One live simulation session: a worker thread under external control.
//!
//! The worker owns the [`Simulator`] for the session's lifetime. It runs one
//! unit at a time, streams a [`SessionEvent`] per unit to the update
//! callback, and consults [`SessionControl`] between units for pause, single
//! steps, and stop. Failures while advancing become an `error` event and end
//! the worker; they never unwind past it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use evolab_core::Simulator;
use evolab_types::{ExperimentId, SessionEvent, SessionMode, sanitize_metrics};

use crate::control::{ControlState, SessionControl, WorkerAction};
use crate::sink::MetricsSink;

/// Callback receiving every session event.
pub type UpdateCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Errors raised when starting a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `start` was called more than once.
    #[error("session {id} was already started")]
    AlreadyStarted {
        /// Session id.
        id: String,
    },

    /// The worker thread could not be spawned.
    #[error("failed to spawn session worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Pacing and sizing of one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Which kind of experiment this session backs.
    pub mode: SessionMode,
    /// Planned number of units.
    pub total_units: u64,
    /// Delay between automatic units at speed `1.0`.
    pub base_delay: Duration,
    /// Wake interval while parked.
    pub poll_interval: Duration,
    /// Minimum spacing between attached render frames.
    pub min_emit_interval: Duration,
}

impl SessionSettings {
    /// Default pacing for `total_units` units.
    pub const fn new(mode: SessionMode, total_units: u64) -> Self {
        Self {
            mode,
            total_units,
            base_delay: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
            min_emit_interval: Duration::from_nanos(33_333_333),
        }
    }

    /// Same settings with a different inter-unit delay.
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

/// Everything the worker takes ownership of at start.
struct Launch {
    simulator: Simulator,
    sink: Option<Arc<dyn MetricsSink>>,
}

/// A live session and its control handle.
pub struct LiveSession {
    id: ExperimentId,
    settings: SessionSettings,
    control: Arc<SessionControl>,
    launch: Mutex<Option<Launch>>,
    on_update: UpdateCallback,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("state", &self.control.state())
            .finish_non_exhaustive()
    }
}

impl LiveSession {
    /// Bind a simulator to a session; nothing runs until [`Self::start`].
    pub fn new(
        id: ExperimentId,
        simulator: Simulator,
        settings: SessionSettings,
        sink: Option<Arc<dyn MetricsSink>>,
        on_update: UpdateCallback,
    ) -> Self {
        Self {
            id,
            settings,
            control: Arc::new(SessionControl::new()),
            launch: Mutex::new(Some(Launch { simulator, sink })),
            on_update,
            handle: Mutex::new(None),
        }
    }

    /// Session id.
    pub const fn id(&self) -> &ExperimentId {
        &self.id
    }

    /// Pacing and sizing of this session.
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<(), SessionError> {
        let launch = self
            .launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SessionError::AlreadyStarted {
                id: self.id.to_string(),
            })?;
        self.control.start();

        let worker = Worker {
            id: self.id.clone(),
            simulator: launch.simulator,
            sink: launch.sink,
            control: Arc::clone(&self.control),
            settings: self.settings,
            on_update: Arc::clone(&self.on_update),
            last_frame_at: None,
        };
        let spawned = std::thread::Builder::new()
            .name(format!("evolab-session-{}", self.id))
            .spawn(move || worker.run());
        let handle = spawned.inspect_err(|_spawn_error| self.control.stop())?;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(experiment_id = %self.id, total_units = self.settings.total_units, "session started");
        Ok(())
    }

    /// Park the worker after its current unit.
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Let a parked worker run automatically again.
    pub fn resume(&self) {
        self.control.resume();
    }

    /// Run exactly one unit and wait up to `timeout` for it.
    pub fn step_once(&self, timeout: Duration) -> bool {
        self.control.step_once(timeout)
    }

    /// Ask the worker to exit at its next boundary.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Scale the inter-unit delay.
    pub fn set_speed(&self, multiplier: f64) {
        self.control.set_speed(multiplier);
    }

    /// Whether the worker is parked.
    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Current control state.
    pub fn state(&self) -> ControlState {
        self.control.state()
    }

    /// Units completed so far.
    pub fn units_completed(&self) -> u64 {
        self.control.units_completed()
    }

    /// Wait up to `timeout` for the worker to exit.
    ///
    /// Returns `true` once the worker has exited (or never started).
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = slot.as_ref() else {
            return true;
        };
        while !handle.is_finished() {
            if deadline.is_none_or(|d| Instant::now() >= d) {
                return false;
            }
            std::thread::sleep(self.settings.poll_interval.min(Duration::from_millis(10)));
        }
        if let Some(handle) = slot.take()
            && handle.join().is_err()
        {
            warn!(experiment_id = %self.id, "session worker panicked");
        }
        true
    }
}

struct Worker {
    id: ExperimentId,
    simulator: Simulator,
    sink: Option<Arc<dyn MetricsSink>>,
    control: Arc<SessionControl>,
    settings: SessionSettings,
    on_update: UpdateCallback,
    last_frame_at: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        let total = self.settings.total_units;
        self.emit(&SessionEvent::Started {
            total_generations: total,
        });

        if let Err(e) = self.simulator.begin() {
            self.fail(0, &e.to_string());
            return;
        }
        let logger_experiment_id = self.announce_to_sink();

        let mut stopped = false;
        for unit in 1..=total {
            let step_mode = match self.control.next_action(self.settings.poll_interval) {
                WorkerAction::Stop => {
                    stopped = true;
                    break;
                }
                WorkerAction::Run => false,
                WorkerAction::Step => true,
            };

            let metrics = match self.simulator.advance() {
                Ok(metrics) => sanitize_metrics(&metrics),
                Err(e) => {
                    self.fail(unit, &e.to_string());
                    return;
                }
            };

            if let (Some(sink), Some(sink_id)) = (&self.sink, &logger_experiment_id)
                && let Err(e) = sink.log_metrics(sink_id, self.simulator.generation_index(), &metrics)
            {
                warn!(experiment_id = %self.id, error = %e, "failed to persist metrics row");
            }

            let render_state = self
                .frame_due(step_mode, unit == total)
                .then(|| Box::new(self.simulator.render_frame()));
            self.emit(&SessionEvent::Generation {
                generation: unit,
                total_generations: total,
                metrics,
                render_state,
                logger_experiment_id: logger_experiment_id.clone(),
            });
            self.control.complete_unit();

            if !step_mode {
                self.control.pace(self.control.scaled_delay(self.settings.base_delay));
            }
        }

        if let Err(e) = self.simulator.finish() {
            self.fail(self.control.units_completed(), &e.to_string());
            return;
        }
        info!(
            experiment_id = %self.id,
            units = self.control.units_completed(),
            stopped,
            "session finished"
        );
        self.emit(&SessionEvent::Complete {
            stopped,
            total_generations: total,
        });
        self.control.stop();
    }

    /// Register with the sink; a sink failure disables persistence only.
    fn announce_to_sink(&self) -> Option<String> {
        let sink = self.sink.as_ref()?;
        let config = self.simulator.config();
        let config_value = serde_json::to_value(config).unwrap_or(Value::Null);
        let metadata = json!({
            "mode": self.settings.mode,
            "simulation": config.simulation,
            "session_id": self.id.as_str(),
            "total_units": self.settings.total_units,
        });
        sink.start_experiment(&config_value, config.seed(), &metadata)
            .inspect_err(|e| {
                warn!(experiment_id = %self.id, error = %e, "metrics sink unavailable, continuing without it");
            })
            .ok()
    }

    fn frame_due(&mut self, step_mode: bool, last_unit: bool) -> bool {
        let now = Instant::now();
        let due = step_mode
            || last_unit
            || self
                .last_frame_at
                .is_none_or(|at| now.duration_since(at) >= self.settings.min_emit_interval);
        if due {
            self.last_frame_at = Some(now);
        }
        due
    }

    fn fail(&mut self, unit: u64, message: &str) {
        error!(experiment_id = %self.id, unit, error = message, "session failed");
        self.simulator.abort();
        self.emit(&SessionEvent::Error {
            generation: unit,
            message: message.to_owned(),
        });
        self.control.stop();
    }

    /// Deliver `event`; a panicking callback is logged and ignored.
    fn emit(&self, event: &SessionEvent) {
        let callback = &self.on_update;
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            warn!(experiment_id = %self.id, event = event.kind(), "session update callback panicked");
        } else {
            debug!(experiment_id = %self.id, event = event.kind(), "session event delivered");
        }
    }
}
