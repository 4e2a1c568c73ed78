//! Control state machine shared by a live session and its worker.
//!
//! ```text
//!            start()            pause()
//!   Idle ─────────────> Running ───────> Paused
//!                         ^   <───────    │  ^
//!                         │   resume()    │  │ unit done
//!                         │     step_once │  │
//!                         │               v  │
//!                         └───────────── Stepping
//!   any state ── stop() ──> Stopped (terminal)
//! ```
//!
//! All transitions happen under one mutex and wake waiters through one
//! condition variable. Single steps are ticketed: each `step_once` call
//! takes the next ticket and waits until the worker has completed that many
//! units in step mode, so concurrent calls can never merge into one step or
//! trigger more than one unit each.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Lower bound on the speed multiplier used to scale delays.
const MIN_SPEED: f64 = 0.01;

/// Control state of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    /// Created but not started.
    Idle,
    /// Advancing automatically.
    Running,
    /// Parked until resume or a single step.
    Paused,
    /// Parked with at least one single step requested.
    Stepping,
    /// Terminal.
    Stopped,
}

/// What the worker should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    /// Run one unit and keep going.
    Run,
    /// Run exactly one unit in step mode, then park again.
    Step,
    /// Exit the loop.
    Stop,
}

#[derive(Debug)]
struct ControlInner {
    state: ControlState,
    speed: f64,
    step_requests: u64,
    steps_acknowledged: u64,
    units_completed: u64,
}

/// Mutex and condition variable pair guarding one session's control state.
#[derive(Debug)]
pub struct SessionControl {
    inner: Mutex<ControlInner>,
    changed: Condvar,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl {
    /// New control block in [`ControlState::Idle`] at speed `1.0`.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(ControlInner {
                state: ControlState::Idle,
                speed: 1.0,
                step_requests: 0,
                steps_acknowledged: 0,
                units_completed: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> ControlState {
        self.lock().state
    }

    /// Whether the session is parked (paused or waiting on a single step).
    pub fn is_paused(&self) -> bool {
        matches!(self.state(), ControlState::Paused | ControlState::Stepping)
    }

    /// Units the worker has completed so far.
    pub fn units_completed(&self) -> u64 {
        self.lock().units_completed
    }

    /// Idle to Running; clears outstanding step requests.
    ///
    /// Returns `false` if the session already left `Idle`.
    pub fn start(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != ControlState::Idle {
            return false;
        }
        inner.state = ControlState::Running;
        inner.steps_acknowledged = inner.step_requests;
        self.changed.notify_all();
        true
    }

    /// Running or Stepping to Paused.
    pub fn pause(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, ControlState::Running | ControlState::Stepping) {
            inner.state = ControlState::Paused;
            self.changed.notify_all();
        }
    }

    /// Paused or Stepping to Running.
    pub fn resume(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, ControlState::Paused | ControlState::Stepping) {
            inner.state = ControlState::Running;
            self.changed.notify_all();
        }
    }

    /// Enter the terminal state and wake every waiter. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.state = ControlState::Stopped;
        self.changed.notify_all();
    }

    /// Set the speed multiplier; non-finite or non-positive values are clamped.
    pub fn set_speed(&self, multiplier: f64) {
        let speed = if multiplier.is_finite() {
            multiplier.max(MIN_SPEED)
        } else {
            1.0
        };
        self.lock().speed = speed;
    }

    /// Current speed multiplier.
    pub fn speed(&self) -> f64 {
        self.lock().speed
    }

    /// `base / max(speed, MIN_SPEED)`.
    pub fn scaled_delay(&self, base: Duration) -> Duration {
        base.div_f64(self.speed().max(MIN_SPEED))
    }

    /// Request exactly one unit and wait up to `timeout` for it to finish.
    ///
    /// Forces the session into step mode. Returns `false` without advancing
    /// if the session is idle or stopped, or if no acknowledgment arrived in
    /// time.
    pub fn step_once(&self, timeout: Duration) -> bool {
        let mut inner = self.lock();
        if matches!(inner.state, ControlState::Idle | ControlState::Stopped) {
            return false;
        }
        inner.state = ControlState::Stepping;
        inner.step_requests = inner.step_requests.saturating_add(1);
        let ticket = inner.step_requests;
        self.changed.notify_all();

        let (inner, _timeout) = self
            .changed
            .wait_timeout_while(inner, timeout, |inner| {
                inner.steps_acknowledged < ticket && inner.state != ControlState::Stopped
            })
            .unwrap_or_else(PoisonError::into_inner);
        inner.steps_acknowledged >= ticket
    }

    /// Block the worker until it may run a unit, polling every `poll`.
    pub fn next_action(&self, poll: Duration) -> WorkerAction {
        let mut inner = self.lock();
        loop {
            match inner.state {
                ControlState::Stopped => return WorkerAction::Stop,
                ControlState::Running | ControlState::Idle => return WorkerAction::Run,
                ControlState::Paused | ControlState::Stepping => {
                    if inner.step_requests > inner.steps_acknowledged {
                        return WorkerAction::Step;
                    }
                    inner = self
                        .changed
                        .wait_timeout(inner, poll)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Record a finished unit and acknowledge one pending step request.
    ///
    /// Parks the session again once every request is acknowledged.
    pub fn complete_unit(&self) {
        let mut inner = self.lock();
        inner.units_completed = inner.units_completed.saturating_add(1);
        if inner.step_requests > inner.steps_acknowledged {
            inner.steps_acknowledged = inner.steps_acknowledged.saturating_add(1);
            if inner.state == ControlState::Stepping && inner.step_requests == inner.steps_acknowledged {
                inner.state = ControlState::Paused;
            }
        }
        self.changed.notify_all();
    }

    /// Sleep up to `delay` while running; returns early on any transition.
    pub fn pace(&self, delay: Duration) {
        let deadline = Instant::now().checked_add(delay);
        let mut inner = self.lock();
        while inner.state == ControlState::Running {
            let now = Instant::now();
            let Some(remaining) = deadline.and_then(|d| d.checked_duration_since(now)) else {
                return;
            };
            if remaining.is_zero() {
                return;
            }
            inner = self
                .changed
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
