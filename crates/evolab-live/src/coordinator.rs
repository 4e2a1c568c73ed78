//! Registry of concurrent live experiments.
//!
//! The coordinator owns one record and one [`LiveSession`] per experiment.
//! Every session folds its events into its record through a callback that
//! holds only a weak reference back to the coordinator state, so dropping
//! the coordinator never waits on a session.
//!
//! Lock order is coordinator state, then session control. Callbacks take
//! the coordinator lock and may read a session's control state; they never
//! call back into coordinator methods. Durable appends happen after the
//! lock is released.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use evolab_core::{
    CheckpointStore, ConfigError, PluginRegistry, RuntimeConfig, RuntimeOverrides, Simulator,
    SimulatorError, SimulatorOptions,
};
use evolab_types::{ExperimentId, ExperimentStatus, MetricRow, RenderState, SessionEvent, SessionMode};

use crate::analytics::{AnalyticsPool, Overlay, Summary, build_overlay, build_summary};
use crate::metrics_log::{MetricsLog, MetricsLogError};
use crate::session::{LiveSession, SessionError, SessionSettings, UpdateCallback};
use crate::sink::{JsonlMetricsSink, MetricsSink};

/// History length beyond which the in-memory buffer is halved.
pub const MAX_HISTORY_POINTS: usize = 4000;

/// Age under which a running session's in-memory history is served as is.
const HISTORY_STALENESS: Duration = Duration::from_millis(500);

/// How long stop and delete wait for a worker to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised when starting experiments.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Filesystem failure while preparing artifacts.
    #[error("coordinator I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The runtime config could not be loaded, validated, or written.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The simulator could not be constructed.
    #[error(transparent)]
    Simulator(#[from] SimulatorError),

    /// The metrics log could not be created.
    #[error(transparent)]
    MetricsLog(#[from] MetricsLogError),

    /// The session worker could not be started.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// One row of [`ExperimentCoordinator::list_experiments`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentListing {
    /// Experiment id.
    pub experiment_id: ExperimentId,
    /// Lifecycle status.
    pub status: ExperimentStatus,
    /// Session kind.
    pub mode: SessionMode,
    /// Plugin name; doubles as the environment filter key.
    pub simulation: String,
    /// Configured population size.
    pub population_size: u32,
    /// Configured mutation rate.
    pub mutation_rate: f64,
    /// Base seed.
    pub seed: u64,
    /// Planned number of units.
    pub steps: u64,
    /// Source config file of a plugin experiment.
    pub config_path: Option<PathBuf>,
    /// Last error message, empty when none.
    pub error: String,
    /// Aggregates over the metric history.
    #[serde(flatten)]
    pub summary: Summary,
}

impl ExperimentListing {
    /// Numeric value of `metric` on this row, `0.0` when absent.
    pub fn metric(&self, metric: &str) -> f64 {
        match metric {
            "population_size" => f64::from(self.population_size),
            "mutation_rate" => self.mutation_rate,
            "seed" => lossy_f64(self.seed),
            "steps" => lossy_f64(self.steps),
            other => self.summary.get(other).copied().unwrap_or(0.0),
        }
    }
}

/// Durable history source of one record.
#[derive(Debug, Clone)]
enum HistorySource {
    Log(MetricsLog),
    Sink {
        sink: JsonlMetricsSink,
        sink_experiment_id: Option<String>,
    },
}

#[derive(Debug)]
struct ExperimentRecord {
    sequence: u64,
    mode: SessionMode,
    status: ExperimentStatus,
    config: RuntimeConfig,
    planned_steps: u64,
    config_path: Option<PathBuf>,
    runtime_config_path: Option<PathBuf>,
    checkpoint_dir: Option<PathBuf>,
    source: HistorySource,
    last_error: Option<String>,
    history: Vec<MetricRow>,
    refreshed_at: Option<Instant>,
    latest_render_state: Option<RenderState>,
}

impl ExperimentRecord {
    fn listing(&self, id: &ExperimentId, history: &[MetricRow]) -> ExperimentListing {
        ExperimentListing {
            experiment_id: id.clone(),
            status: self.status,
            mode: self.mode,
            simulation: self.config.simulation.clone(),
            population_size: self.config.evolution.population_size,
            mutation_rate: self.config.evolution.mutation_rate,
            seed: self.config.seed(),
            steps: self.planned_steps,
            config_path: self.config_path.clone(),
            error: self.last_error.clone().unwrap_or_default(),
            summary: build_summary(history),
        }
    }

    fn artifact_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        match &self.source {
            HistorySource::Log(log) => paths.push(log.path().to_path_buf()),
            HistorySource::Sink { sink, .. } => paths.push(sink.path().to_path_buf()),
        }
        paths.extend(self.runtime_config_path.iter().cloned());
        paths
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    next_sequence: u64,
    records: HashMap<ExperimentId, ExperimentRecord>,
    sessions: HashMap<ExperimentId, Arc<LiveSession>>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<CoordinatorState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one session event into the record of `id`.
    fn apply_event(&self, id: &ExperimentId, event: &SessionEvent) {
        let pending_append = {
            let mut state = self.lock();
            let paused = state.sessions.get(id).is_some_and(|s| s.is_paused());
            let Some(record) = state.records.get_mut(id) else {
                return;
            };
            match event {
                SessionEvent::Generation {
                    metrics,
                    render_state,
                    logger_experiment_id,
                    ..
                } => {
                    record.status = if paused {
                        ExperimentStatus::Paused
                    } else {
                        ExperimentStatus::Running
                    };
                    if let (HistorySource::Sink { sink_experiment_id, .. }, Some(sink_id)) =
                        (&mut record.source, logger_experiment_id)
                    {
                        *sink_experiment_id = Some(sink_id.clone());
                    }
                    record.history.push(metrics.clone());
                    record.refreshed_at = Some(Instant::now());
                    if record.history.len() > MAX_HISTORY_POINTS {
                        record.history = record.history.iter().step_by(2).cloned().collect();
                    }
                    if let Some(frame) = render_state {
                        record.latest_render_state = Some(frame.as_ref().clone());
                    }
                    match &record.source {
                        HistorySource::Log(log) => Some((log.clone(), metrics.clone())),
                        HistorySource::Sink { .. } => None,
                    }
                }
                SessionEvent::Complete { stopped, .. } => {
                    record.status = if *stopped {
                        ExperimentStatus::Stopped
                    } else {
                        ExperimentStatus::Completed
                    };
                    None
                }
                SessionEvent::Error { message, .. } => {
                    record.status = ExperimentStatus::Failed;
                    record.last_error = Some(message.clone());
                    None
                }
                SessionEvent::Started { .. } => {
                    record.status = if paused {
                        ExperimentStatus::Paused
                    } else {
                        ExperimentStatus::Running
                    };
                    None
                }
            }
        };

        if let Some((log, row)) = pending_append
            && let Err(e) = log.append(&row)
        {
            warn!(experiment_id = %id, path = %log.path().display(), error = %e, "failed to append metrics row");
        }
    }
}

/// Runs and tracks many live experiments at once.
#[derive(Debug)]
pub struct ExperimentCoordinator {
    shared: Arc<Shared>,
    registry: Arc<PluginRegistry>,
    base_dir: PathBuf,
    analytics: AnalyticsPool,
    base_delay: Option<Duration>,
}

impl ExperimentCoordinator {
    /// Coordinator writing artifacts under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, registry: Arc<PluginRegistry>) -> Result<Self, CoordinatorError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            shared: Arc::new(Shared::default()),
            registry,
            base_dir,
            analytics: AnalyticsPool::new(2)?,
            base_delay: None,
        })
    }

    /// Override the inter-unit delay of sessions started from now on.
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = Some(base_delay);
        self
    }

    /// Directory experiment artifacts are written under.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Start a generation-mode experiment persisting through a metrics sink.
    pub fn start_experiment(
        &self,
        config: RuntimeConfig,
        generations: u64,
        speed: f64,
    ) -> Result<ExperimentId, CoordinatorError> {
        config.validate()?;
        let mode = SessionMode::Generation;
        let id = ExperimentId::generate(mode.id_prefix());
        let sink = JsonlMetricsSink::new(self.base_dir.join(format!("{id}_sink.jsonl")));
        let simulator = Simulator::new(config.clone(), &self.registry, SimulatorOptions::default())?;

        let record = ExperimentRecord {
            sequence: 0,
            mode,
            status: ExperimentStatus::Running,
            config,
            planned_steps: generations,
            config_path: None,
            runtime_config_path: None,
            checkpoint_dir: None,
            source: HistorySource::Sink {
                sink: sink.clone(),
                sink_experiment_id: None,
            },
            last_error: None,
            history: Vec::new(),
            refreshed_at: None,
            latest_render_state: None,
        };
        let sink: Arc<dyn MetricsSink> = Arc::new(sink);
        self.launch(id, record, simulator, SessionSettings::new(mode, generations), Some(sink), speed)
    }

    /// Start a plugin-mode experiment from a config file.
    ///
    /// The overridden config is written next to the metrics log as a runtime
    /// copy, and the session is built from that copy. Checkpoints land in
    /// `<base>/<id>/checkpoints` on the config's cadence.
    pub fn start_plugin_experiment(
        &self,
        config_path: &Path,
        steps: u64,
        speed: f64,
        overrides: &RuntimeOverrides,
    ) -> Result<ExperimentId, CoordinatorError> {
        let mut config = RuntimeConfig::from_file(config_path)?;
        config.apply_overrides(overrides);
        config.validate()?;

        let mode = SessionMode::Plugin;
        let id = ExperimentId::generate(mode.id_prefix());
        let steps = steps.max(1);
        let runtime_config_path = self.base_dir.join(format!("{id}_runtime.yaml"));
        config.write_to(&runtime_config_path)?;
        let log = MetricsLog::create(self.base_dir.join(format!("{id}_metrics.jsonl")))?;
        let checkpoint_dir = self.base_dir.join(id.as_str());

        let simulator = Simulator::from_config_path(
            &runtime_config_path,
            &self.registry,
            SimulatorOptions {
                event_bus: None,
                experiment_dir: Some(checkpoint_dir.clone()),
                store: CheckpointStore::new(),
            },
        )?;

        let record = ExperimentRecord {
            sequence: 0,
            mode,
            status: ExperimentStatus::Running,
            config,
            planned_steps: steps,
            config_path: Some(config_path.to_path_buf()),
            runtime_config_path: Some(runtime_config_path),
            checkpoint_dir: Some(checkpoint_dir),
            source: HistorySource::Log(log),
            last_error: None,
            history: Vec::new(),
            refreshed_at: None,
            latest_render_state: None,
        };
        self.launch(id, record, simulator, SessionSettings::new(mode, steps), None, speed)
    }

    fn launch(
        &self,
        id: ExperimentId,
        mut record: ExperimentRecord,
        simulator: Simulator,
        settings: SessionSettings,
        sink: Option<Arc<dyn MetricsSink>>,
        speed: f64,
    ) -> Result<ExperimentId, CoordinatorError> {
        let settings = self.base_delay.map_or(settings, |delay| settings.with_base_delay(delay));
        let session = Arc::new(LiveSession::new(
            id.clone(),
            simulator,
            settings,
            sink,
            self.update_callback(id.clone()),
        ));
        session.set_speed(speed);

        {
            let mut state = self.shared.lock();
            record.sequence = state.next_sequence;
            state.next_sequence = state.next_sequence.saturating_add(1);
            state.records.insert(id.clone(), record);
            state.sessions.insert(id.clone(), Arc::clone(&session));
        }

        if let Err(e) = session.start() {
            let mut state = self.shared.lock();
            if let Some(record) = state.records.get_mut(&id) {
                record.status = ExperimentStatus::Failed;
                record.last_error = Some(e.to_string());
            }
            return Err(e.into());
        }
        info!(experiment_id = %id, mode = ?settings.mode, units = settings.total_units, "experiment started");
        Ok(id)
    }

    fn update_callback(&self, id: ExperimentId) -> UpdateCallback {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Arc::new(move |event: &SessionEvent| {
            if let Some(shared) = shared.upgrade() {
                shared.apply_event(&id, event);
            }
        })
    }

    fn session(&self, id: &ExperimentId) -> Option<Arc<LiveSession>> {
        self.shared.lock().sessions.get(id).cloned()
    }

    /// Every tracked experiment in start order, with summaries.
    pub fn list_experiments(&self) -> Vec<ExperimentListing> {
        let mut ids: Vec<(u64, ExperimentId)> = self
            .shared
            .lock()
            .records
            .iter()
            .map(|(id, record)| (record.sequence, id.clone()))
            .collect();
        ids.sort_by_key(|(sequence, _)| *sequence);

        ids.into_iter()
            .filter_map(|(_, id)| {
                let history = self.get_metrics_history(&id);
                let state = self.shared.lock();
                state.records.get(&id).map(|record| record.listing(&id, &history))
            })
            .collect()
    }

    /// Latest attached render frame of `id`.
    pub fn get_render_state(&self, id: &ExperimentId) -> Option<RenderState> {
        self.shared
            .lock()
            .records
            .get(id)
            .and_then(|record| record.latest_render_state.clone())
    }

    /// Current status of `id`.
    pub fn status(&self, id: &ExperimentId) -> Option<ExperimentStatus> {
        self.shared.lock().records.get(id).map(|record| record.status)
    }

    /// Last error recorded for `id`.
    pub fn last_error(&self, id: &ExperimentId) -> Option<String> {
        self.shared
            .lock()
            .records
            .get(id)
            .and_then(|record| record.last_error.clone())
    }

    /// Checkpoint directory of a plugin experiment.
    pub fn checkpoint_dir(&self, id: &ExperimentId) -> Option<PathBuf> {
        self.shared
            .lock()
            .records
            .get(id)
            .and_then(|record| record.checkpoint_dir.clone())
    }

    /// Metric history of `id` in unit order.
    ///
    /// A running session refreshed within the staleness window is served
    /// from memory; otherwise the durable copy is reloaded and replaces the
    /// in-memory buffer when it has rows.
    pub fn get_metrics_history(&self, id: &ExperimentId) -> Vec<MetricRow> {
        let (source, fallback) = {
            let state = self.shared.lock();
            let Some(record) = state.records.get(id) else {
                return Vec::new();
            };
            let fresh = record.status == ExperimentStatus::Running
                && !record.history.is_empty()
                && record.refreshed_at.is_some_and(|at| at.elapsed() < HISTORY_STALENESS);
            if fresh {
                return record.history.clone();
            }
            (record.source.clone(), record.history.clone())
        };

        let rows = match read_durable_history(&source) {
            Ok(rows) => rows,
            Err(reason) => {
                warn!(experiment_id = %id, error = %reason, "failed to reload metric history");
                return fallback;
            }
        };
        if rows.is_empty() {
            return fallback;
        }
        let mut state = self.shared.lock();
        if let Some(record) = state.records.get_mut(id) {
            record.history.clone_from(&rows);
            record.refreshed_at = Some(Instant::now());
        }
        rows
    }

    /// Park `id` after its current unit.
    ///
    /// The session is paused while the coordinator lock is held, so an
    /// event folded after this call sees the parked control state.
    pub fn pause_experiment(&self, id: &ExperimentId) {
        let mut state = self.shared.lock();
        if let Some(session) = state.sessions.get(id) {
            session.pause();
        }
        if let Some(record) = state.records.get_mut(id)
            && matches!(record.status, ExperimentStatus::Running | ExperimentStatus::Queued)
        {
            record.status = ExperimentStatus::Paused;
        }
    }

    /// Let a parked `id` run automatically again.
    pub fn resume_experiment(&self, id: &ExperimentId) {
        let mut state = self.shared.lock();
        if let Some(session) = state.sessions.get(id) {
            session.resume();
        }
        if let Some(record) = state.records.get_mut(id)
            && record.status == ExperimentStatus::Paused
        {
            record.status = ExperimentStatus::Running;
        }
    }

    /// Whether `id` is parked.
    pub fn is_experiment_paused(&self, id: &ExperimentId) -> bool {
        let state = self.shared.lock();
        if state.records.get(id).is_some_and(|r| r.status == ExperimentStatus::Paused) {
            return true;
        }
        state.sessions.get(id).is_some_and(|s| s.is_paused())
    }

    /// Scale the inter-unit delay of `id`.
    pub fn set_experiment_speed(&self, id: &ExperimentId, multiplier: f64) {
        if let Some(session) = self.session(id) {
            session.set_speed(multiplier);
        }
    }

    /// Advance `id` by exactly one unit; `false` if it did not happen in time.
    pub fn step_experiment(&self, id: &ExperimentId, timeout: Duration) -> bool {
        self.session(id).is_some_and(|session| session.step_once(timeout))
    }

    /// Stop `id` and wait briefly for its worker.
    pub fn stop_experiment(&self, id: &ExperimentId) {
        if let Some(session) = self.session(id) {
            session.stop();
            if !session.join(JOIN_TIMEOUT) {
                warn!(experiment_id = %id, "session worker did not exit in time");
            }
        }
    }

    /// Stop every session.
    pub fn stop_all(&self) {
        let ids: Vec<ExperimentId> = self.shared.lock().sessions.keys().cloned().collect();
        for id in &ids {
            self.stop_experiment(id);
        }
    }

    /// Stop and forget `id`; with `delete_artifacts`, remove its files.
    ///
    /// Returns `false` if no record existed. Deletion failures are logged
    /// and otherwise ignored.
    pub fn delete_experiment(&self, id: &ExperimentId, delete_artifacts: bool) -> bool {
        let (session, record) = {
            let mut state = self.shared.lock();
            (state.sessions.remove(id), state.records.remove(id))
        };
        if let Some(session) = session {
            session.stop();
            if !session.join(JOIN_TIMEOUT) {
                warn!(experiment_id = %id, "session worker did not exit in time");
            }
        }
        let Some(record) = record else {
            return false;
        };
        if delete_artifacts {
            for path in record.artifact_paths() {
                remove_file_best_effort(&path);
            }
            if let Some(dir) = &record.checkpoint_dir {
                remove_dir_best_effort(dir);
            }
        }
        info!(experiment_id = %id, delete_artifacts, "experiment deleted");
        true
    }

    /// Experiments ranked by `metric`, highest first.
    ///
    /// `environment` keeps only experiments of that plugin;
    /// `mutation_range` keeps only mutation rates within the inclusive
    /// bounds.
    pub fn leaderboard(
        &self,
        metric: &str,
        environment: Option<&str>,
        mutation_range: Option<(f64, f64)>,
    ) -> Vec<ExperimentListing> {
        let mut rows: Vec<ExperimentListing> = self
            .list_experiments()
            .into_iter()
            .filter(|row| environment.is_none_or(|env| row.simulation == env))
            .filter(|row| mutation_range.is_none_or(|(lo, hi)| row.mutation_rate >= lo && row.mutation_rate <= hi))
            .collect();
        rows.sort_by(|a, b| b.metric(metric).total_cmp(&a.metric(metric)));
        rows
    }

    /// Overlay of the in-memory histories of `ids`.
    pub fn comparison(&self, ids: &[ExperimentId], keys: &[String]) -> Overlay {
        build_overlay(&self.histories_of(ids), keys)
    }

    /// [`Self::comparison`] computed on the analytics pool.
    pub fn comparison_async(&self, ids: &[ExperimentId], keys: Vec<String>) -> oneshot::Receiver<Overlay> {
        self.analytics.overlay(self.histories_of(ids), keys)
    }

    fn histories_of(&self, ids: &[ExperimentId]) -> BTreeMap<String, Vec<MetricRow>> {
        let state = self.shared.lock();
        ids.iter()
            .map(|id| {
                let history = state
                    .records
                    .get(id)
                    .map(|record| record.history.clone())
                    .unwrap_or_default();
                (id.to_string(), history)
            })
            .collect()
    }
}

impl Drop for ExperimentCoordinator {
    fn drop(&mut self) {
        let sessions: Vec<Arc<LiveSession>> = self.shared.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.stop();
        }
    }
}

const fn lossy_f64(value: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let value = value as f64;
    value
}

fn read_durable_history(source: &HistorySource) -> Result<Vec<MetricRow>, String> {
    match source {
        HistorySource::Log(log) => log.read_all().map_err(|e| e.to_string()),
        HistorySource::Sink {
            sink,
            sink_experiment_id,
        } => {
            let sink_id = sink_experiment_id
                .clone()
                .map_or_else(|| sink.latest_experiment_id(), |sink_id| Ok(Some(sink_id)))
                .map_err(|e| e.to_string())?;
            sink_id.map_or_else(
                || Ok(Vec::new()),
                |sink_id| sink.fetch_metrics(&sink_id).map_err(|e| e.to_string()),
            )
        }
    }
}

fn remove_file_best_effort(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete experiment artifact"),
    }
}

fn remove_dir_best_effort(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete checkpoint directory"),
    }
}
