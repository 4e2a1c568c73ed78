//! Persistence collaborator for generation-mode sessions.
//!
//! A session announces an experiment once, then logs one metrics row per
//! generation. The coordinator reads rows back through the same trait when
//! its in-memory history is stale.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use evolab_core::clock::unix_timestamp;
use evolab_types::MetricRow;

/// Errors raised by a metrics sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Filesystem failure.
    #[error("metrics sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded.
    #[error("failed to encode sink record: {source}")]
    Encode {
        /// The underlying encode error.
        source: serde_json::Error,
    },
}

/// Where a session persists its per-generation metrics.
pub trait MetricsSink: Send + Sync {
    /// Register a new experiment and return its sink-side id.
    fn start_experiment(&self, config: &Value, seed: u64, metadata: &Value) -> Result<String, SinkError>;

    /// Record the metrics of one generation.
    fn log_metrics(&self, experiment_id: &str, generation_index: u64, metrics: &MetricRow) -> Result<(), SinkError>;

    /// Every row of `experiment_id`, ordered by generation.
    fn fetch_metrics(&self, experiment_id: &str) -> Result<Vec<MetricRow>, SinkError>;

    /// Id of the most recently started experiment, if any.
    fn latest_experiment_id(&self) -> Result<Option<String>, SinkError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SinkRecord {
    Experiment {
        experiment_id: String,
        config: Value,
        seed: u64,
        metadata: Value,
        created_at: f64,
    },
    Metrics {
        experiment_id: String,
        generation_index: u64,
        metrics: MetricRow,
    },
}

/// File-backed sink: one tagged JSON record per line.
///
/// Several handles may point at the same file; each append is a single
/// write to a file opened in append mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlMetricsSink {
    path: PathBuf,
}

impl JsonlMetricsSink {
    /// Sink writing to `path`; the file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &SinkRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(record).map_err(|source| SinkError::Encode { source })?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<SinkRecord>, SinkError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SinkRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %self.path.display(), error = %e, "skipping unreadable sink record"),
            }
        }
        Ok(records)
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn start_experiment(&self, config: &Value, seed: u64, metadata: &Value) -> Result<String, SinkError> {
        let experiment_id = uuid::Uuid::new_v4().to_string();
        self.append(&SinkRecord::Experiment {
            experiment_id: experiment_id.clone(),
            config: config.clone(),
            seed,
            metadata: metadata.clone(),
            created_at: unix_timestamp(),
        })?;
        Ok(experiment_id)
    }

    fn log_metrics(&self, experiment_id: &str, generation_index: u64, metrics: &MetricRow) -> Result<(), SinkError> {
        self.append(&SinkRecord::Metrics {
            experiment_id: experiment_id.to_owned(),
            generation_index,
            metrics: metrics.clone(),
        })
    }

    fn fetch_metrics(&self, experiment_id: &str) -> Result<Vec<MetricRow>, SinkError> {
        let mut rows: Vec<(u64, MetricRow)> = self
            .records()?
            .into_iter()
            .filter_map(|record| match record {
                SinkRecord::Metrics {
                    experiment_id: id,
                    generation_index,
                    metrics,
                } if id == experiment_id => Some((generation_index, metrics)),
                SinkRecord::Metrics { .. } | SinkRecord::Experiment { .. } => None,
            })
            .collect();
        rows.sort_by_key(|(generation_index, _)| *generation_index);
        Ok(rows.into_iter().map(|(_, metrics)| metrics).collect())
    }

    fn latest_experiment_id(&self) -> Result<Option<String>, SinkError> {
        Ok(self.records()?.into_iter().rev().find_map(|record| match record {
            SinkRecord::Experiment { experiment_id, .. } => Some(experiment_id),
            SinkRecord::Metrics { .. } => None,
        }))
    }
}
