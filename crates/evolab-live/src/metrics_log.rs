//! Append-only JSON-lines metrics log.
//!
//! One line per completed unit, keys sorted, values plain floats. The file
//! is the durable copy of a plugin session's history and is re-read when
//! the in-memory buffer is stale.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use evolab_types::MetricRow;

/// Errors raised while reading or writing a metrics log.
#[derive(Debug, thiserror::Error)]
pub enum MetricsLogError {
    /// Filesystem failure.
    #[error("metrics log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not a JSON object.
    #[error("metrics log line {line} is not valid JSON: {source}")]
    Decode {
        /// One-based line number.
        line: usize,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// A row could not be encoded.
    #[error("failed to encode metrics row: {source}")]
    Encode {
        /// The underlying encode error.
        source: serde_json::Error,
    },
}

/// Handle to one JSON-lines metrics file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    /// Create (or truncate) the log file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, MetricsLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(&path)?;
        Ok(Self { path })
    }

    /// Handle to an existing log without touching its contents.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row as a single line.
    pub fn append(&self, row: &MetricRow) -> Result<(), MetricsLogError> {
        let mut line = serde_json::to_string(row).map_err(|source| MetricsLogError::Encode { source })?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read every row in file order, skipping blank lines.
    ///
    /// A missing file reads as an empty history.
    pub fn read_all(&self) -> Result<Vec<MetricRow>, MetricsLogError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let object: Map<String, Value> =
                serde_json::from_str(&line).map_err(|source| MetricsLogError::Decode {
                    line: index.saturating_add(1),
                    source,
                })?;
            rows.push(coerce_row(&object));
        }
        Ok(rows)
    }
}

/// Keep only entries that read as finite floats.
///
/// Numbers pass through, booleans become `0.0`/`1.0`, numeric strings are
/// parsed; everything else is dropped.
pub fn coerce_row(object: &Map<String, Value>) -> MetricRow {
    object
        .iter()
        .filter_map(|(key, value)| coerce_value(value).map(|v| (key.clone(), v)))
        .collect()
}

fn coerce_value(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    };
    number.filter(|v| v.is_finite())
}
