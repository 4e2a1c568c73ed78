//! Versioned checkpoints and their on-disk store.
//!
//! A [`Checkpoint`] captures everything needed to resume a run at a given
//! step: plugin population and environment payloads, the last metrics, and
//! the full RNG state. Checkpoints are written once and never updated.
//!
//! # On-disk layout
//!
//! ```text
//! <experiment_dir>/checkpoints/shard_000000/gen_00000010.chk
//! <experiment_dir>/checkpoints/shard_000001/gen_00001000.chk
//! ```
//!
//! Shards bucket 1000 steps each. Both numbers are zero-padded so that
//! lexicographic and numeric order coincide.
//!
//! # Background writes
//!
//! ```text
//! Simulation Thread                   Writer Thread
//! ─────────────────                   ─────────────
//! build Checkpoint
//!   └─> submit() ───── channel ─────> save() (temp file + rename)
//! continue stepping                     └─> publish checkpoint_saved
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use evolab_types::{MetricRow, sanitize_metrics};

use crate::event_bus::{BusEvent, EventBus};
use crate::rng::RngSnapshot;

/// Schema version written into and expected from every checkpoint.
pub const SCHEMA_VERSION: &str = "v1";

/// Number of steps per shard directory.
pub const SHARD_SIZE: u64 = 1000;

/// Name of the checkpoint subtree inside an experiment directory.
const CHECKPOINT_DIR: &str = "checkpoints";

/// File extension of checkpoint files.
const CHECKPOINT_EXT: &str = "chk";

/// Errors raised by checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The file carries a schema version this build does not read.
    #[error("checkpoint schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        /// Version this store reads.
        expected: String,
        /// Version found in the file.
        found: String,
    },

    /// Filesystem access failed.
    #[error("checkpoint I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The file is not a valid checkpoint record.
    #[error("failed to decode checkpoint: {source}")]
    Decode {
        /// The underlying decode error.
        #[from]
        source: serde_json::Error,
    },

    /// The checkpoint could not be serialized.
    #[error("failed to encode checkpoint: {source}")]
    Encode {
        /// The underlying encode error.
        source: serde_json::Error,
    },

    /// The background writer thread is gone.
    #[error("checkpoint writer thread has died")]
    WriterDied,
}

/// Immutable snapshot of simulator and plugin state at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Generation counter at capture time.
    pub generation_index: u64,
    /// Step counter at capture time.
    pub step_index: u64,
    /// Plugin-defined population payload.
    pub population_state: Value,
    /// Plugin-defined environment payload.
    pub environment_state: Value,
    /// Metrics observed at this step.
    pub metrics: MetricRow,
    /// Full RNG state.
    pub rng_state: RngSnapshot,
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    /// Schema version of the record.
    pub schema_version: String,
}

/// Reads and writes checkpoint files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointStore {
    expected_version: String,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStore {
    /// Store that reads and writes [`SCHEMA_VERSION`].
    pub fn new() -> Self {
        Self::with_version(SCHEMA_VERSION)
    }

    /// Store that expects a specific schema version.
    pub fn with_version(version: &str) -> Self {
        Self {
            expected_version: version.to_owned(),
        }
    }

    /// Schema version this store expects.
    pub fn expected_version(&self) -> &str {
        &self.expected_version
    }

    /// Deterministic path of the checkpoint for `step_index`.
    pub fn checkpoint_path(experiment_dir: &Path, step_index: u64) -> PathBuf {
        let shard = step_index.checked_div(SHARD_SIZE).unwrap_or(0);
        experiment_dir
            .join(CHECKPOINT_DIR)
            .join(format!("shard_{shard:06}"))
            .join(format!("gen_{step_index:08}.{CHECKPOINT_EXT}"))
    }

    /// Step index encoded in a checkpoint file name, if it follows the layout.
    pub fn step_from_path(path: &Path) -> Option<u64> {
        path.file_stem()?
            .to_str()?
            .strip_prefix("gen_")?
            .parse()
            .ok()
    }

    /// Write `checkpoint` to `path` atomically.
    ///
    /// The record is written to a sibling temp file, synced, and renamed
    /// over the final name, so a reader never observes a partial file.
    pub fn save(&self, checkpoint: &Checkpoint, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // JSON has no NaN or infinity; a non-finite metric would come back
        // as `null` and make the record unreadable.
        let encoded = if checkpoint.metrics.values().all(|v| v.is_finite()) {
            serde_json::to_vec(checkpoint)
        } else {
            serde_json::to_vec(&Checkpoint {
                metrics: sanitize_metrics(&checkpoint.metrics),
                ..checkpoint.clone()
            })
        };
        let bytes = encoded.map_err(|source| CheckpointError::Encode { source })?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;

        debug!(path = %path.display(), step_index = checkpoint.step_index, "checkpoint saved");
        Ok(())
    }

    /// Read and validate the checkpoint at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::SchemaMismatch`] when the stored version
    /// differs from [`expected_version`](Self::expected_version). Records
    /// are never migrated.
    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let bytes = fs::read(path)?;
        let raw: Value = serde_json::from_slice(&bytes)?;
        let found = raw
            .get("schema_version")
            .and_then(Value::as_str)
            .unwrap_or("<missing>");
        if found != self.expected_version {
            return Err(CheckpointError::SchemaMismatch {
                expected: self.expected_version.clone(),
                found: found.to_owned(),
            });
        }
        Ok(Checkpoint::deserialize(raw)?)
    }

    /// Every checkpoint file under `<experiment_dir>/checkpoints`, sorted by path.
    pub fn list_checkpoints(experiment_dir: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
        let root = experiment_dir.join(CHECKPOINT_DIR);
        let mut found = Vec::new();
        if root.is_dir() {
            collect_checkpoints(&root, &mut found)?;
        }
        found.sort();
        Ok(found)
    }
}

fn collect_checkpoints(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), CheckpointError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_checkpoints(&path, found)?;
        } else if path.extension().is_some_and(|ext| ext == CHECKPOINT_EXT) {
            found.push(path);
        }
    }
    Ok(())
}

/// A queued write.
struct WriteJob {
    checkpoint: Checkpoint,
    path: PathBuf,
}

/// Single background thread that persists checkpoints in submission order.
///
/// Submitting never blocks on disk I/O. [`drain`](Self::drain) (also run on
/// drop) closes the queue and waits for every pending write.
pub struct CheckpointWriter {
    tx: Option<Sender<WriteJob>>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointWriter {
    /// Start the writer thread.
    ///
    /// When `bus` is set, a `checkpoint_saved` event is published after each
    /// successful write.
    pub fn spawn(store: CheckpointStore, bus: Option<Arc<EventBus>>) -> Result<Self, CheckpointError> {
        let (tx, rx) = channel();
        let handle = thread::Builder::new()
            .name("evolab-checkpoint-writer".to_owned())
            .spawn(move || writer_loop(&store, bus.as_deref(), &rx))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue `checkpoint` for writing to `path`.
    pub fn submit(&self, checkpoint: Checkpoint, path: PathBuf) -> Result<(), CheckpointError> {
        let tx = self.tx.as_ref().ok_or(CheckpointError::WriterDied)?;
        tx.send(WriteJob { checkpoint, path })
            .map_err(|_closed| CheckpointError::WriterDied)
    }

    /// Close the queue and block until every pending write finished.
    pub fn drain(&mut self) -> Result<(), CheckpointError> {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            debug!("waiting for checkpoint writer to finish");
            handle.join().map_err(|_panic| CheckpointError::WriterDied)?;
        }
        Ok(())
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            error!(error = %e, "checkpoint writer did not shut down cleanly");
        }
    }
}

impl core::fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("open", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

fn writer_loop(store: &CheckpointStore, bus: Option<&EventBus>, rx: &Receiver<WriteJob>) {
    info!("checkpoint writer started");
    while let Ok(job) = rx.recv() {
        let step_index = job.checkpoint.step_index;
        match store.save(&job.checkpoint, &job.path) {
            Ok(()) => {
                if let Some(bus) = bus {
                    bus.publish(BusEvent::CheckpointSaved {
                        path: job.path,
                        step_index,
                    });
                }
            }
            Err(e) => {
                error!(
                    path = %job.path.display(),
                    step_index,
                    error = %e,
                    "failed to write checkpoint"
                );
            }
        }
    }
    info!("checkpoint writer shutting down");
}
