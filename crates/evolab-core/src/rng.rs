//! Deterministic random number container.
//!
//! A [`DeterministicRng`] owns one default stream plus any number of named
//! sub-streams. Each named stream is seeded from `sha256("{seed}:{name}")`
//! so that stream seeds are stable across processes and platforms, and
//! isolated from each other: drawing from `"movement"` never perturbs
//! `"mating"`.
//!
//! The full generator state (not just seeds) is captured in an
//! [`RngSnapshot`]; restoring a snapshot reproduces the exact continuation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Error returned when an RNG snapshot blob cannot be decoded.
#[derive(Debug, thiserror::Error)]
#[error("invalid RNG state blob: {source}")]
pub struct StateDecodeError {
    /// The underlying decode error.
    #[from]
    pub source: serde_json::Error,
}

/// Complete serializable state of a [`DeterministicRng`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngSnapshot {
    /// Base seed the container was created with.
    pub seed: u64,
    /// State of the default stream.
    pub default_stream: ChaCha8Rng,
    /// State of every named stream created so far.
    pub streams: BTreeMap<String, ChaCha8Rng>,
}

/// Seeded random container with named, independently derived sub-streams.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    seed: u64,
    default_stream: ChaCha8Rng,
    streams: BTreeMap<String, ChaCha8Rng>,
}

impl DeterministicRng {
    /// Create a container seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            default_stream: ChaCha8Rng::seed_from_u64(seed),
            streams: BTreeMap::new(),
        }
    }

    /// Base seed of this container.
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// The default stream.
    pub const fn default_stream(&mut self) -> &mut ChaCha8Rng {
        &mut self.default_stream
    }

    /// Return the named stream, creating it on first use.
    pub fn stream(&mut self, name: &str) -> &mut ChaCha8Rng {
        let seed = self.seed;
        self.streams
            .entry(name.to_owned())
            .or_insert_with(|| ChaCha8Rng::seed_from_u64(derive_stream_seed(seed, name)))
    }

    /// Export the full state of every stream.
    pub fn snapshot(&self) -> RngSnapshot {
        RngSnapshot {
            seed: self.seed,
            default_stream: self.default_stream.clone(),
            streams: self.streams.clone(),
        }
    }

    /// Replace all internal state with `snapshot`.
    pub fn restore(&mut self, snapshot: &RngSnapshot) {
        self.seed = snapshot.seed;
        self.default_stream = snapshot.default_stream.clone();
        self.streams.clone_from(&snapshot.streams);
    }

    /// Decode a JSON snapshot blob and restore from it.
    ///
    /// On failure the container is left untouched.
    pub fn restore_blob(&mut self, blob: &serde_json::Value) -> Result<(), StateDecodeError> {
        let snapshot = RngSnapshot::deserialize(blob)?;
        self.restore(&snapshot);
        Ok(())
    }

    /// Rewind to the freshly seeded state, discarding named streams.
    pub fn reseed(&mut self) {
        *self = Self::new(self.seed);
    }
}

/// Derive the seed of a named stream from the base seed.
///
/// Uses the first eight bytes of `sha256("{seed}:{name}")`, big-endian.
pub fn derive_stream_seed(seed: u64, name: &str) -> u64 {
    let digest = Sha256::digest(format!("{seed}:{name}").as_bytes());
    let mut prefix = [0_u8; 8];
    for (slot, byte) in prefix.iter_mut().zip(digest.iter()) {
        *slot = *byte;
    }
    u64::from_be_bytes(prefix)
}

/// Shared handle to the RNG owned by a simulator.
///
/// The simulator and its plugin hold clones of the same handle, so a
/// checkpoint restore performed by the simulator is immediately visible to
/// the plugin's next draw.
#[derive(Debug, Clone)]
pub struct RngHandle {
    inner: Arc<Mutex<DeterministicRng>>,
}

impl RngHandle {
    /// Wrap a fresh container seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeterministicRng::new(seed))),
        }
    }

    /// Lock the container for a sequence of draws.
    pub fn lock(&self) -> MutexGuard<'_, DeterministicRng> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the locked container.
    pub fn with<R>(&self, f: impl FnOnce(&mut DeterministicRng) -> R) -> R {
        f(&mut self.lock())
    }

    /// Export a snapshot of the shared container.
    pub fn snapshot(&self) -> RngSnapshot {
        self.lock().snapshot()
    }

    /// Restore the shared container from a snapshot.
    pub fn restore(&self, snapshot: &RngSnapshot) {
        self.lock().restore(snapshot);
    }

    /// Rewind the shared container to its seed.
    pub fn reseed(&self) {
        self.lock().reseed();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rand::{Rng, RngCore};

    use super::*;

    fn draw(rng: &mut ChaCha8Rng, count: usize) -> Vec<u64> {
        (0..count).map(|_| rng.next_u64()).collect()
    }

    #[test]
    fn same_seed_same_named_sequence() {
        let mut a = DeterministicRng::new(42);
        let mut b = DeterministicRng::new(42);
        assert_eq!(draw(a.stream("x"), 16), draw(b.stream("x"), 16));
    }

    #[test]
    fn named_streams_are_isolated() {
        let mut a = DeterministicRng::new(7);
        let mut b = DeterministicRng::new(7);

        let _ = draw(a.stream("movement"), 100);
        assert_eq!(draw(a.stream("mating"), 8), draw(b.stream("mating"), 8));
        assert_ne!(draw(a.stream("movement"), 1), draw(a.stream("mating"), 1));
    }

    #[test]
    fn stream_seed_is_stable() {
        assert_eq!(derive_stream_seed(1, "a"), derive_stream_seed(1, "a"));
        assert_ne!(derive_stream_seed(1, "a"), derive_stream_seed(2, "a"));
        assert_ne!(derive_stream_seed(1, "a"), derive_stream_seed(1, "b"));
    }

    #[test]
    fn snapshot_restore_reproduces_continuation() {
        let mut rng = DeterministicRng::new(99);
        let _ = draw(rng.default_stream(), 5);
        let _ = draw(rng.stream("env"), 3);

        let snapshot = rng.snapshot();
        let expected_default = draw(rng.default_stream(), 10);
        let expected_env: Vec<f64> = (0..10).map(|_| rng.stream("env").random()).collect();

        rng.restore(&snapshot);
        assert_eq!(draw(rng.default_stream(), 10), expected_default);
        let replayed_env: Vec<f64> = (0..10).map(|_| rng.stream("env").random()).collect();
        assert_eq!(replayed_env, expected_env);
    }

    #[test]
    fn snapshot_survives_json_blob() {
        let mut rng = DeterministicRng::new(5);
        let _ = draw(rng.stream("x"), 4);
        let blob = serde_json::to_value(rng.snapshot()).unwrap();
        let expected = draw(rng.stream("x"), 4);

        let mut restored = DeterministicRng::new(0);
        restored.restore_blob(&blob).unwrap();
        assert_eq!(restored.seed(), 5);
        assert_eq!(draw(restored.stream("x"), 4), expected);
    }

    #[test]
    fn corrupt_blob_is_rejected() {
        let mut rng = DeterministicRng::new(3);
        let before = rng.snapshot();
        let result = rng.restore_blob(&serde_json::json!({"seed": "nope"}));
        assert!(result.is_err());
        assert_eq!(rng.snapshot(), before);
    }

    #[test]
    fn handle_restore_is_shared_between_clones() {
        let handle = RngHandle::new(11);
        let plugin_view = handle.clone();
        let snapshot = handle.snapshot();
        let first = plugin_view.with(|rng| rng.default_stream().next_u64());

        handle.restore(&snapshot);
        let again = plugin_view.with(|rng| rng.default_stream().next_u64());
        assert_eq!(first, again);
    }
}
