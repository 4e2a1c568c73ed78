//! Wall-clock helpers.
//!
//! Timestamps are informational only (frame and checkpoint stamps); no
//! simulation decision ever depends on them.

use chrono::Utc;

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn unix_timestamp() -> f64 {
    let micros = Utc::now().timestamp_micros();
    #[allow(clippy::cast_precision_loss)]
    let seconds = micros as f64 / 1_000_000.0;
    seconds
}
