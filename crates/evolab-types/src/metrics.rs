//! Metric rows reported by simulation plugins.
//!
//! A metric row is an ordered map from metric name to value. `BTreeMap`
//! keeps key order stable so serialized rows and checkpoint payloads are
//! byte-identical across runs.

use std::collections::BTreeMap;

/// One row of scalar metrics, keyed by metric name.
pub type MetricRow = BTreeMap<String, f64>;

/// Keep only finite values from a metric row.
///
/// NaN and infinities cannot be represented in the JSON-lines metrics log,
/// so they are dropped before a row enters any history.
pub fn sanitize_metrics(row: &MetricRow) -> MetricRow {
    row.iter()
        .filter(|(_, value)| value.is_finite())
        .map(|(key, value)| (key.clone(), *value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_drops_non_finite_values() {
        let mut row = MetricRow::new();
        row.insert("mean_fitness".to_owned(), 0.5);
        row.insert("broken".to_owned(), f64::NAN);
        row.insert("overflow".to_owned(), f64::INFINITY);

        let clean = sanitize_metrics(&row);
        assert_eq!(clean.len(), 1);
        assert_eq!(clean.get("mean_fitness").copied(), Some(0.5));
    }

    #[test]
    fn sanitize_keeps_empty_row_empty() {
        assert!(sanitize_metrics(&MetricRow::new()).is_empty());
    }
}
