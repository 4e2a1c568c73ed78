//! Summary statistics and multi-run overlays over metric histories.
//!
//! Both builders are pure functions. [`AnalyticsPool`] runs them off the
//! caller's thread and hands the result back through a oneshot channel.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::debug;

use evolab_types::MetricRow;

/// Keys reported by the generation-level evolution metrics.
pub const FITNESS_KEYS: [&str; 4] = ["mean_fitness", "max_fitness", "diversity", "mutation_stats"];

/// Keys reported by population-style plugins.
pub const POPULATION_KEYS: [&str; 3] = ["population", "average_hunger", "average_lifespan_turns"];

/// Aggregate of one history, keyed by summary name.
pub type Summary = BTreeMap<String, f64>;

/// Per-run series plus step-aligned mean and spread across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Overlay {
    /// Metric keys in the order they were requested.
    pub keys: Vec<String>,
    /// `runs[run_id][key]` is that run's series for `key`.
    pub runs: BTreeMap<String, BTreeMap<String, Vec<f64>>>,
    /// Cross-run statistics for each key.
    pub stats: BTreeMap<String, SeriesStats>,
}

/// Step-aligned mean and population standard deviation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesStats {
    /// Mean across the runs that reach each index.
    pub mean: Vec<f64>,
    /// Population standard deviation; `0.0` where one run contributes.
    pub std: Vec<f64>,
}

/// Aggregate and derived metrics of one generation-level history.
///
/// An empty history yields every key at `0.0`. Otherwise the population
/// keys appear only when the latest row reports them.
pub fn build_summary(history: &[MetricRow]) -> Summary {
    let Some(latest) = history.last() else {
        return FITNESS_KEYS
            .iter()
            .chain(&["fitness_improvement_rate", "peak_generation", "avg_mutation_impact", "diversity_trend"])
            .chain(POPULATION_KEYS.iter())
            .map(|key| ((*key).to_owned(), 0.0))
            .collect();
    };

    let column = |key: &str| -> Vec<f64> { history.iter().map(|row| value_of(row, key)).collect() };
    let means = column("mean_fitness");
    let maxes = column("max_fitness");
    let diversities = column("diversity");
    let mutations = column("mutation_stats");

    let mut summary = Summary::new();
    summary.insert("mean_fitness".to_owned(), mean(&means));
    summary.insert("max_fitness".to_owned(), maxes.iter().copied().fold(f64::NEG_INFINITY, f64::max));
    summary.insert("diversity".to_owned(), mean(&diversities));
    summary.insert("mutation_stats".to_owned(), mean(&mutations));
    summary.insert("fitness_improvement_rate".to_owned(), trend(&means));
    summary.insert("peak_generation".to_owned(), peak_index(&maxes));
    summary.insert("avg_mutation_impact".to_owned(), mean(&mutations));
    summary.insert("diversity_trend".to_owned(), trend(&diversities));
    for key in POPULATION_KEYS {
        if let Some(value) = latest.get(key) {
            summary.insert(key.to_owned(), *value);
        }
    }
    summary
}

/// Overlay `histories` for `keys`.
///
/// With no keys, the population keys are used if any run reports one of
/// them, the fitness keys otherwise. Missing values read as `0.0`.
pub fn build_overlay(histories: &BTreeMap<String, Vec<MetricRow>>, keys: &[String]) -> Overlay {
    let keys = if keys.is_empty() {
        default_keys(histories)
    } else {
        keys.to_vec()
    };

    let runs: BTreeMap<String, BTreeMap<String, Vec<f64>>> = histories
        .iter()
        .map(|(run_id, history)| {
            let series = keys
                .iter()
                .map(|key| (key.clone(), history.iter().map(|row| value_of(row, key)).collect()))
                .collect();
            (run_id.clone(), series)
        })
        .collect();

    let stats = keys
        .iter()
        .map(|key| (key.clone(), step_stats(runs.values().filter_map(|series| series.get(key)))))
        .collect();

    Overlay { keys, runs, stats }
}

fn default_keys(histories: &BTreeMap<String, Vec<MetricRow>>) -> Vec<String> {
    let observed: BTreeSet<&str> = histories
        .values()
        .flatten()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    let chosen: &[&str] = if POPULATION_KEYS.iter().any(|key| observed.contains(key)) {
        &POPULATION_KEYS
    } else {
        &FITNESS_KEYS
    };
    chosen.iter().map(|key| (*key).to_owned()).collect()
}

fn step_stats<'a>(series: impl Iterator<Item = &'a Vec<f64>> + Clone) -> SeriesStats {
    let len = series.clone().map(Vec::len).max().unwrap_or(0);
    let mut stats = SeriesStats::default();
    for index in 0..len {
        let values: Vec<f64> = series.clone().filter_map(|s| s.get(index).copied()).collect();
        stats.mean.push(mean(&values));
        stats.std.push(if values.len() > 1 { pstdev(&values) } else { 0.0 });
    }
    stats
}

fn value_of(row: &MetricRow, key: &str) -> f64 {
    row.get(key).copied().unwrap_or(0.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let count = values.len() as f64;
    values.iter().sum::<f64>() / count
}

fn pstdev(values: &[f64]) -> f64 {
    let centre = mean(values);
    let squared: Vec<f64> = values.iter().map(|v| (v - centre).powi(2)).collect();
    mean(&squared).sqrt()
}

/// `(last - first) / max(n - 1, 1)`.
fn trend(values: &[f64]) -> f64 {
    let (Some(first), Some(last)) = (values.first(), values.last()) else {
        return 0.0;
    };
    #[allow(clippy::cast_precision_loss)]
    let span = values.len().saturating_sub(1).max(1) as f64;
    (last - first) / span
}

/// Index of the first maximum.
fn peak_index(values: &[f64]) -> f64 {
    let mut best: Option<(usize, f64)> = None;
    for (index, value) in values.iter().copied().enumerate() {
        if best.is_none_or(|(_, top)| value > top) {
            best = Some((index, value));
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let peak = best.map_or(0.0, |(index, _)| index as f64);
    peak
}

/// Small worker pool for overlay computation.
pub struct AnalyticsPool {
    runtime: Runtime,
}

impl std::fmt::Debug for AnalyticsPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsPool").finish_non_exhaustive()
    }
}

impl AnalyticsPool {
    /// Start a pool with `workers` threads.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .max_blocking_threads(workers.max(1))
            .thread_name("evolab-analytics")
            .build()?;
        Ok(Self { runtime })
    }

    /// Build an overlay on the pool.
    ///
    /// Await the receiver from async code or call `blocking_recv` from a
    /// plain thread.
    pub fn overlay(
        &self,
        histories: BTreeMap<String, Vec<MetricRow>>,
        keys: Vec<String>,
    ) -> oneshot::Receiver<Overlay> {
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn_blocking(move || {
            let overlay = build_overlay(&histories, &keys);
            if tx.send(overlay).is_err() {
                debug!("overlay receiver dropped before result was ready");
            }
        });
        rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, f64)]) -> MetricRow {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn empty_summary_is_all_zero() {
        let summary = build_summary(&[]);
        assert_eq!(summary.len(), 11);
        assert!(summary.values().all(|v| *v == 0.0));
        assert!(summary.contains_key("average_lifespan_turns"));
    }

    #[test]
    fn summary_derives_rates_and_peak() {
        let history = vec![
            row(&[("mean_fitness", 1.0), ("max_fitness", 2.0), ("diversity", 0.5), ("mutation_stats", 0.1)]),
            row(&[("mean_fitness", 2.0), ("max_fitness", 5.0), ("diversity", 0.3), ("mutation_stats", 0.3)]),
            row(&[("mean_fitness", 4.0), ("max_fitness", 5.0), ("diversity", 0.1), ("mutation_stats", 0.2)]),
        ];
        let summary = build_summary(&history);
        assert!(close(summary["mean_fitness"], 7.0 / 3.0));
        assert_eq!(summary["max_fitness"], 5.0);
        assert!(close(summary["fitness_improvement_rate"], 1.5));
        assert_eq!(summary["peak_generation"], 1.0);
        assert!(close(summary["diversity_trend"], -0.2));
        assert!(close(summary["avg_mutation_impact"], 0.2));
        assert!(!summary.contains_key("population"));
    }

    #[test]
    fn summary_takes_population_keys_from_latest_row() {
        let history = vec![row(&[("population", 3.0)]), row(&[("population", 7.0), ("average_hunger", 0.4)])];
        let summary = build_summary(&history);
        assert_eq!(summary["population"], 7.0);
        assert_eq!(summary["average_hunger"], 0.4);
        assert!(!summary.contains_key("average_lifespan_turns"));
        assert_eq!(summary["fitness_improvement_rate"], 0.0);
    }

    #[test]
    fn overlay_aligns_unequal_series() {
        let histories = BTreeMap::from([
            ("a".to_owned(), vec![row(&[("mean_fitness", 1.0)]), row(&[("mean_fitness", 3.0)])]),
            ("b".to_owned(), vec![row(&[("mean_fitness", 3.0)])]),
        ]);
        let overlay = build_overlay(&histories, &["mean_fitness".to_owned()]);
        assert_eq!(overlay.runs["a"]["mean_fitness"], vec![1.0, 3.0]);
        let stats = &overlay.stats["mean_fitness"];
        assert_eq!(stats.mean, vec![2.0, 3.0]);
        assert_eq!(stats.std, vec![1.0, 0.0]);
    }

    #[test]
    fn overlay_default_keys_follow_observed_metrics() {
        let fitness = BTreeMap::from([("a".to_owned(), vec![row(&[("mean_fitness", 1.0)])])]);
        assert_eq!(build_overlay(&fitness, &[]).keys, FITNESS_KEYS.map(str::to_owned).to_vec());

        let population = BTreeMap::from([("a".to_owned(), vec![row(&[("average_hunger", 1.0)])])]);
        let overlay = build_overlay(&population, &[]);
        assert_eq!(overlay.keys, POPULATION_KEYS.map(str::to_owned).to_vec());
        assert_eq!(overlay.runs["a"]["population"], vec![0.0]);
    }

    #[test]
    fn pool_delivers_overlay() {
        let pool = AnalyticsPool::new(1).unwrap();
        let histories = BTreeMap::from([("a".to_owned(), vec![row(&[("max_fitness", 4.0)])])]);
        let overlay = pool.overlay(histories, vec!["max_fitness".to_owned()]).blocking_recv().unwrap();
        assert_eq!(overlay.stats["max_fitness"].mean, vec![4.0]);
    }
}
