use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Histogram,
}

/// One metric value at the moment `snapshot` was taken.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    /// Counter value, or observation count for histograms.
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

/// Every observation is kept; volumes here are one per projection apply.
fn summarize(observations: &[f64]) -> HistogramSummary {
    let mut sorted = observations.to_vec();
    sorted.sort_by(f64::total_cmp);
    let Some(&max) = sorted.last() else {
        return HistogramSummary::default();
    };
    let rank = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)];
    HistogramSummary {
        count: sorted.len() as u64,
        sum: sorted.iter().sum(),
        p50: rank(0.5),
        p95: rank(0.95),
        max,
    }
}

/// A BTreeMap makes label order irrelevant to identity.
type MetricKey = (String, BTreeMap<String, String>);

fn key(name: &str, labels: &[(&str, &str)]) -> MetricKey {
    let labels = labels.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())).collect();
    (name.to_owned(), labels)
}

fn sample(key: &MetricKey, metric_type: MetricType, value: f64, summary: Option<HistogramSummary>) -> MetricSample {
    MetricSample {
        name: key.0.clone(),
        labels: key.1.clone(),
        metric_type,
        value,
        summary,
    }
}

/// Thread-safe in-process metrics. Handed explicitly to whoever records.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    histograms: RwLock<HashMap<MetricKey, Mutex<Vec<f64>>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = key(name, labels);
        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = key(name, labels);
        if let Some(observations) = self.histograms.read().get(&key) {
            observations.lock().push(value);
            return;
        }
        self.histograms.write().entry(key).or_default().lock().push(value);
    }

    /// Current value of a counter; zero if never incremented.
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&key(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Sum of a counter across every label combination.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|((metric, _), _)| metric == name)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&key(name, labels))
            .map(|obs| summarize(&obs.lock()))
            .unwrap_or_default()
    }

    /// All current values, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let counters = self.counters.read();
        let histograms = self.histograms.read();
        let mut samples: Vec<MetricSample> = counters
            .iter()
            .map(|(k, counter)| sample(k, MetricType::Counter, counter.load(Ordering::Relaxed) as f64, None))
            .chain(histograms.iter().map(|(k, obs)| {
                let summary = summarize(&obs.lock());
                sample(k, MetricType::Histogram, summary.count as f64, Some(summary))
            }))
            .collect();
        samples.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        samples
    }
}
