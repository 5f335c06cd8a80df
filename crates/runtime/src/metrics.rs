use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::instrument::{Instrumentation, Outcome, StageEvent};

/// Stage timing aggregation.
///
/// Sorted maps keep snapshots in a stable order for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metrics {
    counters: BTreeMap<String, u64>,
    histograms: BTreeMap<String, Histogram>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Histogram {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl Histogram {
    pub fn record(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
    }

    pub fn mean(&self) -> Option<u64> {
        (self.count > 0).then(|| self.sum / self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub counters: Vec<(String, u64)>,
    pub histograms: Vec<(String, Histogram)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.counters.clear();
        self.histograms.clear();
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn inc_counter(&mut self, name: impl Into<String>, by: u64) {
        *self.counters.entry(name.into()).or_insert(0) += by;
    }

    pub fn record_histogram(&mut self, name: impl Into<String>, value: u64) {
        self.histograms.entry(name.into()).or_default().record(value);
    }

    pub fn histogram(&self, name: &str) -> Option<Histogram> {
        self.histograms.get(name).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            histograms: self
                .histograms
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }
}

/// Instrumentation sink that folds stage events into [`Metrics`].
///
/// Per stage it keeps a latency histogram in microseconds
/// (`<stage>.us`) and success/failure counters (`<stage>.ok`, `<stage>.failed`).
#[derive(Debug, Default)]
pub struct StageMetrics {
    inner: Mutex<Metrics>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn metrics(&self) -> Metrics {
        self.inner.lock().clone()
    }
}

impl Instrumentation for StageMetrics {
    fn on_stage(&self, event: &StageEvent) {
        let stage = event.stage.as_str();
        let micros = u64::try_from(event.elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut m = self.inner.lock();
        m.record_histogram(format!("{stage}.us"), micros);
        match event.outcome {
            Outcome::Success => m.inc_counter(format!("{stage}.ok"), 1),
            Outcome::Failure => m.inc_counter(format!("{stage}.failed"), 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Histogram, Metrics, StageMetrics};
    use crate::instrument::{Instrumentation, Outcome, Stage, StageEvent};

    #[test]
    fn counters_accumulate() {
        let mut m = Metrics::new();
        m.inc_counter("a", 1);
        m.inc_counter("a", 2);
        assert_eq!(m.counter("a"), 3);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn histogram_tracks_min_max_sum_count() {
        let mut h = Histogram::default();
        assert_eq!(h.mean(), None);
        h.record(5);
        h.record(2);
        h.record(8);
        assert_eq!(h.count, 3);
        assert_eq!(h.sum, 15);
        assert_eq!(h.min, 2);
        assert_eq!(h.max, 8);
        assert_eq!(h.mean(), Some(5));
    }

    #[test]
    fn stage_events_fold_into_named_series() {
        let sink = StageMetrics::new();
        sink.on_stage(&StageEvent {
            stage: Stage::LayerQuery,
            label: "roads".to_string(),
            elapsed: Duration::from_millis(3),
            outcome: Outcome::Success,
        });
        sink.on_stage(&StageEvent {
            stage: Stage::LayerQuery,
            label: "water".to_string(),
            elapsed: Duration::from_millis(1),
            outcome: Outcome::Failure,
        });

        let m = sink.metrics();
        assert_eq!(m.counter("layer_query.ok"), 1);
        assert_eq!(m.counter("layer_query.failed"), 1);
        let h = m.histogram("layer_query.us").unwrap();
        assert_eq!(h.count, 2);
        assert_eq!(h.max, 3_000);

        let snap = sink.snapshot();
        assert_eq!(snap.counters[0].0, "layer_query.failed");
        assert_eq!(snap.counters[1].0, "layer_query.ok");
    }
}
