use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram; older ones fall off.
const HISTOGRAM_WINDOW: usize = 4_096;

/// Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Integer gauge. Everything gauged here is a count.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Sliding window of recent observations.
struct Histogram {
    total: AtomicU64,
    window: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            window: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    fn observe(&self, value: f64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut window = self.window.lock();
        if window.len() == HISTOGRAM_WINDOW {
            window.pop_front();
        }
        window.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let mut obs: Vec<f64> = self.window.lock().iter().copied().collect();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = obs.len();
        let at = |q: f64| obs[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.total.load(Ordering::Relaxed),
            window: n as u64,
            mean: obs.iter().sum::<f64>() / n as f64,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Observations ever recorded.
    pub count: u64,
    /// Observations the percentiles are computed over.
    pub window: u64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric name + sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn labels_map(&self) -> HashMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterSample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaugeSample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramSample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub summary: HistogramSummary,
}

/// Point-in-time view of every metric, sorted by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub counters: Vec<CounterSample>,
    pub gauges: Vec<GaugeSample>,
    pub histograms: Vec<HistogramSample>,
}

/// Thread-safe in-process metrics.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.increment(n);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.set(value);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(Gauge::new)
            .set(value);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0, Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn report(&self) -> MetricsReport {
        let mut counters: Vec<CounterSample> = self
            .counters
            .read()
            .iter()
            .map(|(k, c)| CounterSample {
                name: k.name.clone(),
                labels: k.labels_map(),
                value: c.get(),
            })
            .collect();
        counters.sort_by(|a, b| a.name.cmp(&b.name));

        let mut gauges: Vec<GaugeSample> = self
            .gauges
            .read()
            .iter()
            .map(|(k, g)| GaugeSample {
                name: k.name.clone(),
                labels: k.labels_map(),
                value: g.get(),
            })
            .collect();
        gauges.sort_by(|a, b| a.name.cmp(&b.name));

        let mut histograms: Vec<HistogramSample> = self
            .histograms
            .read()
            .iter()
            .map(|(k, h)| HistogramSample {
                name: k.name.clone(),
                labels: k.labels_map(),
                summary: h.summary(),
            })
            .collect();
        histograms.sort_by(|a, b| a.name.cmp(&b.name));

        MetricsReport {
            counters,
            gauges,
            histograms,
        }
    }
}
