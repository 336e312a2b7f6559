//! RRD-style ring-buffer metrics store (spec.md §3 `MetricsStore`).
//!
//! Each (node, metric) and cluster-wide series is kept at five
//! resolutions (1m/5m/15m/1h/1d); a `METRICS_UPDATE` command ingests one
//! sample per resolution bucket per series. `Sum` vs `Avg` aggregation
//! differs only for `leaderGapMs` (Design Note "Metrics aggregation").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl Resolution {
    pub const ALL: [Resolution; 5] = [
        Resolution::OneMinute,
        Resolution::FiveMinutes,
        Resolution::FifteenMinutes,
        Resolution::OneHour,
        Resolution::OneDay,
    ];

    /// Number of samples retained at this resolution.
    fn capacity(self) -> usize {
        match self {
            Resolution::OneMinute => 60,
            Resolution::FiveMinutes => 288,
            Resolution::FifteenMinutes => 96,
            Resolution::OneHour => 168,
            Resolution::OneDay => 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Aggregation {
    Sum,
    Avg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RingBuffer {
    samples: Vec<(i64, f64)>,
    cap: usize,
}

impl RingBuffer {
    fn new(cap: usize) -> Self {
        Self {
            samples: Vec::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, at: i64, value: f64) {
        if self.samples.len() == self.cap {
            self.samples.remove(0);
        }
        self.samples.push((at, value));
    }

    fn aggregate(&self, agg: Aggregation) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|(_, v)| *v).sum();
        match agg {
            Aggregation::Sum => sum,
            Aggregation::Avg => sum / self.samples.len() as f64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Series {
    buffers: HashMap<Resolution, RingBuffer>,
    aggregation: Aggregation,
}

impl Series {
    fn new(aggregation: Aggregation) -> Self {
        let buffers = Resolution::ALL
            .into_iter()
            .map(|r| (r, RingBuffer::new(r.capacity())))
            .collect();
        Self {
            buffers,
            aggregation,
        }
    }

    fn record(&mut self, at: i64, value: f64) {
        for buf in self.buffers.values_mut() {
            buf.push(at, value);
        }
    }
}

/// Per-node and cluster-wide metrics histories, ingested via
/// `METRICS_UPDATE` commands and snapshotted into `metrics.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsStore {
    per_node: HashMap<(String, String), Series>,
    cluster: HashMap<String, Series>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn series_for(&mut self, key: (String, String), name: &str) -> &mut Series {
        let agg = if name == "leaderGapMs" {
            Aggregation::Sum
        } else {
            Aggregation::Avg
        };
        self.per_node
            .entry(key)
            .or_insert_with(|| Series::new(agg))
    }

    pub fn record_node_metric(&mut self, node_id: &str, metric: &str, at: i64, value: f64) {
        let key = (node_id.to_string(), metric.to_string());
        self.series_for(key, metric).record(at, value);
    }

    pub fn record_cluster_metric(&mut self, metric: &str, at: i64, value: f64) {
        let agg = if metric == "leaderGapMs" {
            Aggregation::Sum
        } else {
            Aggregation::Avg
        };
        self.cluster
            .entry(metric.to_string())
            .or_insert_with(|| Series::new(agg))
            .record(at, value);
    }

    pub fn node_value(&self, node_id: &str, metric: &str, res: Resolution) -> Option<f64> {
        self.per_node
            .get(&(node_id.to_string(), metric.to_string()))
            .map(|s| s.buffers[&res].aggregate(s.aggregation))
    }

    pub fn cluster_value(&self, metric: &str, res: Resolution) -> Option<f64> {
        self.cluster
            .get(metric)
            .map(|s| s.buffers[&res].aggregate(s.aggregation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_averages_by_default() {
        let mut m = MetricsStore::new();
        m.record_node_metric("n1", "rps", 1, 10.0);
        m.record_node_metric("n1", "rps", 2, 20.0);
        assert_eq!(m.node_value("n1", "rps", Resolution::OneMinute), Some(15.0));
    }

    #[test]
    fn leader_gap_sums_instead_of_averaging() {
        let mut m = MetricsStore::new();
        m.record_cluster_metric("leaderGapMs", 1, 100.0);
        m.record_cluster_metric("leaderGapMs", 2, 50.0);
        assert_eq!(
            m.cluster_value("leaderGapMs", Resolution::OneMinute),
            Some(150.0)
        );
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut buf = RingBuffer::new(2);
        buf.push(1, 1.0);
        buf.push(2, 2.0);
        buf.push(3, 3.0);
        assert_eq!(buf.samples.len(), 2);
        assert_eq!(buf.samples[0].0, 2);
    }
}
