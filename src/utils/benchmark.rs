//! Load-test reporting utilities

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

/// Latency distribution summary in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
}

/// Final load-test report
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub total_time_secs: f64,

    /// Successful requests per second
    pub throughput: f64,

    pub latency: LatencySummary,

    /// Successful requests per responding worker
    pub node_distribution: HashMap<String, usize>,

    /// Coefficient of variation over the node distribution, percent
    pub load_balance_variance: f64,
}

impl LoadReport {
    pub fn display(&self) {
        info!("=== Benchmark Results ===");
        info!("Total Requests: {}", self.total_requests);
        info!("Successful:     {}", self.successful_requests);
        info!("Failed:         {}", self.failed_requests);
        info!("Total Time:     {:.2}s", self.total_time_secs);
        info!("Throughput:     {:.2} req/s", self.throughput);
        info!("Latency (ms):");
        info!("  Mean:   {:.2}", self.latency.mean);
        info!("  p50:    {:.2}", self.latency.p50);
        info!("  p95:    {:.2}", self.latency.p95);
        info!("  p99:    {:.2}", self.latency.p99);
        info!("  Min:    {:.2}", self.latency.min);
        info!("  Max:    {:.2}", self.latency.max);
        info!("  Std:    {:.2}", self.latency.std);
        info!("Node Distribution:");
        let total: usize = self.node_distribution.values().sum();
        let mut nodes: Vec<_> = self.node_distribution.iter().collect();
        nodes.sort();
        for (node, count) in nodes {
            let percentage = if total > 0 {
                *count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            info!("  {}: {} ({:.1}%)", node, count, percentage);
        }
        info!("Load Balance Variance: {:.2}%", self.load_balance_variance);
        info!("========================");
    }

    /// Export to JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Accumulates per-request outcomes during a load test.
pub struct LatencyTracker {
    start_time: Instant,
    latencies_ms: Vec<f64>,
    errors: usize,
    node_distribution: HashMap<String, usize>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            latencies_ms: Vec::new(),
            errors: 0,
            node_distribution: HashMap::new(),
        }
    }

    /// Record a completed request and the node that served it.
    pub fn record_success(&mut self, latency: Duration, node_id: &str) {
        self.latencies_ms.push(latency.as_secs_f64() * 1000.0);
        *self.node_distribution.entry(node_id.to_string()).or_default() += 1;
    }

    pub fn record_failure(&mut self) {
        self.errors += 1;
    }

    /// Finalize and produce the report.
    pub fn finalize(self) -> LoadReport {
        let total_time = self.start_time.elapsed().as_secs_f64();
        let successful = self.latencies_ms.len();

        let mut sorted = self.latencies_ms.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mean = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };
        let std = if sorted.is_empty() {
            0.0
        } else {
            (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / sorted.len() as f64).sqrt()
        };

        let latency = LatencySummary {
            mean,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            min: sorted.first().copied().unwrap_or(0.0),
            max: sorted.last().copied().unwrap_or(0.0),
            std,
        };

        let load_balance_variance = distribution_variance(&self.node_distribution);

        LoadReport {
            total_requests: successful + self.errors,
            successful_requests: successful,
            failed_requests: self.errors,
            total_time_secs: total_time,
            throughput: if total_time > 0.0 {
                successful as f64 / total_time
            } else {
                0.0
            },
            latency,
            node_distribution: self.node_distribution,
            load_balance_variance,
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted.get(idx).copied().unwrap_or(0.0)
}

/// Coefficient of variation (std/mean × 100) over per-node counts.
fn distribution_variance(distribution: &HashMap<String, usize>) -> f64 {
    if distribution.len() < 2 {
        return 0.0;
    }
    let values: Vec<f64> = distribution.values().map(|&c| c as f64).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean * 100.0
}
