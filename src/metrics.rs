//! Execution metrics for the gateway.
//!
//! [`MetricsCollector`] keeps two bounded in-memory sample buffers (one per
//! executed query, one per plan-cache operation) for summaries, and mirrors
//! every sample into Prometheus counters for scraping.
//!
//! # Metrics Exposed
//!
//! - `federation_executions_total` - Executed queries by status
//! - `federation_execution_duration_seconds` - Query latency histogram
//! - `federation_plan_cache_operations_total` - Plan cache operations by kind
//! - `federation_subgraph_requests_total` - Subgraph calls by subgraph and status
//!
//! Buffers drop their oldest 20% when full.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// One executed query
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetricSample {
    pub fingerprint: String,
    pub duration: Duration,
    pub success: bool,
    pub cache_hit: bool,
    pub subgraphs: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOperation {
    Hit,
    Miss,
    Set,
    Invalidate,
}

impl CacheOperation {
    fn as_str(self) -> &'static str {
        match self {
            CacheOperation::Hit => "hit",
            CacheOperation::Miss => "miss",
            CacheOperation::Set => "set",
            CacheOperation::Invalidate => "invalidate",
        }
    }
}

/// One plan cache operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheOperationSample {
    pub operation: CacheOperation,
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregates over the buffered samples
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub executions: usize,
    pub average_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
}

/// Prometheus side of the collector, registered in its own registry
#[derive(Clone)]
struct PrometheusMetrics {
    registry: Registry,
    executions: IntCounterVec,
    execution_duration: HistogramVec,
    cache_operations: IntCounterVec,
    subgraph_requests: IntCounterVec,
}

impl PrometheusMetrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let executions = IntCounterVec::new(
            Opts::new("federation_executions_total", "Total number of executed federated queries"),
            &["status"],
        )?;
        let execution_duration = HistogramVec::new(
            HistogramOpts::new(
                "federation_execution_duration_seconds",
                "Federated query duration in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["cache"],
        )?;
        let cache_operations = IntCounterVec::new(
            Opts::new("federation_plan_cache_operations_total", "Query plan cache operations"),
            &["operation"],
        )?;
        let subgraph_requests = IntCounterVec::new(
            Opts::new("federation_subgraph_requests_total", "Subgraph requests by outcome"),
            &["subgraph", "status"],
        )?;

        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;
        registry.register(Box::new(cache_operations.clone()))?;
        registry.register(Box::new(subgraph_requests.clone()))?;

        Ok(Self {
            registry,
            executions,
            execution_duration,
            cache_operations,
            subgraph_requests,
        })
    }
}

/// Bounded sample buffers plus Prometheus counters
pub struct MetricsCollector {
    max_samples: usize,
    executions: Mutex<VecDeque<ExecutionMetricSample>>,
    cache_operations: Mutex<VecDeque<CacheOperationSample>>,
    prometheus: PrometheusMetrics,
}

impl MetricsCollector {
    pub fn new(max_samples: usize) -> Result<Self> {
        if max_samples == 0 {
            return Err(Error::validation("metrics max_samples must be greater than 0"));
        }
        let prometheus = PrometheusMetrics::new()
            .map_err(|e| Error::validation("failed to create prometheus metrics").with_cause(e))?;
        Ok(Self {
            max_samples,
            executions: Mutex::new(VecDeque::with_capacity(max_samples.min(1024))),
            cache_operations: Mutex::new(VecDeque::with_capacity(max_samples.min(1024))),
            prometheus,
        })
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    pub fn record_execution(&self, sample: ExecutionMetricSample) {
        let status = if sample.success { "success" } else { "error" };
        let cache = if sample.cache_hit { "hit" } else { "miss" };
        self.prometheus.executions.with_label_values(&[status]).inc();
        self.prometheus
            .execution_duration
            .with_label_values(&[cache])
            .observe(sample.duration.as_secs_f64());

        push_bounded(&mut self.executions.lock(), sample, self.max_samples);
    }

    pub fn record_cache_operation(&self, operation: CacheOperation, key: impl Into<String>) {
        self.prometheus
            .cache_operations
            .with_label_values(&[operation.as_str()])
            .inc();

        let sample = CacheOperationSample {
            operation,
            key: key.into(),
            timestamp: Utc::now(),
        };
        push_bounded(&mut self.cache_operations.lock(), sample, self.max_samples);
    }

    pub fn record_subgraph_request(&self, subgraph: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.prometheus
            .subgraph_requests
            .with_label_values(&[subgraph, status])
            .inc();
    }

    pub fn execution_samples(&self) -> Vec<ExecutionMetricSample> {
        self.executions.lock().iter().cloned().collect()
    }

    pub fn cache_samples(&self) -> Vec<CacheOperationSample> {
        self.cache_operations.lock().iter().cloned().collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let executions = self.executions.lock();
        let count = executions.len();

        let mut durations: Vec<f64> = executions
            .iter()
            .map(|s| s.duration.as_secs_f64() * 1000.0)
            .collect();
        durations.sort_by(|a, b| a.total_cmp(b));
        let successes = executions.iter().filter(|s| s.success).count();
        drop(executions);

        let cache_ops = self.cache_operations.lock();
        let hits = cache_ops.iter().filter(|s| s.operation == CacheOperation::Hit).count();
        let lookups = cache_ops
            .iter()
            .filter(|s| matches!(s.operation, CacheOperation::Hit | CacheOperation::Miss))
            .count();

        MetricsSummary {
            executions: count,
            average_duration_ms: ratio(durations.iter().sum::<f64>(), count),
            p95_duration_ms: percentile(&durations, 0.95),
            success_rate: ratio(successes as f64, count),
            cache_hit_rate: ratio(hits as f64, lookups),
        }
    }

    /// Drop all buffered samples. Prometheus counters are unaffected.
    pub fn clear(&self) {
        self.executions.lock().clear();
        self.cache_operations.lock().clear();
    }

    /// Render the Prometheus metrics in text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %err, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Prometheus registry holding this collector's metrics.
    pub fn registry(&self) -> &Registry {
        &self.prometheus.registry
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("max_samples", &self.max_samples)
            .field("executions", &self.executions.lock().len())
            .field("cache_operations", &self.cache_operations.lock().len())
            .finish()
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, sample: T, capacity: usize) {
    if buffer.len() >= capacity {
        let excess = (capacity / 5).max(1);
        buffer.drain(..excess.min(buffer.len()));
    }
    buffer.push_back(sample);
}

fn ratio(numerator: f64, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64, success: bool) -> ExecutionMetricSample {
        ExecutionMetricSample {
            fingerprint: "abcd1234".into(),
            duration: Duration::from_millis(ms),
            success,
            cache_hit: false,
            subgraphs: vec!["users".into()],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_buffer_drops_oldest_fifth() {
        let metrics = MetricsCollector::new(10).unwrap();
        for i in 0..11 {
            metrics.record_execution(sample(i, true));
        }
        let samples = metrics.execution_samples();
        assert_eq!(samples.len(), 9);
        assert_eq!(samples[0].duration, Duration::from_millis(2));
        assert_eq!(samples[8].duration, Duration::from_millis(10));
    }

    #[test]
    fn test_small_capacity_drops_one() {
        let metrics = MetricsCollector::new(3).unwrap();
        for i in 0..4 {
            metrics.record_cache_operation(CacheOperation::Miss, format!("k{}", i));
        }
        let samples = metrics.cache_samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].key, "k1");
    }

    #[test]
    fn test_summary() {
        let metrics = MetricsCollector::new(100).unwrap();
        metrics.record_execution(sample(10, true));
        metrics.record_execution(sample(30, false));
        metrics.record_cache_operation(CacheOperation::Miss, "a");
        metrics.record_cache_operation(CacheOperation::Set, "a");
        metrics.record_cache_operation(CacheOperation::Hit, "a");
        metrics.record_cache_operation(CacheOperation::Hit, "a");

        let summary = metrics.summary();
        assert_eq!(summary.executions, 2);
        assert!((summary.average_duration_ms - 20.0).abs() < 1e-9);
        assert!((summary.success_rate - 0.5).abs() < 1e-9);
        assert!((summary.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((summary.p95_duration_ms - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary() {
        let metrics = MetricsCollector::new(5).unwrap();
        let summary = metrics.summary();
        assert_eq!(summary.executions, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.cache_hit_rate, 0.0);
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = MetricsCollector::new(5).unwrap();
        metrics.record_execution(sample(5, true));
        metrics.record_subgraph_request("users", false);

        let output = metrics.render();
        assert!(output.contains("federation_executions_total"));
        assert!(output.contains("federation_subgraph_requests_total"));
        assert!(output.contains("subgraph=\"users\""));
    }

    #[test]
    fn test_independent_registries() {
        // Each collector owns its registry so several can coexist
        let a = MetricsCollector::new(5).unwrap();
        let b = MetricsCollector::new(5).unwrap();
        a.record_execution(sample(1, true));
        assert!(!b.render().contains("status=\"success\""));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(MetricsCollector::new(0).is_err());
    }
}
