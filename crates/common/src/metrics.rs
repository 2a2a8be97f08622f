//! Metrics collection for Shardgen
//!
//! This module provides Prometheus metrics for observability.
//! Step metrics are recorded on every rank; request metrics only on rank 0.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Shardgen
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
    pub shard: ShardMetrics,
}

/// Request-level metrics, recorded by the scheduler on rank 0
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of generation requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Requests dropped because their client went away
    pub requests_aborted: IntCounter,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Current queue depth
    pub queue_depth: IntGauge,
}

/// Per-rank step metrics
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Forward pass duration
    pub forward_duration: Histogram,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Batch merges performed
    pub concatenations_total: IntCounter,

    /// Sequences currently cached across all batches
    pub active_sequences: IntGauge,

    /// Collectives issued
    pub collectives_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric name and help are valid")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("metric name and help are valid")
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("metric name and buckets are valid")
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let inference = InferenceMetrics {
            requests_total: counter("shardgen_requests_total", "Total number of generation requests"),
            requests_success: counter(
                "shardgen_requests_success_total",
                "Total number of successful generation requests",
            ),
            requests_failed: counter(
                "shardgen_requests_failed_total",
                "Total number of failed generation requests",
            ),
            requests_aborted: counter(
                "shardgen_requests_aborted_total",
                "Requests removed from a batch after their client went away",
            ),
            request_duration: histogram(
                "shardgen_request_duration_seconds",
                "Generation request duration in seconds",
                vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            ),
            tokens_generated_total: counter(
                "shardgen_tokens_generated_total",
                "Total number of tokens generated",
            ),
            queue_depth: gauge("shardgen_queue_depth", "Current depth of the request queue"),
        };

        let shard = ShardMetrics {
            forward_duration: histogram(
                "shardgen_forward_duration_seconds",
                "Generation step duration in seconds",
                vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5],
            ),
            batch_size: histogram(
                "shardgen_batch_size",
                "Batch size distribution",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
            ),
            concatenations_total: counter(
                "shardgen_concatenations_total",
                "Total number of batch merges",
            ),
            active_sequences: gauge(
                "shardgen_active_sequences",
                "Sequences held in cached batches",
            ),
            collectives_total: counter(
                "shardgen_collectives_total",
                "Total number of collectives issued by this rank",
            ),
        };

        // Register all metrics
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(inference.requests_total.clone()),
            Box::new(inference.requests_success.clone()),
            Box::new(inference.requests_failed.clone()),
            Box::new(inference.requests_aborted.clone()),
            Box::new(inference.request_duration.clone()),
            Box::new(inference.tokens_generated_total.clone()),
            Box::new(inference.queue_depth.clone()),
            Box::new(shard.forward_duration.clone()),
            Box::new(shard.batch_size.clone()),
            Box::new(shard.concatenations_total.clone()),
            Box::new(shard.active_sequences.clone()),
            Box::new(shard.collectives_total.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique within the registry");
        }

        MetricsRegistry {
            registry,
            inference,
            shard,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
