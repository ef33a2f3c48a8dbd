//! Metrics collection for llmpipe
//!
//! Prometheus metrics for the worker. stdout carries the host protocol, so
//! there is no exporter; the text exposition is logged when the worker stops.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics registry for llmpipe
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
}

/// Inference-related metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of requests read from the host
    pub requests_total: IntCounter,

    /// Requests answered with generated text
    pub requests_success: IntCounter,

    /// Requests answered with an error frame
    pub requests_failed: IntCounter,

    /// Generations cut short by an evaluation failure
    pub generations_truncated: IntCounter,

    /// Time from receiving a prompt to having its result, excluding the write
    pub request_duration: Histogram,

    /// Prompt evaluation duration
    pub prompt_duration: Histogram,

    /// Decode loop duration
    pub generation_duration: Histogram,

    /// Prompt tokens evaluated
    pub prompt_tokens_total: IntCounter,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Tokens per second
    pub tokens_per_second: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("valid counter definition")
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition")
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let inference = InferenceMetrics {
            requests_total: counter(
                "llmpipe_requests_total",
                "Total number of requests read from the host",
            ),
            requests_success: counter(
                "llmpipe_requests_success_total",
                "Requests answered with generated text",
            ),
            requests_failed: counter(
                "llmpipe_requests_failed_total",
                "Requests answered with an error frame",
            ),
            generations_truncated: counter(
                "llmpipe_generations_truncated_total",
                "Generations stopped early by an evaluation failure",
            ),
            request_duration: histogram(
                "llmpipe_request_duration_seconds",
                "Request handling time in seconds, from prompt to result",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            ),
            prompt_duration: histogram(
                "llmpipe_prompt_duration_seconds",
                "Prompt evaluation duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0],
            ),
            generation_duration: histogram(
                "llmpipe_generation_duration_seconds",
                "Decode loop duration in seconds",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            ),
            prompt_tokens_total: counter(
                "llmpipe_prompt_tokens_total",
                "Total number of prompt tokens evaluated",
            ),
            tokens_generated_total: counter(
                "llmpipe_tokens_generated_total",
                "Total number of tokens generated",
            ),
            tokens_per_second: histogram(
                "llmpipe_tokens_per_second",
                "Tokens generated per second",
                vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0],
            ),
        };

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(inference.requests_total.clone()),
            Box::new(inference.requests_success.clone()),
            Box::new(inference.requests_failed.clone()),
            Box::new(inference.generations_truncated.clone()),
            Box::new(inference.request_duration.clone()),
            Box::new(inference.prompt_duration.clone()),
            Box::new(inference.generation_duration.clone()),
            Box::new(inference.prompt_tokens_total.clone()),
            Box::new(inference.tokens_generated_total.clone()),
            Box::new(inference.tokens_per_second.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        MetricsRegistry { registry, inference }
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
        String::from_utf8_lossy(&buffer).into_owned()
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
