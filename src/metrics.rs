//! Prometheus metrics for the HTTP surface and the engine.

use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry,
};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &[],
    ).unwrap();
    // Tasks handed to an executor, first attempts only
    pub static ref TASKS_SUBMITTED: IntCounter = IntCounter::new(
        "tasks_submitted", "The number of tasks submitted to an executor"
    ).unwrap();
    // Retried task attempts
    pub static ref TASKS_RETRIED: IntCounter = IntCounter::new(
        "tasks_retried", "The number of task attempts retried after a transient failure"
    ).unwrap();
    // Duplicate results of already merged partitions
    pub static ref STALE_RESULTS_DISCARDED: IntCounter = IntCounter::new(
        "stale_results_discarded",
        "The number of partial results discarded because their partition was already merged"
    ).unwrap();
    // Merge latency per partial result
    pub static ref MERGE_TIME: Histogram = Histogram::with_opts(
        HistogramOpts::new("merge_time", "The time taken to merge each partial result")
            .buckets(prometheus::exponential_buckets(1e-6, 4.0, 12).unwrap()),
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .unwrap();
    REGISTRY.register(Box::new(TASKS_SUBMITTED.clone())).unwrap();
    REGISTRY.register(Box::new(TASKS_RETRIED.clone())).unwrap();
    REGISTRY
        .register(Box::new(STALE_RESULTS_DISCARDED.clone()))
        .unwrap();
    REGISTRY.register(Box::new(MERGE_TIME.clone())).unwrap();
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(%err, "failed to encode metrics");
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_counters() {
        let before = STALE_RESULTS_DISCARDED.get();
        STALE_RESULTS_DISCARDED.inc();
        assert!(STALE_RESULTS_DISCARDED.get() > before);
        MERGE_TIME.observe(0.001);
        assert!(MERGE_TIME.get_sample_count() >= 1);
    }
}
