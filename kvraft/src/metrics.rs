//! Metrics collection for the KV service
//!
//! Request counts per method and reply status, and request latency per
//! method, exposed through a Prometheus registry.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::time::Instant;

use crate::rpc::KvResponse;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Requests by method and reply status
    pub static ref REQ_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("kv_request_counter", "kv request counter"),
        &["method", "status"]
    )
    .unwrap();

    /// Request latency by method
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("kv_method_cost", "kv method cost"),
        &["method"]
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry. Safe to call
/// more than once.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
}

/// Runs `handler`, counting the request under its reply status and timing it.
pub async fn record_metrics<F, Fut>(method_name: &'static str, handler: F) -> KvResponse
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = KvResponse> + Send,
{
    let start = Instant::now();
    let response = handler().await;

    let elapsed = start.elapsed();
    REQ_COUNTER_VEC
        .with_label_values(&[method_name, response.status().as_str()])
        .inc();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    response
}

/// Text exposition of everything in the registry.
pub fn encode_registry() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY_INSTANCE.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::warn!("failed to encode metrics: {}", e);
    }
    buffer
}
