//! Metrics and observability utilities
//!
//! Prometheus metrics with standardized naming conventions for the
//! answering pipeline: model routing, retrieval, guidance and requests.

use metrics::{counter, describe_counter, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all AskForge metrics
pub const METRICS_PREFIX: &str = "askforge";

/// Buckets for first-packet latency (model warm-up dominates)
pub const FIRST_PACKET_BUCKETS: &[f64] = &[
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
    60.00, // 60s - first-packet deadline
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Model routing metrics
    describe_counter!(
        format!("{}_model_calls_total", METRICS_PREFIX),
        Unit::Count,
        "Model call attempts by model and outcome"
    );

    describe_histogram!(
        format!("{}_model_first_packet_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Time until a streaming candidate produced its first packet"
    );

    // Retrieval metrics
    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Retrieval latency per channel (kb, mcp)"
    );

    describe_counter!(
        format!("{}_retrieval_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Retrieval units dropped after failing"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    // Guidance and pipeline metrics
    describe_counter!(
        format!("{}_guidance_events_total", METRICS_PREFIX),
        Unit::Count,
        "Clarification dialogue transitions"
    );

    describe_counter!(
        format!("{}_chat_outcomes_total", METRICS_PREFIX),
        Unit::Count,
        "How chat turns ended (answered, clarify, no_evidence, failed)"
    );

    tracing::info!("Metrics registered");
}

/// Times one HTTP request; labelled by route template so path parameters
/// such as task ids do not multiply series
pub struct RequestMetrics {
    start: Instant,
    method: String,
    route: String,
}

impl RequestMetrics {
    pub fn start(method: &str, route: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
            route: route.to_string(),
        }
    }

    /// Record completion; for SSE this is when the response head is sent
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "route" => self.route.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "route" => self.route
        )
        .record(duration);
    }
}

/// Record one model call attempt
pub fn record_model_call(model: &str, mode: &str, outcome: &str) {
    counter!(
        format!("{}_model_calls_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "mode" => mode.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how long a streaming candidate took to produce its first packet
pub fn record_first_packet(model: &str, duration_secs: f64) {
    histogram!(
        format!("{}_model_first_packet_seconds", METRICS_PREFIX),
        "model" => model.to_string()
    )
    .record(duration_secs);
}

/// Record one retrieval unit (a KB intent search or an MCP batch)
pub fn record_retrieval(channel: &str, duration_secs: f64, result_count: usize, success: bool) {
    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "channel" => channel.to_string()
    )
    .record(duration_secs);

    gauge!(
        format!("{}_retrieval_results_count", METRICS_PREFIX),
        "channel" => channel.to_string()
    )
    .set(result_count as f64);

    if !success {
        counter!(
            format!("{}_retrieval_failures_total", METRICS_PREFIX),
            "channel" => channel.to_string()
        )
        .increment(1);
    }
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

/// Record a clarification dialogue transition
pub fn record_guidance(event: &str) {
    counter!(
        format!("{}_guidance_events_total", METRICS_PREFIX),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record how a chat turn ended
pub fn record_chat_outcome(outcome: &str) {
    counter!(
        format!("{}_chat_outcomes_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_packet_buckets() {
        let mut prev = 0.0;
        for &bucket in FIRST_PACKET_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }

        // The first-packet deadline should be a bucket boundary
        assert!(FIRST_PACKET_BUCKETS.contains(&60.0));
    }

    #[test]
    fn test_recorders_without_exporter() {
        RequestMetrics::start("POST", "/v1/chat/stream").finish(200);
        record_embedding(0.02, "mock-embedding", true);
        record_model_call("gpt-4o-mini", "stream", "success");
        record_retrieval("kb", 0.01, 3, true);
        record_guidance("prompted");
        // Just verify it runs without panic
    }
}
