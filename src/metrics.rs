//! Prometheus metrics for the relay
//!
//! Exposed on the `/metrics` endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    pub static ref REQUESTS_OBSERVED: CounterVec = register_counter_vec!(
        "relay_requests_observed_total",
        "Bridge requests emitted by the source chain watchers",
        &["direction"]
    ).unwrap();

    pub static ref MESSAGES_OBSERVED: CounterVec = register_counter_vec!(
        "relay_messages_observed_total",
        "Envelope messages decoded by the message watcher",
        &["result"]
    ).unwrap();

    pub static ref REQUEST_TRANSITIONS: CounterVec = register_counter_vec!(
        "relay_request_transitions_total",
        "Persisted request status transitions",
        &["direction", "status"]
    ).unwrap();

    pub static ref MESSAGE_TRANSITIONS: CounterVec = register_counter_vec!(
        "relay_message_transitions_total",
        "Persisted message status transitions",
        &["status"]
    ).unwrap();

    pub static ref PIPELINE_ERRORS: CounterVec = register_counter_vec!(
        "relay_pipeline_errors_total",
        "Pipeline step failures by error kind",
        &["direction", "step", "kind"]
    ).unwrap();

    pub static ref CLAIM_SUBMISSIONS: CounterVec = register_counter_vec!(
        "relay_claim_submissions_total",
        "Claim transactions submitted, including replacements",
        &["chain", "kind"]
    ).unwrap();

    pub static ref ATTESTATION_FALLBACKS: CounterVec = register_counter_vec!(
        "relay_attestation_local_fallback_total",
        "Digests signed with the local key because the network attestor failed",
        &["reason"]
    ).unwrap();

    pub static ref WATCHER_RECONNECTS: CounterVec = register_counter_vec!(
        "relay_watcher_reconnects_total",
        "Subscription reconnects per watcher",
        &["watcher"]
    ).unwrap();

    pub static ref IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "relay_requests_in_flight",
        "Requests currently being driven through the pipeline",
        &["direction"]
    ).unwrap();

    pub static ref STEP_LATENCY: HistogramVec = register_histogram_vec!(
        "relay_step_latency_seconds",
        "Time spent in each pipeline step",
        &["direction", "step"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "relay_up",
        "Whether the relay is up and running"
    ).unwrap();
}

pub fn record_request_observed(direction: &str) {
    REQUESTS_OBSERVED.with_label_values(&[direction]).inc();
}

pub fn record_message_observed(result: &str) {
    MESSAGES_OBSERVED.with_label_values(&[result]).inc();
}

pub fn record_request_transition(direction: &str, status: &str) {
    REQUEST_TRANSITIONS
        .with_label_values(&[direction, status])
        .inc();
}

pub fn record_message_transition(status: &str) {
    MESSAGE_TRANSITIONS.with_label_values(&[status]).inc();
}

pub fn record_pipeline_error(direction: &str, step: &str, kind: &str) {
    PIPELINE_ERRORS
        .with_label_values(&[direction, step, kind])
        .inc();
}

pub fn record_claim_submission(chain: &str, replacement: bool) {
    let kind = if replacement { "replacement" } else { "initial" };
    CLAIM_SUBMISSIONS.with_label_values(&[chain, kind]).inc();
}

pub fn record_attestation_fallback(reason: &str) {
    ATTESTATION_FALLBACKS.with_label_values(&[reason]).inc();
}

pub fn record_watcher_reconnect(watcher: &str) {
    WATCHER_RECONNECTS.with_label_values(&[watcher]).inc();
}

pub fn observe_step(direction: &str, step: &str, seconds: f64) {
    STEP_LATENCY
        .with_label_values(&[direction, step])
        .observe(seconds);
}

/// Encode the default registry in the Prometheus text format
pub fn encode() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_appear_in_encoding() {
        record_request_transition("evm-to-sol", "RECEIVED");
        record_attestation_fallback("unreachable");
        let (content_type, body) = encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("relay_request_transitions_total"));
        assert!(text.contains("relay_attestation_local_fallback_total"));
    }
}
