//! Process metrics, registered through the `metrics` facade the way the
//! teacher registers `NUM_CLIENT_CONNECTION_GAUGE` and friends — a small
//! set of named constants, incremented at the call site, with a single
//! Prometheus exporter installed once at startup.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
pub const BOT_BLOCKED_TOTAL: &str = "gateway_bot_blocked_total";
pub const COMMIT_FAILURES_TOTAL: &str = "gateway_commit_failures_total";
pub const MERKLE_BATCHES_TOTAL: &str = "gateway_merkle_batches_total";
pub const ANCHOR_ATTEMPTS_TOTAL: &str = "gateway_anchor_attempts_total";
pub const ANCHOR_SUCCESS_TOTAL: &str = "gateway_anchor_success_total";

pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

pub fn record_request(status: u16, error_kind: &'static str, duration_secs: f64) {
    counter!(REQUESTS_TOTAL, "status" => status.to_string(), "error_kind" => error_kind)
        .increment(1);
    histogram!(REQUEST_DURATION_SECONDS).record(duration_secs);
}

pub fn record_rate_limited() {
    counter!(RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_bot_blocked() {
    counter!(BOT_BLOCKED_TOTAL).increment(1);
}

pub fn record_commit_failure(stage: &'static str) {
    counter!(COMMIT_FAILURES_TOTAL, "stage" => stage).increment(1);
}

pub fn record_merkle_batch_closed() {
    counter!(MERKLE_BATCHES_TOTAL).increment(1);
}

pub fn record_anchor_attempt(success: bool) {
    counter!(ANCHOR_ATTEMPTS_TOTAL).increment(1);
    if success {
        counter!(ANCHOR_SUCCESS_TOTAL).increment(1);
    }
}
