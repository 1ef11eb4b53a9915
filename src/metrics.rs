//! Metrics helpers for the gateway.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded;
//! the embedding application installs whichever recorder it wants.
//!
//! Provided metrics:
//! * `gatehouse_requests_total` (counter, labels: pipeline, method, status)
//! * `gatehouse_request_duration_seconds` (histogram, label: pipeline)
//! * `gatehouse_auth_failures_total` (counter, label: reason)
//! * `gatehouse_proxy_requests_total` (counter, labels: target, upstream, outcome)
//! * `gatehouse_problem_servers` (gauge, label: target)
//! * `gatehouse_inflight_requests` (gauge)
//! * `gatehouse_rejected_requests_total` (counter, label: reason)
//!
//! [`RequestTimer`] records its duration on drop, so early returns are still measured.
use std::time::Instant;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const GATEHOUSE_REQUESTS_TOTAL: &str = "gatehouse_requests_total";
pub const GATEHOUSE_REQUEST_DURATION_SECONDS: &str = "gatehouse_request_duration_seconds";
pub const GATEHOUSE_AUTH_FAILURES_TOTAL: &str = "gatehouse_auth_failures_total";
pub const GATEHOUSE_PROXY_REQUESTS_TOTAL: &str = "gatehouse_proxy_requests_total";
pub const GATEHOUSE_PROBLEM_SERVERS: &str = "gatehouse_problem_servers";
pub const GATEHOUSE_INFLIGHT_REQUESTS: &str = "gatehouse_inflight_requests";
pub const GATEHOUSE_REJECTED_REQUESTS_TOTAL: &str = "gatehouse_rejected_requests_total";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        GATEHOUSE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        GATEHOUSE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        GATEHOUSE_AUTH_FAILURES_TOTAL,
        Unit::Count,
        "Authentication and authorization failures by internal cause."
    );
    describe_counter!(
        GATEHOUSE_PROXY_REQUESTS_TOTAL,
        Unit::Count,
        "Requests forwarded to upstream hosts, by outcome."
    );
    describe_gauge!(
        GATEHOUSE_PROBLEM_SERVERS,
        "Upstream hosts currently excluded from load balancing."
    );
    describe_gauge!(
        GATEHOUSE_INFLIGHT_REQUESTS,
        "Number of requests currently being processed."
    );
    describe_counter!(
        GATEHOUSE_REJECTED_REQUESTS_TOTAL,
        Unit::Count,
        "Requests rejected before entering a pipeline, by reason."
    );
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
    tracing::debug!("Gateway metric descriptions registered");
}

pub fn increment_request_total(pipeline: &str, method: &str, status: u16) {
    counter!(
        GATEHOUSE_REQUESTS_TOTAL,
        "pipeline" => pipeline.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(pipeline: &str, duration: std::time::Duration) {
    histogram!(GATEHOUSE_REQUEST_DURATION_SECONDS, "pipeline" => pipeline.to_string())
        .record(duration.as_secs_f64());
}

/// Count an authentication or authorization failure by its internal cause.
pub fn record_auth_failure(reason: &'static str) {
    counter!(GATEHOUSE_AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// `outcome` is one of `ok`, `connect_error`, `timeout`, `rejected`.
/// Rejected requests never reached a host and carry `upstream="none"`.
pub fn increment_proxy_request(target: &str, upstream: Option<&str>, outcome: &'static str) {
    counter!(
        GATEHOUSE_PROXY_REQUESTS_TOTAL,
        "target" => target.to_string(),
        "upstream" => upstream.unwrap_or("none").to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_problem_servers(target: &str, count: usize) {
    gauge!(GATEHOUSE_PROBLEM_SERVERS, "target" => target.to_string()).set(count as f64);
}

pub fn set_inflight_requests(count: u64) {
    gauge!(GATEHOUSE_INFLIGHT_REQUESTS).set(count as f64);
}

/// `reason` is one of `requests_limit`, `method_not_allowed`, `shutting_down`.
pub fn increment_rejected(reason: &'static str) {
    counter!(GATEHOUSE_REJECTED_REQUESTS_TOTAL, "reason" => reason).increment(1);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    pipeline: String,
}

impl RequestTimer {
    pub fn new(pipeline: &str) -> Self {
        Self {
            start: Instant::now(),
            pipeline: pipeline.to_string(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.pipeline, self.start.elapsed());
    }
}
