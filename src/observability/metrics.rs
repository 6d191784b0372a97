//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `rest_api_requests_total{controller,url,method,status_code}`
//! - `rest_api_request_duration_seconds{controller,url,method}`
//! - `rest_api_condition_checks_total{controller,condition_result}`
//! - `rest_api_json_parsing_errors_total{controller,error_type}`
//! - `rest_api_response_size_bytes{controller,url}`
//! - `reconciliations_total{kind}`
//! - `reconciliation_errors_total{kind,reason}`
//! - `reconciliation_duration_seconds{kind}`
//! - `git_push_duration_seconds{kind}`
//! - `scheduler_fires_total{kind}`

use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static REST_API_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "rest_api_requests_total",
            "Total number of probe HTTP requests issued",
        ),
        &["controller", "url", "method", "status_code"],
    )
    .expect("Failed to create REST_API_REQUESTS_TOTAL metric - this should never happen")
});

static REST_API_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "rest_api_request_duration_seconds",
            "Duration of probe HTTP requests in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["controller", "url", "method"],
    )
    .expect("Failed to create REST_API_REQUEST_DURATION metric - this should never happen")
});

static REST_API_CONDITION_CHECKS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "rest_api_condition_checks_total",
            "Total number of probe condition evaluations, by outcome",
        ),
        &["controller", "condition_result"],
    )
    .expect("Failed to create REST_API_CONDITION_CHECKS_TOTAL metric - this should never happen")
});

static REST_API_JSON_PARSING_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "rest_api_json_parsing_errors_total",
            "Total number of probe response parsing errors, by error type",
        ),
        &["controller", "error_type"],
    )
    .expect("Failed to create REST_API_JSON_PARSING_ERRORS_TOTAL metric - this should never happen")
});

static REST_API_RESPONSE_SIZE_BYTES: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "rest_api_response_size_bytes",
            "Size of probe HTTP response bodies in bytes",
        )
        .buckets(vec![64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0]),
        &["controller", "url"],
    )
    .expect("Failed to create REST_API_RESPONSE_SIZE_BYTES metric - this should never happen")
});

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("reconciliations_total", "Total number of reconciliations"),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "reconciliation_errors_total",
            "Total number of reconciliation errors, by reason",
        ),
        &["kind", "reason"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "reconciliation_duration_seconds",
            "Duration of a full reconciliation pass in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static GIT_PUSH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "git_push_duration_seconds",
            "Duration of the clone-through-push Git sequence in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["kind"],
    )
    .expect("Failed to create GIT_PUSH_DURATION metric - this should never happen")
});

static SCHEDULER_FIRES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "scheduler_fires_total",
            "Total number of scheduled executions fired",
        ),
        &["kind"],
    )
    .expect("Failed to create SCHEDULER_FIRES_TOTAL metric - this should never happen")
});

/// Registers every metric with the process-wide registry. Must be called
/// once at startup before `/metrics` is served.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(REST_API_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REST_API_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(REST_API_CONDITION_CHECKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REST_API_JSON_PARSING_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REST_API_RESPONSE_SIZE_BYTES.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(GIT_PUSH_DURATION.clone()))?;
    REGISTRY.register(Box::new(SCHEDULER_FIRES_TOTAL.clone()))?;
    Ok(())
}

pub fn observe_probe_duration(controller: &str, url: &str, method: &str, seconds: f64) {
    REST_API_REQUEST_DURATION
        .with_label_values(&[controller, url, method])
        .observe(seconds);
}

pub fn increment_requests_total(controller: &str, url: &str, method: &str, status_code: u16) {
    REST_API_REQUESTS_TOTAL
        .with_label_values(&[controller, url, method, &status_code.to_string()])
        .inc();
}

pub fn increment_condition_checks(controller: &str, condition_met: bool) {
    let result = if condition_met { "met" } else { "unmet" };
    REST_API_CONDITION_CHECKS_TOTAL
        .with_label_values(&[controller, result])
        .inc();
}

pub fn observe_response_size(controller: &str, url: &str, bytes: f64) {
    REST_API_RESPONSE_SIZE_BYTES
        .with_label_values(&[controller, url])
        .observe(bytes);
}

pub fn increment_json_parsing_errors(controller: &str, error_type: &str) {
    REST_API_JSON_PARSING_ERRORS_TOTAL
        .with_label_values(&[controller, error_type])
        .inc();
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str, reason: &str) {
    RECONCILIATION_ERRORS_TOTAL
        .with_label_values(&[kind, reason])
        .inc();
}

pub fn observe_reconciliation_duration(kind: &str, seconds: f64) {
    RECONCILIATION_DURATION.with_label_values(&[kind]).observe(seconds);
}

pub fn observe_git_push_duration(kind: &str, seconds: f64) {
    GIT_PUSH_DURATION.with_label_values(&[kind]).observe(seconds);
}

pub fn increment_scheduler_fires(kind: &str) {
    SCHEDULER_FIRES_TOTAL.with_label_values(&[kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_in_one_process_is_the_only_hazard() {
        // Metrics are process-wide LazyLock singletons; `register_metrics`
        // itself is idempotent-unsafe if called twice (Registry::register
        // errors on a duplicate collector), so callers must call it exactly
        // once at startup. Exercise the label-recording functions directly
        // instead, which is what's safe to call from tests and from every
        // reconciliation.
        increment_requests_total("gitcommit", "http://example.invalid", "GET", 200);
        observe_probe_duration("gitcommit", "http://example.invalid", "GET", 0.25);
        increment_condition_checks("gitcommit", true);
        observe_response_size("gitcommit", "http://example.invalid", 128.0);
        increment_json_parsing_errors("gitcommit", "invalid_json");
        increment_reconciliations("gitcommit");
        increment_reconciliation_errors("gitcommit", "git_failed");
        observe_reconciliation_duration("gitcommit", 1.5);
        observe_git_push_duration("gitcommit", 2.0);
        increment_scheduler_fires("gitcommit");
    }
}
