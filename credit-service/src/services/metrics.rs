//! Prometheus metrics for credit-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    HistogramVec, TextEncoder,
};

/// Webhook event counter by event type and outcome.
pub static WEBHOOK_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credit_webhook_events_total",
        "Total number of payment webhook events received",
        &["event_type", "status"]
    )
    .expect("Failed to register webhook_events_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "credit_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credit_errors_total",
        "Total number of errors by type",
        &["error_type"]  // db_error, provider_error, etc.
    )
    .expect("Failed to register errors_total")
});

/// Credits awarded counter (whole credit units).
pub static CREDITS_AWARDED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "credit_credits_awarded_total",
        "Total credit value awarded through earn"
    )
    .expect("Failed to register credits_awarded")
});

/// Credits restored by the reclamation jobs.
pub static CREDITS_RESTORED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "credit_credits_restored_total",
        "Total credit value restored by cleanup and reversal"
    )
    .expect("Failed to register credits_restored")
});

/// Reversal failures after payment failure. Any increment here means a user
/// may be owed credit and needs manual review.
pub static REVERSAL_FAILURES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "credit_reversal_failures_total",
        "Credit reversals that failed after a payment failure"
    )
    .expect("Failed to register reversal_failures")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&WEBHOOK_EVENTS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&CREDITS_AWARDED);
    Lazy::force(&CREDITS_RESTORED);
    Lazy::force(&REVERSAL_FAILURES);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
