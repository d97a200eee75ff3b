//! Prometheus metrics for matching-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, TextEncoder,
};

/// Counter for evaluation runs by anchor kind and result.
pub static EVALUATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_evaluations_total",
        "Total number of match evaluations",
        &["anchor", "result"]
    )
    .expect("Failed to register EVALUATIONS")
});

/// Histogram for evaluation duration by anchor kind.
pub static EVALUATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "matching_evaluation_duration_seconds",
        "Match evaluation duration in seconds",
        &["anchor"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register EVALUATION_DURATION")
});

/// Counter for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "matching_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for match decisions by outcome.
pub static DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_decisions_total",
        "Total number of match decisions",
        &["outcome"]
    )
    .expect("Failed to register DECISIONS")
});

/// Counter for claims lost to a concurrent evaluation.
pub static CLAIM_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "matching_claim_conflicts_total",
        "Total number of match claims lost to a concurrent claim"
    )
    .expect("Failed to register CLAIM_CONFLICTS")
});

/// Counter for evaluations that proceeded without FX rates.
pub static FX_DEGRADATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "matching_fx_degradations_total",
        "Total number of evaluations degraded by an unavailable FX rate source"
    )
    .expect("Failed to register FX_DEGRADATIONS")
});

/// Counter for evaluation jobs by terminal result.
pub static JOBS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_evaluation_jobs_total",
        "Total number of evaluation jobs",
        &["result"]
    )
    .expect("Failed to register JOBS")
});

/// Gauge for the current evaluation queue depth.
pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "matching_job_queue_depth",
        "Number of evaluation jobs waiting in the queue"
    )
    .expect("Failed to register QUEUE_DEPTH")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&EVALUATIONS);
    Lazy::force(&EVALUATION_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&DECISIONS);
    Lazy::force(&CLAIM_CONFLICTS);
    Lazy::force(&FX_DEGRADATIONS);
    Lazy::force(&JOBS);
    Lazy::force(&QUEUE_DEPTH);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an evaluation run.
pub fn record_evaluation(anchor: &str, result: &str) {
    EVALUATIONS.with_label_values(&[anchor, result]).inc();
}

/// Record a match decision.
pub fn record_decision(outcome: &str) {
    DECISIONS.with_label_values(&[outcome]).inc();
}

/// Record an evaluation job result.
pub fn record_job(result: &str) {
    JOBS.with_label_values(&[result]).inc();
}
