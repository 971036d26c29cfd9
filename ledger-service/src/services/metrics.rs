//! Operational metrics for the ledger engine.
//!
//! Services talk to a [`MetricsSink`]; recording is infallible from their
//! point of view, so a broken metrics backend can never fail a payment or a
//! refund. [`NoopMetrics`] is a valid drop-in.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Result of a financial operation, as far as metrics are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "ok",
            Outcome::Failure => "error",
        }
    }

    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Destination for ledger metrics. Implementations must not panic and must
/// swallow their own failures.
pub trait MetricsSink: Send + Sync {
    fn record_payment(&self, outcome: Outcome);
    fn record_refund(&self, outcome: Outcome);
    fn record_retry(&self, operation: &str);
    fn record_latency(&self, operation: &str, duration: Duration);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_payment(&self, _outcome: Outcome) {}
    fn record_refund(&self, _outcome: Outcome) {}
    fn record_retry(&self, _operation: &str) {}
    fn record_latency(&self, _operation: &str, _duration: Duration) {}
}

// -----------------------------------------------------------------------------
// In-process counters
// -----------------------------------------------------------------------------

/// Latency samples kept per operation.
const MAX_LATENCY_SAMPLES: usize = 1024;

/// In-process counters with a bounded window of latency samples.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    payment_success: AtomicU64,
    payment_fail: AtomicU64,
    refund_success: AtomicU64,
    refund_fail: AtomicU64,
    transaction_retry: AtomicU64,
    latencies: DashMap<String, VecDeque<Duration>>,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub payment_success_count: u64,
    pub payment_fail_count: u64,
    pub refund_success_count: u64,
    pub refund_fail_count: u64,
    pub transaction_retry_count: u64,
    pub latency: BTreeMap<String, LatencySummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub p50_micros: u64,
    pub p95_micros: u64,
    pub max_micros: u64,
}

impl LatencySummary {
    fn from_samples(samples: &VecDeque<Duration>) -> Self {
        let mut sorted: Vec<u64> = samples.iter().map(|d| d.as_micros() as u64).collect();
        sorted.sort_unstable();
        let percentile = |p: usize| -> u64 {
            if sorted.is_empty() {
                return 0;
            }
            let rank = (p * sorted.len()).div_ceil(100).max(1);
            sorted[rank - 1]
        };
        Self {
            samples: sorted.len(),
            p50_micros: percentile(50),
            p95_micros: percentile(95),
            max_micros: sorted.last().copied().unwrap_or(0),
        }
    }
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            payment_success_count: self.payment_success.load(Ordering::Relaxed),
            payment_fail_count: self.payment_fail.load(Ordering::Relaxed),
            refund_success_count: self.refund_success.load(Ordering::Relaxed),
            refund_fail_count: self.refund_fail.load(Ordering::Relaxed),
            transaction_retry_count: self.transaction_retry.load(Ordering::Relaxed),
            latency: self
                .latencies
                .iter()
                .map(|entry| {
                    (
                        entry.key().clone(),
                        LatencySummary::from_samples(entry.value()),
                    )
                })
                .collect(),
        }
    }
}

impl MetricsSink for CounterMetrics {
    fn record_payment(&self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.payment_success.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => self.payment_fail.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_refund(&self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.refund_success.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => self.refund_fail.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_retry(&self, _operation: &str) {
        self.transaction_retry.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, operation: &str, duration: Duration) {
        let mut samples = self.latencies.entry(operation.to_string()).or_default();
        if samples.len() == MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(duration);
    }
}

// -----------------------------------------------------------------------------
// Prometheus
// -----------------------------------------------------------------------------

/// Payment confirmations by outcome.
pub static PAYMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_payments_total",
        "Total number of payment confirmations",
        &["status"]
    )
    .expect("Failed to register payments_total")
});

/// Refund creations by outcome.
pub static REFUNDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_refunds_total",
        "Total number of refund requests",
        &["status"]
    )
    .expect("Failed to register refunds_total")
});

/// Units of work retried after store contention.
pub static TRANSACTION_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_transaction_retries_total",
        "Total number of transaction retries after contention",
        &["operation"]
    )
    .expect("Failed to register transaction_retries_total")
});

/// Operation latency (reconciliation runs, payment and refund units of work).
pub static OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_operation_duration_seconds",
        "Ledger operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register operation_duration")
});

/// PostgreSQL query duration, recorded by the database store.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&REFUNDS_TOTAL);
    Lazy::force(&TRANSACTION_RETRIES_TOTAL);
    Lazy::force(&OPERATION_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

/// Sink backed by the process-wide Prometheus registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    pub fn new() -> Self {
        init_metrics();
        Self
    }

    fn inc(counter: &CounterVec, label: &str) {
        match counter.get_metric_with_label_values(&[label]) {
            Ok(c) => c.inc(),
            Err(e) => warn!(error = %e, label, "Failed to record counter"),
        }
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_payment(&self, outcome: Outcome) {
        Self::inc(&PAYMENTS_TOTAL, outcome.as_str());
    }

    fn record_refund(&self, outcome: Outcome) {
        Self::inc(&REFUNDS_TOTAL, outcome.as_str());
    }

    fn record_retry(&self, operation: &str) {
        Self::inc(&TRANSACTION_RETRIES_TOTAL, operation);
    }

    fn record_latency(&self, operation: &str, duration: Duration) {
        match OPERATION_DURATION.get_metric_with_label_values(&[operation]) {
            Ok(h) => h.observe(duration.as_secs_f64()),
            Err(e) => warn!(error = %e, operation, "Failed to record latency"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_counter_metrics_snapshot() {
        let metrics = CounterMetrics::new();
        metrics.record_payment(Outcome::Success);
        metrics.record_payment(Outcome::Success);
        metrics.record_payment(Outcome::Failure);
        metrics.record_refund(Outcome::Failure);
        metrics.record_retry("create_refund");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.payment_success_count, 2);
        assert_eq!(snapshot.payment_fail_count, 1);
        assert_eq!(snapshot.refund_success_count, 0);
        assert_eq!(snapshot.refund_fail_count, 1);
        assert_eq!(snapshot.transaction_retry_count, 1);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = CounterMetrics::new();
        for ms in 1..=(MAX_LATENCY_SAMPLES as u64 + 10) {
            metrics.record_latency("reconciliation", Duration::from_millis(ms));
        }
        let summary = metrics.snapshot().latency["reconciliation"];
        assert_eq!(summary.samples, MAX_LATENCY_SAMPLES);
        assert_eq!(summary.max_micros, (MAX_LATENCY_SAMPLES as u64 + 10) * 1000);
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = CounterMetrics::new();
        for ms in 1..=100 {
            metrics.record_latency("confirm_payment", Duration::from_millis(ms));
        }
        let summary = metrics.snapshot().latency["confirm_payment"];
        assert_eq!(summary.p50_micros, 50_000);
        assert_eq!(summary.p95_micros, 95_000);
        assert_eq!(summary.max_micros, 100_000);
    }

    #[test]
    fn test_outcome_of_result() {
        assert_eq!(Outcome::of(&Ok::<_, ()>(1)), Outcome::Success);
        assert_eq!(Outcome::of(&Err::<(), _>("boom")), Outcome::Failure);
    }

    #[test]
    #[serial]
    fn test_prometheus_sink_increments_registry() {
        let sink = PrometheusMetrics::new();
        let before = PAYMENTS_TOTAL.with_label_values(&["ok"]).get();
        sink.record_payment(Outcome::Success);
        let after = PAYMENTS_TOTAL.with_label_values(&["ok"]).get();
        assert_eq!(after - before, 1.0);

        sink.record_latency("reconciliation", Duration::from_millis(5));
        assert!(get_metrics().contains("ledger_operation_duration_seconds"));
    }
}
