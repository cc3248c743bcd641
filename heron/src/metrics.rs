//! Prometheus metrics for heron.
//!
//! # Metrics
//!
//! ## Counters
//! - `heron_jobs_enqueued_total` - Jobs published by producers
//! - `heron_jobs_processed_total` - Main-queue deliveries settled, by outcome
//! - `heron_dead_letter_total` - Dead-letter decisions (reinjected, dropped)
//!
//! ## Gauges
//! - `heron_queue_depth` - Messages per queue and state
//!
//! ## Histograms
//! - `heron_job_duration_seconds` - Processing duration by outcome
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for heron metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `queue`.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("heron_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["queue"]).expect("heron_jobs_enqueued_total metric creation failed")
});

/// Labels: `queue`, `outcome` (completed, retried, dead_lettered, rejected).
pub static JOBS_PROCESSED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "heron_jobs_processed_total",
        "Total number of deliveries settled by job workers",
    );
    CounterVec::new(opts, &["queue", "outcome"])
        .expect("heron_jobs_processed_total metric creation failed")
});

/// Labels: `outcome` (reinjected, dropped).
pub static DEAD_LETTER_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "heron_dead_letter_total",
        "Total number of dead-letter worker decisions",
    );
    CounterVec::new(opts, &["outcome"]).expect("heron_dead_letter_total metric creation failed")
});

/// Labels: `queue`, `state`.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("heron_queue_depth", "Current number of messages per queue state");
    GaugeVec::new(opts, &["queue", "state"]).expect("heron_queue_depth metric creation failed")
});

/// Labels: `queue`, `outcome`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "heron_job_duration_seconds",
        "Job processing duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "outcome"])
        .expect("heron_job_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_PROCESSED_TOTAL.clone()),
        Box::new(DEAD_LETTER_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(queue: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_job_processed(queue: &str, outcome: &str) {
    JOBS_PROCESSED_TOTAL
        .with_label_values(&[queue, outcome])
        .inc();
}

pub fn record_dead_letter(outcome: &str) {
    DEAD_LETTER_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_queue_depth(queue: &str, state: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue, state]).set(depth);
}

pub fn observe_job_duration(queue: &str, outcome: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[queue, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_enqueued("main-queue");
        record_job_processed("main-queue", "completed");
        record_dead_letter("dropped");
        set_queue_depth("main-queue", "waiting", 4.0);
        observe_job_duration("main-queue", "completed", 0.25);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("heron_jobs_enqueued_total"));
        assert!(output.contains("heron_jobs_processed_total"));
        assert!(output.contains("heron_dead_letter_total"));
        assert!(output.contains("heron_queue_depth"));
    }
}
