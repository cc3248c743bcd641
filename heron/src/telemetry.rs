//! Tracing and telemetry instrumentation for heron.
//!
//! Span constructors for the enqueue, process and dead-letter paths, plus
//! `record_*` helpers that emit a structured log line and, with the
//! `metrics` feature, update the Prometheus collectors in [`crate::metrics`].
//! Every helper compiles to logging only when the feature is off.

use std::future::Future;

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Outcome label for processed jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Completed,
    Retried,
    DeadLettered,
    Rejected,
    /// The delivery went stale before it could be settled.
    Reclaimed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Retried => "retried",
            Outcome::DeadLettered => "dead_lettered",
            Outcome::Rejected => "rejected",
            Outcome::Reclaimed => "reclaimed",
        }
    }
}

/// Span for publishing a new job.
#[must_use]
pub fn job_enqueue_span(queue: impl AsRef<str>, correlation_id: impl AsRef<str>) -> Span {
    info_span!(
        "heron.enqueue",
        queue = %queue.as_ref(),
        correlation_id = %correlation_id.as_ref(),
    )
}

/// Span covering one delivery on the main queue, from receipt to settlement.
#[must_use]
pub fn job_process_span(
    queue: impl AsRef<str>,
    job_id: impl AsRef<str>,
    correlation_id: impl AsRef<str>,
    retry_count: u32,
) -> Span {
    info_span!(
        "heron.process",
        queue = %queue.as_ref(),
        job_id = %job_id.as_ref(),
        correlation_id = %correlation_id.as_ref(),
        retry_count,
    )
}

/// Span covering one dead-letter delivery.
#[must_use]
pub fn dead_letter_span(job_id: impl AsRef<str>, correlation_id: impl AsRef<str>) -> Span {
    info_span!(
        "heron.dead_letter",
        job_id = %job_id.as_ref(),
        correlation_id = %correlation_id.as_ref(),
    )
}

/// Span for an administrative operation.
#[must_use]
pub fn admin_span(operation: &'static str) -> Span {
    info_span!("heron.admin", operation)
}

/// Run `future` inside a [`job_process_span`].
pub fn instrument_process<F>(
    queue: impl AsRef<str>,
    job_id: impl AsRef<str>,
    correlation_id: impl AsRef<str>,
    retry_count: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(job_process_span(queue, job_id, correlation_id, retry_count))
}

/// Record a job enqueue.
pub fn record_job_enqueued(queue: impl AsRef<str>, job_id: impl AsRef<str>) {
    tracing::info!(
        queue = %queue.as_ref(),
        job_id = %job_id.as_ref(),
        "job enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(queue.as_ref());
}

/// Record the settlement of a processed job.
pub fn record_job_processed(queue: impl AsRef<str>, outcome: Outcome) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_job_processed(queue.as_ref(), outcome.as_str());

    #[cfg(not(feature = "metrics"))]
    let _ = (queue, outcome);
}

/// Record a dead-letter decision (`reinjected` or `dropped`).
pub fn record_dead_letter(outcome: &'static str) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_dead_letter(outcome);

    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Update the depth gauge for one queue state.
pub fn set_queue_depth(queue: impl AsRef<str>, state: impl AsRef<str>, depth: u64) {
    tracing::trace!(
        queue = %queue.as_ref(),
        state = %state.as_ref(),
        depth,
        "queue depth"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(queue.as_ref(), state.as_ref(), depth as f64);
}

/// Start timing a job.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Finish timing a job and observe its duration.
pub fn record_job_end(handle: JobTimingHandle, queue: impl AsRef<str>, outcome: Outcome) {
    let duration = handle.start.elapsed();
    tracing::debug!(
        job_id = %handle.job_id,
        queue = %queue.as_ref(),
        outcome = outcome.as_str(),
        elapsed_ms = duration.as_millis() as u64,
        "job settled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(queue.as_ref(), outcome.as_str(), duration.as_secs_f64());
}

/// Handle for tracking job execution duration.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

/// Install the global subscriber from logging settings.
///
/// `RUST_LOG` overrides `config.level`. Returns an error when a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoUtc::rfc_3339())
            .try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        // Disabled spans carry no metadata.
        let subscriber = tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).finish();
        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(
                job_process_span("q", "1", "c", 0).metadata().unwrap().name(),
                "heron.process"
            );
            assert_eq!(
                job_enqueue_span("q", "c").metadata().unwrap().name(),
                "heron.enqueue"
            );
            assert_eq!(
                dead_letter_span("1", "c").metadata().unwrap().name(),
                "heron.dead_letter"
            );
            assert_eq!(admin_span("retry").metadata().unwrap().name(), "heron.admin");
        });
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_job_start("job-1");
        assert_eq!(handle.job_id(), "job-1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(handle.elapsed() >= std::time::Duration::from_millis(2));
        record_job_end(handle, "main", Outcome::Completed);
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_job_enqueued("main", "job-1");
        record_job_processed("main", Outcome::Retried);
        record_dead_letter("dropped");
        set_queue_depth("main", "waiting", 3);
    }

    #[test]
    fn test_init_tracing_rejects_bad_filter() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "heron=verbose".to_string(),
            json: false,
        };
        assert!(init_tracing(&config).is_err());
    }

    #[tokio::test]
    async fn test_instrument_process_passes_output_through() {
        let value = instrument_process("main", "1", "c", 0, async { 42 }).await;
        assert_eq!(value, 42);
    }
}
