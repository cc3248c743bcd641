use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, DeadLetterPolicy, RequeueStrategy, RetryPolicy};

/// Prefix for environment overrides, e.g. `HERON__RETRY__MAX_RETRIES=5`.
pub const ENV_PREFIX: &str = "HERON";

/// Top-level configuration for a heron deployment.
///
/// Every section falls back to its `Default`, so an empty file (or no file at
/// all) yields a working in-process setup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeronConfig {
    pub topology: TopologyConfig,
    pub retry: RetryConfig,
    pub dead_letter: DeadLetterConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
    pub redis: RedisConfig,
}

impl HeronConfig {
    /// Load configuration from an optional TOML file layered under
    /// `HERON__*` environment variables.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("failed to assemble heron configuration")?
            .try_deserialize()
            .context("failed to deserialize heron configuration")
    }

    /// Retry policy for the main queue.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            backoff: self.retry.backoff.clone(),
        }
    }

    /// Re-injection policy for the dead-letter queue.
    pub fn dead_letter_policy(&self) -> DeadLetterPolicy {
        DeadLetterPolicy {
            max_retries: self.dead_letter.max_retries,
            reinject_delay: Duration::from_millis(self.dead_letter.reinject_delay_ms),
        }
    }
}

/// Queue names and per-queue transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Name of the main work queue.
    pub main_queue: String,
    /// Name of the dead-letter queue bound to the main queue.
    pub dead_letter_queue: String,
    /// How long a delivery may stay unacknowledged before it is considered stalled.
    pub stall_timeout_ms: u64,
    /// Number of stalls tolerated before a delivery is rejected to the DLQ.
    pub max_stalled: u32,
    /// Completed main-queue entries older than this are pruned.
    pub completed_max_age_secs: u64,
    /// At most this many completed main-queue entries are retained.
    pub completed_max_count: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            main_queue: "main-queue".to_string(),
            dead_letter_queue: "dead-letter-queue".to_string(),
            stall_timeout_ms: 30_000,
            max_stalled: 1,
            completed_max_age_secs: 3_600,
            completed_max_count: 100,
        }
    }
}

/// Main-queue retry settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Processing failures tolerated on the main queue before dead-lettering.
    pub max_retries: u32,
    /// Delay applied to each requeued attempt.
    pub backoff: Backoff,
    /// How exhausted jobs reach the dead-letter queue.
    pub strategy: RequeueStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            strategy: RequeueStrategy::default(),
        }
    }
}

/// Dead-letter worker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Run the dead-letter worker alongside the job workers.
    pub enabled: bool,
    /// Re-injections allowed before a job is permanently dropped.
    pub max_retries: u32,
    /// Delay before a re-injected job becomes visible on the main queue.
    pub reinject_delay_ms: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            reinject_delay_ms: 0,
        }
    }
}

/// Worker pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent job slots; also the consumer prefetch.
    pub concurrency: usize,
    /// Idle sleep between empty polls.
    pub poll_interval_ms: u64,
    /// Optional cap on how fast new jobs are pulled.
    pub rate_limit: Option<RateLimitConfig>,
    /// Interval between stall scans.
    pub housekeeper_interval_ms: u64,
    /// Upper bound on waiting for in-flight jobs during shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval_ms: 50,
            rate_limit: Some(RateLimitConfig::default()),
            housekeeper_interval_ms: 5_000,
            shutdown_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimitConfig>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_housekeeper_interval(mut self, interval: Duration) -> Self {
        self.housekeeper_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Token-bucket limit: at most `max` jobs per `duration_ms`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max: u32,
    pub duration_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: 10,
            duration_ms: 1_000,
        }
    }
}

/// Log output settings consumed by the operator binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Redis transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace for every key the transport touches.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "heron".to_string(),
        }
    }
}
