//! Heron - reliable asynchronous job processing with bounded retry and
//! dead-letter quarantine.
//!
//! Producers publish jobs to a durable main queue. Workers consume them with
//! bounded concurrency and retry failures with backoff up to a configured
//! ceiling. Jobs that exhaust their retries move to a dead-letter queue,
//! where a second worker re-injects them a limited number of times before
//! dropping them for good. Operators inspect both queues and manually
//! re-inject dead-lettered jobs through [`QueueInspector`] or the HTTP
//! router in [`admin`].
//!
//! # Core Concepts
//!
//! - **Transport**: The [`Broker`], [`QueueInspect`] and [`StallScanner`]
//!   traits abstract the message store. [`InMemoryBroker`] ships in-tree;
//!   the `redis` feature adds a Redis-backed transport.
//!
//! - **Connection**: [`BrokerConnection`] dials a [`Connector`] lazily,
//!   declares the main and dead-letter queues, and hands the shared
//!   transport to every producer and worker.
//!
//! - **Retry**: [`RetryPolicy`] decides between requeue with backoff and
//!   dead-lettering; [`DeadLetterPolicy`] decides between re-injection and a
//!   permanent drop.
//!
//! - **Ledger**: [`JobLedger`] tracks each job by [`CorrelationId`] across
//!   retries, dead-lettering and re-injection.
//!
//! - **Runtime**: [`HeronRuntime`] ties the worker pool, the dead-letter
//!   worker and the stall housekeeper into a process with graceful shutdown.
//!
//! # Feature Flags
//!
//! - `admin-http` (default) - axum router for the queue administration API
//! - `redis` - Redis transport
//! - `postgres` - PostgreSQL job ledger via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use heron::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! let runtime = HeronRuntimeBuilder::<SendEmail>::new(HeronConfig::load(None)?)
//!     .with_connector(Arc::new(MemoryConnector::default()))
//!     .with_processor(Arc::new(processor_fn(|job: Job<SendEmail>| async move {
//!         deliver(&job.payload.to).await
//!     })))
//!     .build()?;
//! runtime.start().await?;
//! runtime.producer().enqueue(SendEmail { to: "a@b.c".into() }).await?;
//! ```

#[cfg(feature = "admin-http")]
/// HTTP administration surface.
///
/// The `admin` module exposes [`QueueInspector`] operations as an axum
/// router with `{status, data}` JSON envelopes.
pub mod admin;

/// Message transport abstraction and in-memory implementation.
///
/// The `broker` module defines the transport traits:
/// - [`Broker`] - publish, receive, acknowledge and reject
/// - [`QueueInspect`] - list, fetch, archive and purge stored messages
/// - [`StallScanner`] - recover deliveries whose consumer went away
/// - [`MessageState`] and [`QueueCounts`] - per-queue message states
pub mod broker;

/// Configuration loading and settings structures.
///
/// The `config` module defines [`HeronConfig`] and its sections, loaded
/// from defaults, an optional file and `HERON__*` environment variables.
pub mod config;

/// Lazily established, shared transport connection.
pub mod connection;

/// Prefetch-bounded delivery stream over one queue.
pub mod consumer;

/// Correlation identifiers that follow a job across queues.
pub mod correlation;

/// Worker for the dead-letter queue.
///
/// The `dead_letter` module provides [`DeadLetterWorker`], which re-injects
/// quarantined jobs into the main queue or drops them permanently.
pub mod dead_letter;

/// Administrative error taxonomy.
pub mod error;

/// Event publishing and subscription system.
///
/// The `events` module provides traits and types for job lifecycle events:
/// - [`JobEventPublisher`] for publishing
/// - [`JobEvent`] and [`JobEventPayload`] for event data
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// Queue inspection and manual re-injection.
pub mod inspector;

/// Core job definitions.
///
/// The `job` module defines the wire envelope and the types handlers see:
/// - [`Payload`] - marker trait for job payloads
/// - [`Envelope`] - payload plus retry counters and correlation id
/// - [`Job`] - what a processor receives
/// - [`JobId`] - unique message identifier
pub mod job;

/// Per-job status ledger.
pub mod ledger;

#[cfg(feature = "metrics")]
/// Prometheus collectors.
pub mod metrics;

/// Job publishing.
pub mod producer;

/// Token bucket limiting how fast workers pull jobs.
pub mod rate_limit;

/// Retry and dead-letter decisions.
///
/// The `retry` module provides [`RetryPolicy`], [`DeadLetterPolicy`] and
/// the [`Backoff`] schedules they use.
pub mod retry;

/// Runtime orchestration and worker management.
///
/// The `runtime` module provides:
/// - [`HeronRuntime`] - worker pool, dead-letter worker and housekeeping
/// - [`HeronRuntimeBuilder`] - dependency wiring from a [`HeronConfig`]
/// - [`ShutdownToken`] - graceful shutdown signaling
pub mod runtime;

/// Tracing spans, structured log helpers and subscriber setup.
pub mod telemetry;

/// Main-queue worker.
///
/// The `worker` module provides the [`JobProcessor`] trait implemented by
/// application code and [`JobWorker`], which applies the retry policy
/// around it.
pub mod worker;

pub use broker::*;
pub use config::*;
pub use connection::*;
pub use consumer::*;
pub use correlation::*;
pub use dead_letter::*;
pub use error::*;
pub use events::*;
pub use inspector::*;
pub use job::*;
pub use ledger::*;
pub use producer::*;
pub use rate_limit::*;
pub use retry::*;
pub use runtime::*;
pub use worker::*;
