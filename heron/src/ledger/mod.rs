//! Per-job status ledger keyed by correlation id.
//!
//! The ledger outlives individual queue messages: a job that is retried,
//! dead-lettered and re-injected keeps a single entry that follows it from
//! queue to queue. Entries become immutable once `finished_at` is set.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::job::JobId;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresLedger;

/// Where a job currently stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Waiting,
    Active,
    Completed,
    /// Permanently dropped after exhausting dead-letter re-injections.
    Failed,
    DeadLettered,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerState::Waiting => "waiting",
            LedgerState::Active => "active",
            LedgerState::Completed => "completed",
            LedgerState::Failed => "failed",
            LedgerState::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for LedgerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent failure observed for a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub reason: String,
    pub stack: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(reason: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            reason: reason.into(),
            stack,
            failed_at: Utc::now(),
        }
    }
}

/// One job's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub correlation_id: CorrelationId,
    /// Id of the message currently representing the job.
    pub job_id: JobId,
    pub queue: String,
    pub state: LedgerState,
    pub retry_count: u32,
    pub dlq_retry_count: u32,
    /// Processing attempts across the whole lifetime, including DLQ cycles.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_failure: Option<FailureRecord>,
    /// Correlation id of the dropped job this one replays, if any.
    pub replay_of: Option<CorrelationId>,
}

/// A state change reported by the producer, the workers or the inspector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Enqueued {
        job_id: JobId,
        queue: String,
        retry_count: u32,
        dlq_retry_count: u32,
        replay_of: Option<CorrelationId>,
    },
    Started {
        job_id: JobId,
        queue: String,
        retry_count: u32,
        dlq_retry_count: u32,
    },
    Completed {
        job_id: JobId,
    },
    Retried {
        job_id: JobId,
        retry_count: u32,
        failure: FailureRecord,
    },
    DeadLettered {
        job_id: Option<JobId>,
        queue: String,
        failure: FailureRecord,
    },
    Reinjected {
        job_id: JobId,
        queue: String,
        dlq_retry_count: u32,
    },
    Dropped {
        dlq_retry_count: u32,
        failure: Option<FailureRecord>,
    },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Enqueued { .. } => "enqueued",
            Transition::Started { .. } => "started",
            Transition::Completed { .. } => "completed",
            Transition::Retried { .. } => "retried",
            Transition::DeadLettered { .. } => "dead_lettered",
            Transition::Reinjected { .. } => "reinjected",
            Transition::Dropped { .. } => "dropped",
        }
    }
}

impl LedgerEntry {
    fn seed(correlation_id: CorrelationId, transition: &Transition, now: DateTime<Utc>) -> Self {
        let (job_id, queue) = match transition {
            Transition::Enqueued { job_id, queue, .. }
            | Transition::Started { job_id, queue, .. }
            | Transition::Reinjected { job_id, queue, .. } => (job_id.clone(), queue.clone()),
            Transition::DeadLettered { job_id, queue, .. } => {
                (job_id.clone().unwrap_or_default(), queue.clone())
            }
            Transition::Completed { job_id } | Transition::Retried { job_id, .. } => {
                (job_id.clone(), String::new())
            }
            Transition::Dropped { .. } => (JobId::default(), String::new()),
        };

        Self {
            correlation_id,
            job_id,
            queue,
            state: LedgerState::Waiting,
            retry_count: 0,
            dlq_retry_count: 0,
            attempts: 0,
            enqueued_at: now,
            last_attempt_at: None,
            finished_at: None,
            last_failure: None,
            replay_of: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Apply `transition`. Returns false, leaving the entry untouched, when
    /// the entry is already terminal.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }

        match transition {
            Transition::Enqueued {
                job_id,
                queue,
                retry_count,
                dlq_retry_count,
                replay_of,
            } => {
                self.job_id = job_id;
                self.queue = queue;
                self.state = LedgerState::Waiting;
                self.retry_count = retry_count;
                self.dlq_retry_count = dlq_retry_count;
                if replay_of.is_some() {
                    self.replay_of = replay_of;
                }
            }
            Transition::Started {
                job_id,
                queue,
                retry_count,
                dlq_retry_count,
            } => {
                self.job_id = job_id;
                self.queue = queue;
                self.state = LedgerState::Active;
                self.retry_count = retry_count;
                self.dlq_retry_count = self.dlq_retry_count.max(dlq_retry_count);
                self.attempts += 1;
                self.last_attempt_at = Some(now);
            }
            Transition::Completed { job_id } => {
                self.job_id = job_id;
                self.state = LedgerState::Completed;
                self.finished_at = Some(now);
            }
            Transition::Retried {
                job_id,
                retry_count,
                failure,
            } => {
                self.job_id = job_id;
                self.state = LedgerState::Waiting;
                self.retry_count = retry_count;
                self.last_failure = Some(failure);
            }
            Transition::DeadLettered {
                job_id,
                queue,
                failure,
            } => {
                if let Some(job_id) = job_id {
                    self.job_id = job_id;
                }
                self.queue = queue;
                self.state = LedgerState::DeadLettered;
                self.last_failure = Some(failure);
            }
            Transition::Reinjected {
                job_id,
                queue,
                dlq_retry_count,
            } => {
                self.job_id = job_id;
                self.queue = queue;
                self.state = LedgerState::Waiting;
                self.retry_count = 0;
                self.dlq_retry_count = dlq_retry_count;
            }
            Transition::Dropped {
                dlq_retry_count,
                failure,
            } => {
                self.state = LedgerState::Failed;
                self.dlq_retry_count = dlq_retry_count;
                if failure.is_some() {
                    self.last_failure = failure;
                }
                self.finished_at = Some(now);
            }
        }
        true
    }
}

/// Storage for ledger entries.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Record a transition, creating the entry on first observation.
    ///
    /// Returns `Ok(false)` when the entry is terminal and the transition
    /// was refused; `Err` only for storage failures.
    async fn observe(
        &self,
        correlation_id: &CorrelationId,
        transition: Transition,
    ) -> anyhow::Result<bool>;

    async fn get(&self, correlation_id: &CorrelationId) -> anyhow::Result<Option<LedgerEntry>>;

    /// Look up the entry whose current message id is `job_id`.
    async fn find_by_job_id(&self, job_id: &JobId) -> anyhow::Result<Option<LedgerEntry>>;

    /// Entries in any of `states` (all entries when empty), oldest first.
    async fn list(
        &self,
        states: &[LedgerState],
        start: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<LedgerEntry>>;

    /// Delete entries in any of `states` (all entries when empty).
    async fn clear(&self, states: &[LedgerState]) -> anyhow::Result<u64>;
}

/// Ledger held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: RwLock<HashMap<CorrelationId, LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn state_matches(states: &[LedgerState], state: LedgerState) -> bool {
    states.is_empty() || states.contains(&state)
}

#[async_trait]
impl JobLedger for InMemoryLedger {
    async fn observe(
        &self,
        correlation_id: &CorrelationId,
        transition: Transition,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let entry = entries
            .entry(correlation_id.clone())
            .or_insert_with(|| LedgerEntry::seed(correlation_id.clone(), &transition, now));

        let name = transition.name();
        let applied = entry.apply(transition, now);
        if !applied {
            tracing::debug!(
                correlation_id = %correlation_id,
                transition = name,
                "ledger entry is terminal; transition ignored"
            );
        }
        Ok(applied)
    }

    async fn get(&self, correlation_id: &CorrelationId) -> anyhow::Result<Option<LedgerEntry>> {
        Ok(self.entries.read().get(correlation_id).cloned())
    }

    async fn find_by_job_id(&self, job_id: &JobId) -> anyhow::Result<Option<LedgerEntry>> {
        Ok(self
            .entries
            .read()
            .values()
            .find(|entry| &entry.job_id == job_id)
            .cloned())
    }

    async fn list(
        &self,
        states: &[LedgerState],
        start: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<LedgerEntry>> {
        let entries = self.entries.read();
        let mut matching: Vec<&LedgerEntry> = entries
            .values()
            .filter(|entry| state_matches(states, entry.state))
            .collect();
        matching.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.correlation_id.cmp(&b.correlation_id))
        });
        Ok(matching
            .into_iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn clear(&self, states: &[LedgerState]) -> anyhow::Result<u64> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !state_matches(states, entry.state));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueued(id: &str) -> Transition {
        Transition::Enqueued {
            job_id: JobId::from(id),
            queue: "main".into(),
            retry_count: 0,
            dlq_retry_count: 0,
            replay_of: None,
        }
    }

    fn started(id: &str, retry_count: u32) -> Transition {
        Transition::Started {
            job_id: JobId::from(id),
            queue: "main".into(),
            retry_count,
            dlq_retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_full_success_lifecycle() {
        let ledger = InMemoryLedger::new();
        let corr = CorrelationId::new();

        assert!(ledger.observe(&corr, enqueued("1")).await.unwrap());
        assert!(ledger.observe(&corr, started("1", 0)).await.unwrap());
        ledger
            .observe(
                &corr,
                Transition::Retried {
                    job_id: JobId::from("2"),
                    retry_count: 1,
                    failure: FailureRecord::new("boom", None),
                },
            )
            .await
            .unwrap();
        ledger.observe(&corr, started("2", 1)).await.unwrap();
        ledger
            .observe(&corr, Transition::Completed { job_id: JobId::from("2") })
            .await
            .unwrap();

        let entry = ledger.get(&corr).await.unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Completed);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.job_id, JobId::from("2"));
        assert!(entry.finished_at.is_some());
        assert_eq!(entry.last_failure.unwrap().reason, "boom");
    }

    #[tokio::test]
    async fn test_terminal_entry_refuses_transitions() {
        let ledger = InMemoryLedger::new();
        let corr = CorrelationId::new();
        ledger.observe(&corr, enqueued("1")).await.unwrap();
        ledger
            .observe(
                &corr,
                Transition::Dropped {
                    dlq_retry_count: 3,
                    failure: None,
                },
            )
            .await
            .unwrap();

        let before = ledger.get(&corr).await.unwrap().unwrap();
        assert!(!ledger.observe(&corr, started("1", 0)).await.unwrap());
        assert_eq!(ledger.get(&corr).await.unwrap().unwrap(), before);
        assert_eq!(before.state, LedgerState::Failed);
    }

    #[tokio::test]
    async fn test_first_observation_by_worker_creates_entry() {
        let ledger = InMemoryLedger::new();
        let corr = CorrelationId::from("RPT-1");
        ledger.observe(&corr, started("m-1", 2)).await.unwrap();

        let entry = ledger.find_by_job_id(&JobId::from("m-1")).await.unwrap().unwrap();
        assert_eq!(entry.correlation_id, corr);
        assert_eq!(entry.state, LedgerState::Active);
        assert_eq!(entry.retry_count, 2);
    }

    #[tokio::test]
    async fn test_reinjection_resets_retry_but_keeps_dlq_count() {
        let ledger = InMemoryLedger::new();
        let corr = CorrelationId::new();
        ledger.observe(&corr, enqueued("1")).await.unwrap();
        ledger.observe(&corr, started("1", 2)).await.unwrap();
        ledger
            .observe(
                &corr,
                Transition::DeadLettered {
                    job_id: None,
                    queue: "dlq".into(),
                    failure: FailureRecord::new("boom", Some("trace".into())),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            ledger.get(&corr).await.unwrap().unwrap().state,
            LedgerState::DeadLettered
        );

        ledger
            .observe(
                &corr,
                Transition::Reinjected {
                    job_id: JobId::from("3"),
                    queue: "main".into(),
                    dlq_retry_count: 1,
                },
            )
            .await
            .unwrap();

        let entry = ledger.get(&corr).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.dlq_retry_count, 1);
        assert_eq!(entry.queue, "main");
        assert_eq!(entry.state, LedgerState::Waiting);
    }

    #[tokio::test]
    async fn test_list_and_clear_by_state() {
        let ledger = InMemoryLedger::new();
        for i in 0..3 {
            let corr = CorrelationId::new();
            ledger.observe(&corr, enqueued(&i.to_string())).await.unwrap();
            if i == 0 {
                ledger
                    .observe(&corr, Transition::Completed { job_id: JobId::from("0") })
                    .await
                    .unwrap();
            }
        }

        assert_eq!(ledger.list(&[LedgerState::Waiting], 0, 10).await.unwrap().len(), 2);
        assert_eq!(ledger.list(&[], 0, 10).await.unwrap().len(), 3);
        assert_eq!(ledger.list(&[], 1, 1).await.unwrap().len(), 1);

        assert_eq!(ledger.clear(&[LedgerState::Completed]).await.unwrap(), 1);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.clear(&[]).await.unwrap(), 2);
        assert!(ledger.is_empty());
    }
}
