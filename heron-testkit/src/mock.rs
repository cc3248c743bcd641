use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use heron::*;
use parking_lot::Mutex;

use crate::TestTask;

/// What a [`ScriptedProcessor`] does with each attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Script {
    Succeed,
    /// Fail the first `n` attempts of every correlation id, then succeed.
    FailTimes(u32),
    AlwaysFail,
    Panic,
    /// Sleep, then succeed.
    Sleep(Duration),
}

#[derive(Clone, Debug)]
pub struct AttemptRecord {
    pub job_id: JobId,
    pub correlation_id: CorrelationId,
    pub name: String,
    pub retry_count: u32,
    pub dlq_retry_count: u32,
}

/// Processor that records every attempt and fails according to a [`Script`].
#[derive(Clone)]
pub struct ScriptedProcessor {
    script: Arc<Mutex<Script>>,
    attempts: Arc<Mutex<Vec<AttemptRecord>>>,
    per_job: Arc<Mutex<HashMap<CorrelationId, u32>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedProcessor {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            attempts: Arc::new(Mutex::new(Vec::new())),
            per_job: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Script::Succeed)
    }

    pub fn failing() -> Self {
        Self::new(Script::AlwaysFail)
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Attempts observed for one job across all of its copies.
    pub fn attempts_for(&self, correlation_id: &CorrelationId) -> Vec<AttemptRecord> {
        self.attempts
            .lock()
            .iter()
            .filter(|attempt| &attempt.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Highest number of attempts that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn assert_attempt_count_eq(&self, expected: usize) {
        let actual = self.attempt_count();
        assert_eq!(actual, expected, "Expected {expected} attempts, got {actual}");
    }
}

impl Default for ScriptedProcessor {
    fn default() -> Self {
        Self::succeeding()
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobProcessor<TestTask> for ScriptedProcessor {
    async fn process(&self, job: &Job<TestTask>) -> anyhow::Result<()> {
        // Read before the attempt is visible so `set_script` only affects later attempts.
        let script = self.script.lock().clone();
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        self.attempts.lock().push(AttemptRecord {
            job_id: job.id.clone(),
            correlation_id: job.correlation_id.clone(),
            name: job.payload.name.clone(),
            retry_count: job.retry_count,
            dlq_retry_count: job.dlq_retry_count,
        });
        let seen = {
            let mut per_job = self.per_job.lock();
            let count = per_job.entry(job.correlation_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        match script {
            Script::Succeed => Ok(()),
            Script::FailTimes(n) if seen <= n => {
                anyhow::bail!("scripted failure {seen} of {n} for {}", job.payload.name)
            }
            Script::FailTimes(_) => Ok(()),
            Script::AlwaysFail => anyhow::bail!("scripted failure for {}", job.payload.name),
            Script::Panic => panic!("scripted panic for {}", job.payload.name),
            Script::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

/// In-memory connector that counts dials and can be told to refuse them.
#[derive(Debug)]
pub struct CountingConnector {
    broker: Arc<InMemoryBroker>,
    dials: AtomicUsize,
    refuse: AtomicBool,
}

impl CountingConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            dials: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(self.broker.clone() as Arc<dyn Transport>)
    }

    fn endpoint(&self) -> String {
        "counting://memory".to_string()
    }
}
