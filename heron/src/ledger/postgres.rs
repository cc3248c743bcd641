use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use super::{JobLedger, LedgerEntry, LedgerState, Transition};
use crate::correlation::CorrelationId;
use crate::job::JobId;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS heron_ledger (
    correlation_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    state TEXT NOT NULL,
    enqueued_at TIMESTAMPTZ NOT NULL,
    entry JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS heron_ledger_job_id_idx ON heron_ledger (job_id);
CREATE INDEX IF NOT EXISTS heron_ledger_state_idx ON heron_ledger (state, enqueued_at);
"#;

fn decode_entry(row: &PgRow) -> anyhow::Result<LedgerEntry> {
    let Json(entry): Json<LedgerEntry> = row.try_get("entry")?;
    Ok(entry)
}

/// PostgreSQL-backed job ledger.
///
/// Each entry is one row keyed by correlation id with the full entry in a
/// JSONB column; the indexed columns mirror it for lookups. Transitions lock
/// the row, so concurrent observers of one job apply in sequence.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger table and indexes if they are missing.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn states_param(states: &[LedgerState]) -> Vec<String> {
        states.iter().map(|state| state.as_str().to_string()).collect()
    }

    async fn locked_entry(
        tx: &mut Transaction<'_, Postgres>,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT entry
            FROM heron_ledger
            WHERE correlation_id = $1
            FOR UPDATE
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref().map(decode_entry).transpose()
    }
}

#[async_trait]
impl JobLedger for PostgresLedger {
    async fn observe(
        &self,
        correlation_id: &CorrelationId,
        transition: Transition,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let name = transition.name();

        // A second pass only happens when a concurrent observer inserted the
        // row between our read and our insert.
        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let existing = Self::locked_entry(&mut tx, correlation_id).await?;
            let exists = existing.is_some();
            let mut entry = existing
                .unwrap_or_else(|| LedgerEntry::seed(correlation_id.clone(), &transition, now));

            if !entry.apply(transition.clone(), now) {
                tx.rollback().await?;
                debug!(
                    correlation_id = %correlation_id,
                    transition = name,
                    "ledger entry is terminal; transition ignored"
                );
                return Ok(false);
            }

            let written = if exists {
                sqlx::query(
                    r#"
                    UPDATE heron_ledger
                    SET job_id = $2, state = $3, entry = $4, updated_at = NOW()
                    WHERE correlation_id = $1
                    "#,
                )
                .bind(correlation_id.as_str())
                .bind(entry.job_id.as_str())
                .bind(entry.state.as_str())
                .bind(Json(&entry))
                .execute(&mut *tx)
                .await?
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO heron_ledger (correlation_id, job_id, state, enqueued_at, entry, updated_at)
                    VALUES ($1, $2, $3, $4, $5, NOW())
                    ON CONFLICT (correlation_id) DO NOTHING
                    "#,
                )
                .bind(correlation_id.as_str())
                .bind(entry.job_id.as_str())
                .bind(entry.state.as_str())
                .bind(entry.enqueued_at)
                .bind(Json(&entry))
                .execute(&mut *tx)
                .await?
            };

            if written.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }
            tx.commit().await?;
            return Ok(true);
        }

        anyhow::bail!("ledger entry {correlation_id} changed concurrently while being created")
    }

    async fn get(&self, correlation_id: &CorrelationId) -> anyhow::Result<Option<LedgerEntry>> {
        let row = sqlx::query("SELECT entry FROM heron_ledger WHERE correlation_id = $1")
            .bind(correlation_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_entry).transpose()
    }

    async fn find_by_job_id(&self, job_id: &JobId) -> anyhow::Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT entry
            FROM heron_ledger
            WHERE job_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_entry).transpose()
    }

    async fn list(
        &self,
        states: &[LedgerState],
        start: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT entry
            FROM heron_ledger
            WHERE cardinality($1::text[]) = 0 OR state = ANY($1)
            ORDER BY enqueued_at ASC, correlation_id ASC
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(Self::states_param(states))
        .bind(i64::try_from(start)?)
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_entry).collect()
    }

    async fn clear(&self, states: &[LedgerState]) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM heron_ledger WHERE cardinality($1::text[]) = 0 OR state = ANY($1)",
        )
        .bind(Self::states_param(states))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
