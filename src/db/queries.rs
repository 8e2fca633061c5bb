use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{Job, JobFilter, JobPage, JobState, JobStats, Transition};
use crate::services::store::{JobStore, StoreError};

const JOB_COLUMNS: &str = "id, job_type, payload, state, attempt, result, error, owner_id, \
                           created_at, updated_at, heartbeat_at";

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let job_type: String = row.try_get("job_type")?;
    let state: String = row.try_get("state")?;
    let attempt: i32 = row.try_get("attempt")?;

    Ok(Job {
        id: row.try_get("id")?,
        job_type: job_type
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown job_type {job_type}")))?,
        payload: row.try_get("payload")?,
        state: state
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown state {state}")))?,
        attempt: u32::try_from(attempt)
            .map_err(|_| StoreError::Corrupt(format!("negative attempt {attempt}")))?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
    })
}

/// Column values a transition writes, besides `state`.
struct TransitionWrite {
    claims: bool,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl From<&Transition> for TransitionWrite {
    fn from(transition: &Transition) -> Self {
        let (result, error) = match transition {
            Transition::Complete { result, .. } => (Some(result.clone()), None),
            Transition::Fail { error, .. }
            | Transition::DeadLetter { error, .. }
            | Transition::PublishFailed { error, .. }
            | Transition::Cancel { reason: error } => (None, Some(error.clone())),
            Transition::Claim { .. }
            | Transition::Retry { .. }
            | Transition::Recover { .. }
            | Transition::Republish { .. } => (None, None),
        };
        Self {
            claims: matches!(transition, Transition::Claim { .. }),
            result,
            error,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, payload, state, attempt, owner_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.job_type.as_ref())
        .bind(&job.payload)
        .bind(job.state.as_ref())
        .bind(job.attempt as i32)
        .bind(&job.owner_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate(job.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<Job>, StoreError> {
        let write = TransitionWrite::from(&transition);
        let expected: Vec<String> = transition
            .expected_states()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = $2,
                attempt = CASE WHEN $3 THEN attempt + 1 ELSE attempt END,
                result = $4,
                error = $5,
                heartbeat_at = CASE WHEN $3 THEN NOW() ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1
              AND state = ANY($6)
              AND ($7::INTEGER IS NULL OR attempt = $7)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(transition.target_state().as_ref())
        .bind(write.claims)
        .bind(write.result)
        .bind(write.error)
        .bind(expected)
        .bind(transition.expected_attempt().map(|a| a as i32))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn heartbeat(&self, id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = NOW()
            WHERE id = $1 AND state = 'PROCESSING' AND attempt = $2
            "#,
        )
        .bind(id)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    async fn stalled(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE state = 'PROCESSING'
              AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn orphaned(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE state = 'QUEUED'
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage, StoreError> {
        let state = filter.state.map(|s| s.to_string());
        let job_type = filter.job_type.map(|t| t.to_string());
        let limit = filter.limit.max(1);
        let page = filter.page.max(1);
        let offset = (page - 1) as i64 * limit as i64;

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM jobs
            WHERE ($1::TEXT IS NULL OR state = $1)
              AND ($2::TEXT IS NULL OR job_type = $2)
            "#,
        )
        .bind(&state)
        .bind(&job_type)
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::TEXT IS NULL OR state = $1)
              AND ($2::TEXT IS NULL OR job_type = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(&state)
        .bind(&job_type)
        .bind(limit as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(JobPage {
            items: rows.iter().map(job_from_row).collect::<Result<_, _>>()?,
            total: total as u64,
            page,
            limit,
        })
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            let state: JobState = state
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("unknown state {state}")))?;
            stats.record(state, count as u64);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_writes() {
        let claim = TransitionWrite::from(&Transition::Claim { expected_attempt: 0 });
        assert!(claim.claims);
        assert!(claim.result.is_none() && claim.error.is_none());

        let done = TransitionWrite::from(&Transition::Complete {
            attempt: 1,
            result: serde_json::json!({"size": "M"}),
        });
        assert!(!done.claims);
        assert_eq!(done.result, Some(serde_json::json!({"size": "M"})));
        assert!(done.error.is_none());

        let dead = TransitionWrite::from(&Transition::DeadLetter { attempt: 3, error: "timeout".into() });
        assert!(dead.result.is_none());
        assert_eq!(dead.error.as_deref(), Some("timeout"));
    }
}
