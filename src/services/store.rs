//! Authoritative job state.
//!
//! Every state change goes through [`JobStore::transition`], a conditional
//! write: it only applies when the job is still in the state (and at the
//! attempt) the caller expects. A redelivered or raced message therefore
//! cannot apply the same transition twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{Job, JobFilter, JobPage, JobState, JobStats, Transition};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Apply `transition` if its precondition holds. `Ok(None)` means the
    /// precondition failed and nothing changed.
    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<Job>, StoreError>;

    /// Refresh the heartbeat of a running execution. Returns false when the
    /// job is no longer `PROCESSING` at `attempt`.
    async fn heartbeat(&self, id: Uuid, attempt: u32) -> Result<bool, StoreError>;

    /// `PROCESSING` jobs whose heartbeat is older than `before`.
    async fn stalled(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError>;

    /// `QUEUED` jobs untouched since `before`. Their message may never have
    /// reached the broker.
    async fn orphaned(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<JobPage, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} already exists")]
    Duplicate(Uuid),

    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

/// Job store kept in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.write();
        let Some(current) = jobs.get(&id) else {
            return Ok(None);
        };
        let Some(next) = current.apply(&transition, Utc::now()) else {
            return Ok(None);
        };
        jobs.insert(id, next.clone());
        Ok(Some(next))
    }

    async fn heartbeat(&self, id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        let mut jobs = self.write();
        match jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Processing && job.attempt == attempt => {
                job.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stalled(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError> {
        let mut stalled: Vec<Job> = self
            .read()
            .values()
            .filter(|job| {
                job.state == JobState::Processing
                    && job.heartbeat_at.map_or(true, |beat| beat < before)
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|job| job.updated_at);
        stalled.truncate(limit as usize);
        Ok(stalled)
    }

    async fn orphaned(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError> {
        let mut orphaned: Vec<Job> = self
            .read()
            .values()
            .filter(|job| job.state == JobState::Queued && job.updated_at < before)
            .cloned()
            .collect();
        orphaned.sort_by_key(|job| job.updated_at);
        orphaned.truncate(limit as usize);
        Ok(orphaned)
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage, StoreError> {
        let mut matching: Vec<Job> = self
            .read()
            .values()
            .filter(|job| filter.state.map_or(true, |s| job.state == s))
            .filter(|job| filter.job_type.map_or(true, |t| job.job_type == t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let limit = filter.limit.max(1);
        let offset = filter.page.saturating_sub(1) as usize * limit as usize;
        let items = matching.into_iter().skip(offset).take(limit as usize).collect();

        Ok(JobPage {
            items,
            total,
            page: filter.page.max(1),
            limit,
        })
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let mut stats = JobStats::default();
        for job in self.read().values() {
            stats.record(job.state, 1);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobType;
    use chrono::Duration;

    fn job() -> Job {
        Job::new(JobType::ImageGeneration, serde_json::json!({"image": "k"}), "u1")
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryJobStore::new();
        let job = job();
        tokio_test::assert_ok!(store.insert(&job).await);
        assert!(matches!(store.insert(&job).await, Err(StoreError::Duplicate(_))));
        assert_eq!(store.get(job.id).await.unwrap(), Some(job));
        assert_eq!(store.get(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let store = MemoryJobStore::new();
        let job = job();
        store.insert(&job).await.unwrap();

        let claimed = store
            .transition(job.id, Transition::Claim { expected_attempt: 0 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempt, 1);

        // Redelivered copy of the same message.
        assert!(store
            .transition(job.id, Transition::Claim { expected_attempt: 0 })
            .await
            .unwrap()
            .is_none());

        let done = Transition::Complete { attempt: 1, result: serde_json::json!({"url": "a"}) };
        assert!(store.transition(job.id, done.clone()).await.unwrap().is_some());
        let again = Transition::Complete { attempt: 1, result: serde_json::json!({"url": "b"}) };
        assert!(store.transition(job.id, again).await.unwrap().is_none());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.result, Some(serde_json::json!({"url": "a"})));
    }

    #[tokio::test]
    async fn test_transition_on_missing_job() {
        let store = MemoryJobStore::new();
        let result = store
            .transition(Uuid::new_v4(), Transition::Cancel { reason: "x".into() })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_and_stalled() {
        let store = MemoryJobStore::new();
        let job = job();
        store.insert(&job).await.unwrap();
        assert!(!store.heartbeat(job.id, 0).await.unwrap());

        store
            .transition(job.id, Transition::Claim { expected_attempt: 0 })
            .await
            .unwrap();
        assert!(store.heartbeat(job.id, 1).await.unwrap());
        assert!(!store.heartbeat(job.id, 2).await.unwrap());

        let past = Utc::now() - Duration::seconds(60);
        assert!(store.stalled(past, 10).await.unwrap().is_empty());

        let future = Utc::now() + Duration::seconds(60);
        let stalled = store.stalled(future, 10).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, job.id);
    }

    #[tokio::test]
    async fn test_orphaned_only_returns_idle_queued_jobs() {
        let store = MemoryJobStore::new();
        let queued = job();
        let claimed = job();
        store.insert(&queued).await.unwrap();
        store.insert(&claimed).await.unwrap();
        store
            .transition(claimed.id, Transition::Claim { expected_attempt: 0 })
            .await
            .unwrap();

        let past = Utc::now() - Duration::seconds(60);
        assert!(store.orphaned(past, 10).await.unwrap().is_empty());

        let future = Utc::now() + Duration::seconds(60);
        let orphaned = store.orphaned(future, 10).await.unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].id, queued.id);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let store = MemoryJobStore::new();
        for i in 0..5 {
            let job_type = if i % 2 == 0 { JobType::ChatTurn } else { JobType::SizeInference };
            let job = Job::new(job_type, serde_json::json!({}), "u1");
            store.insert(&job).await.unwrap();
            if i == 0 {
                store
                    .transition(job.id, Transition::Cancel { reason: "user".into() })
                    .await
                    .unwrap();
            }
        }

        let page = store
            .list(&JobFilter { job_type: Some(JobType::ChatTurn), page: 1, limit: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);

        let second = store
            .list(&JobFilter { job_type: Some(JobType::ChatTurn), page: 2, limit: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);

        let cancelled = store
            .list(&JobFilter { state: Some(JobState::Cancelled), page: 1, limit: 20, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(cancelled.total, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.queued, 4);
        assert_eq!(stats.cancelled, 1);
    }
}
