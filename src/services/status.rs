use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::JobSnapshot;
use crate::services::store::{JobStore, StoreError};

/// Read-only job lookups for pollers. Never writes.
#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn JobStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, StoreError> {
        Ok(self.store.get(job_id).await?.map(JobSnapshot::from))
    }

    /// Like [`get_status`](Self::get_status), but jobs of other owners are
    /// reported as absent.
    pub async fn get_owned_status(
        &self,
        job_id: Uuid,
        owner_id: &str,
    ) -> Result<Option<JobSnapshot>, StoreError> {
        Ok(self
            .get_status(job_id)
            .await?
            .filter(|snapshot| snapshot.job.owner_id == owner_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{Job, JobState, JobType, Transition};
    use crate::services::store::MemoryJobStore;

    #[tokio::test]
    async fn test_snapshot_tracks_store() {
        let store = Arc::new(MemoryJobStore::new());
        let status = StatusService::new(store.clone());
        let job = Job::new(JobType::ChatTurn, serde_json::json!({}), "u1");
        store.insert(&job).await.unwrap();

        let snapshot = status.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.job.state, JobState::Queued);
        assert!(!snapshot.terminal);

        store
            .transition(job.id, Transition::Cancel { reason: "stop".into() })
            .await
            .unwrap();
        let snapshot = status.get_status(job.id).await.unwrap().unwrap();
        assert!(snapshot.terminal);

        assert!(status.get_status(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_other_owners_see_nothing() {
        let store = Arc::new(MemoryJobStore::new());
        let status = StatusService::new(store.clone());
        let job = Job::new(JobType::SizeInference, serde_json::json!({}), "u1");
        store.insert(&job).await.unwrap();

        assert!(status.get_owned_status(job.id, "u1").await.unwrap().is_some());
        assert!(status.get_owned_status(job.id, "u2").await.unwrap().is_none());
    }
}
