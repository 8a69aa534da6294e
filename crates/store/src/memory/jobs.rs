use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use oncall_core::{BackgroundJob, JobStatus, JobType, NewJob};

use crate::error::{StoreError, StoreResult};
use crate::traits::{JobStore, STALE_ERROR};

use super::MemoryStore;

fn missing(id: Uuid) -> StoreError {
    StoreError::NotFound(format!("job {id}"))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StoreResult<BackgroundJob> {
        let mut state = self.lock();
        state.fault("enqueue")?;
        let row = BackgroundJob {
            id: Uuid::new_v4(),
            job_type: job.job_type,
            status: JobStatus::Pending,
            run_at: job.run_at,
            payload: job.payload,
            attempts: 0,
            max_attempts: job.max_attempts,
            last_error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
        };
        state.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim(
        &self,
        limit: u32,
        job_type: Option<&JobType>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<BackgroundJob>> {
        let mut state = self.lock();
        state.fault("claim")?;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now && j.attempts < j.max_attempts)
            .filter(|j| job_type.map_or(true, |t| &j.job_type == t))
            .map(|j| (j.run_at, j.id))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit as usize) {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.attempts += 1;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("complete")?;
        let job = state.jobs.get_mut(&id).ok_or_else(|| missing(id))?;
        job.status = JobStatus::Completed;
        job.finished_at = Some(now);
        Ok(())
    }

    async fn retry(&self, id: Uuid, run_at: DateTime<Utc>, error: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("retry")?;
        let job = state.jobs.get_mut(&id).ok_or_else(|| missing(id))?;
        job.status = JobStatus::Pending;
        job.run_at = run_at;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("fail")?;
        let job = state.jobs.get_mut(&id).ok_or_else(|| missing(id))?;
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        job.finished_at = Some(now);
        Ok(())
    }

    async fn cancel(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("cancel")?;
        let job = state.jobs.get_mut(&id).ok_or_else(|| missing(id))?;
        job.status = JobStatus::Cancelled;
        job.last_error = Some(reason.to_string());
        job.finished_at = Some(now);
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("reschedule")?;
        let job = state.jobs.get_mut(&id).ok_or_else(|| missing(id))?;
        job.status = JobStatus::Pending;
        job.run_at = run_at;
        job.attempts = job.attempts.saturating_sub(1);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<BackgroundJob>> {
        let mut state = self.lock();
        state.fault("get_job")?;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.lock();
        state.fault("cleanup")?;
        let before = state.jobs.len();
        state.jobs.retain(|_, j| {
            let purgeable = matches!(j.status, JobStatus::Completed | JobStatus::Cancelled);
            !(purgeable && matches!(j.finished_at, Some(at) if at < older_than))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn next_job_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let mut state = self.lock();
        state.fault("next_job_due")?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.attempts < j.max_attempts)
            .map(|j| j.run_at)
            .min())
    }

    async fn requeue_stale(&self, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.lock();
        state.fault("requeue_stale")?;
        let mut moved = 0;
        for job in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing && matches!(job.started_at, Some(at) if at < stale_before);
            if !stale {
                continue;
            }
            job.last_error = Some(STALE_ERROR.to_string());
            if job.attempts < job.max_attempts {
                job.status = JobStatus::Pending;
                job.run_at = now;
            } else {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn oldest_processing_start(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let mut state = self.lock();
        state.fault("oldest_processing_start")?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .filter_map(|j| j.started_at)
            .min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn new_job(run_at: DateTime<Utc>) -> NewJob {
        NewJob {
            job_type: JobType::Notification,
            run_at,
            payload: serde_json::json!({}),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn claim_stamps_and_counts_attempt() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = store.enqueue(new_job(now), now).await.unwrap();

        let claimed = store.claim(10, None, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].status, JobStatus::Processing);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].started_at, Some(now));

        assert!(store.claim(10, None, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_and_exhausted_jobs_are_not_claimed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.enqueue(new_job(now + Duration::minutes(1)), now).await.unwrap();
        let mut exhausted = new_job(now);
        exhausted.max_attempts = 0;
        store.enqueue(exhausted, now).await.unwrap();

        assert!(store.claim(10, None, now).await.unwrap().is_empty());
        assert_eq!(store.next_job_due().await.unwrap(), Some(now + Duration::minutes(1)));
    }

    #[tokio::test]
    async fn claim_filters_by_type() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.enqueue(new_job(now), now).await.unwrap();
        let claimed = store.claim(10, Some(&JobType::AutoUnsnooze), now).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint_and_complete() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut all = HashSet::new();
        for _ in 0..40 {
            all.insert(store.enqueue(new_job(now), now).await.unwrap().id);
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.claim(7, None, now).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for job in handle.await.unwrap() {
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
            }
        }
        assert_eq!(seen, all);
    }

    #[tokio::test]
    async fn reschedule_refunds_the_attempt() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = store.enqueue(new_job(now), now).await.unwrap();
        store.claim(1, None, now).await.unwrap();
        store.reschedule(job.id, now + Duration::minutes(3)).await.unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn cleanup_keeps_failed_and_recent_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = now - Duration::days(10);
        let done = store.enqueue(new_job(old), old).await.unwrap();
        let failed = store.enqueue(new_job(old), old).await.unwrap();
        let recent = store.enqueue(new_job(now), now).await.unwrap();
        store.complete(done.id, old).await.unwrap();
        store.fail(failed.id, "boom", old).await.unwrap();
        store.complete(recent.id, now).await.unwrap();

        let purged = store.cleanup(now - Duration::days(7)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_job(done.id).await.unwrap().is_none());
        assert!(store.get_job(failed.id).await.unwrap().is_some());
        assert!(store.get_job(recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_processing_jobs_are_requeued_or_failed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = now - Duration::minutes(20);
        let stale = store.enqueue(new_job(old), old).await.unwrap();
        let mut last_try = new_job(old);
        last_try.max_attempts = 1;
        let last_try = store.enqueue(last_try, old).await.unwrap();
        assert_eq!(store.claim(10, None, old).await.unwrap().len(), 2);

        let fresh = store.enqueue(new_job(now), now).await.unwrap();
        store.claim(10, None, now).await.unwrap();
        assert_eq!(store.oldest_processing_start().await.unwrap(), Some(old));

        let moved = store.requeue_stale(now - Duration::minutes(10), now).await.unwrap();
        assert_eq!(moved, 2);

        let stale = store.get_job(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, JobStatus::Pending);
        assert_eq!(stale.run_at, now);
        assert_eq!(stale.attempts, 1);
        assert_eq!(stale.last_error.as_deref(), Some(STALE_ERROR));

        let last_try = store.get_job(last_try.id).await.unwrap().unwrap();
        assert_eq!(last_try.status, JobStatus::Failed);
        assert_eq!(last_try.finished_at, Some(now));

        let fresh = store.get_job(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Processing);
        assert_eq!(store.oldest_processing_start().await.unwrap(), Some(now));
    }
}
