use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use oncall_core::SchedulerLease;

use crate::error::StoreResult;
use crate::traits::{LeaseRelease, LeaseStore};

use super::MemoryStore;

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn acquire_lease(&self, holder: &str, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.lock();
        state.fault("acquire_lease")?;
        let lease = &mut state.lease;
        let available = match (&lease.holder, lease.held_since) {
            (None, _) => true,
            (Some(current), _) if current == holder => true,
            (Some(_), Some(since)) => since < stale_before,
            (Some(_), None) => true,
        };
        if !available {
            return Ok(false);
        }
        lease.holder = Some(holder.to_string());
        lease.held_since = Some(now);
        Ok(true)
    }

    async fn release_lease(&self, holder: &str, release: LeaseRelease) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("release_lease")?;
        let lease = &mut state.lease;
        if lease.holder.as_deref() != Some(holder) {
            return Ok(());
        }
        lease.holder = None;
        lease.held_since = None;
        lease.last_run_at = Some(release.ran_at);
        if release.succeeded {
            lease.last_success_at = Some(release.ran_at);
        }
        lease.last_error = release.error;
        lease.next_run_at = release.next_run_at;
        Ok(())
    }

    async fn lease(&self) -> StoreResult<SchedulerLease> {
        let mut state = self.lock();
        state.fault("lease")?;
        Ok(state.lease.clone())
    }

    async fn record_daily_run(&self, date: NaiveDate) -> StoreResult<bool> {
        let mut state = self.lock();
        state.fault("record_daily_run")?;
        if matches!(state.lease.last_daily_run, Some(last) if last >= date) {
            return Ok(false);
        }
        state.lease.last_daily_run = Some(date);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_acquire_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let stale_before = now - Duration::minutes(2);

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.acquire_lease(&format!("worker-{i}"), now, stale_before).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn holder_renews_and_stale_lease_is_taken_over() {
        let store = MemoryStore::new();
        let timeout = Duration::minutes(2);
        let now = Utc::now();
        assert!(store.acquire_lease("a", now, now - timeout).await.unwrap());
        assert!(store.acquire_lease("a", now, now - timeout).await.unwrap());
        assert!(!store.acquire_lease("b", now, now - timeout).await.unwrap());

        let later = now + Duration::minutes(3);
        assert!(store.acquire_lease("b", later, later - timeout).await.unwrap());
        assert_eq!(store.lease().await.unwrap().holder.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_ignored() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.acquire_lease("a", now, now).await.unwrap();
        let release = LeaseRelease { ran_at: now, succeeded: true, error: None, next_run_at: None };
        store.release_lease("b", release.clone()).await.unwrap();
        assert_eq!(store.lease().await.unwrap().holder.as_deref(), Some("a"));

        store.release_lease("a", release).await.unwrap();
        let lease = store.lease().await.unwrap();
        assert_eq!(lease.holder, None);
        assert_eq!(lease.last_success_at, Some(now));
    }

    #[tokio::test]
    async fn daily_run_recorded_once_per_date() {
        let store = MemoryStore::new();
        let today = Utc::now().date_naive();
        assert!(store.record_daily_run(today).await.unwrap());
        assert!(!store.record_daily_run(today).await.unwrap());
        assert!(store.record_daily_run(today + Duration::days(1)).await.unwrap());
    }
}
