//! In-memory implementation of [`JobStore`].
//!
//! All records live behind a single `RwLock`, so every mutation, including a
//! claim, is atomic with respect to other callers sharing the same store. The
//! store is cheap to clone; clones share state, which lets several schedulers
//! in one process compete for the same jobs the way separate processes do
//! against Postgres.

use super::{ClaimRequest, EnqueueOutcome, JobFilter, JobStore, RunOutcome};
use crate::{
    FramecastError, Result,
    job::{Job, JobId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{cmp::Reverse, collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredJob {
    /// Insertion order, used to break timestamp ties deterministically.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Storage {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

impl Storage {
    fn insert(&mut self, job: Job) -> JobId {
        let id = job.id;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(id, StoredJob { seq, job });
        id
    }

    fn running_count(&self, name: &str) -> usize {
        self.jobs
            .values()
            .filter(|stored| stored.job.name == name && stored.job.is_locked())
            .count()
    }

    /// Returns the record only if `worker` still holds its lock.
    fn owned_mut(&mut self, id: JobId, worker: &str) -> Result<&mut Job> {
        match self.jobs.get_mut(&id) {
            Some(stored)
                if stored.job.is_locked() && stored.job.locked_by.as_deref() == Some(worker) =>
            {
                Ok(&mut stored.job)
            }
            Some(_) => Err(FramecastError::LeaseLost { id: id.to_string() }),
            None => Err(FramecastError::JobNotFound { id: id.to_string() }),
        }
    }

    /// Returns the record for an outcome write: the caller must hold the lock,
    /// or the lock must have been released without anyone reclaiming it.
    fn finishable_mut(&mut self, id: JobId, worker: &str) -> Result<&mut Job> {
        match self.jobs.get_mut(&id) {
            Some(stored) => {
                let job = &stored.job;
                let held = job.locked_by.as_deref() == Some(worker) && job.is_locked();
                let orphaned = !job.is_locked()
                    && (job.is_recurring()
                        || (job.last_finished_at.is_none() && job.failed_at.is_none()));
                if held || orphaned {
                    Ok(&mut stored.job)
                } else {
                    Err(FramecastError::LeaseLost { id: id.to_string() })
                }
            }
            None => Err(FramecastError::JobNotFound { id: id.to_string() }),
        }
    }

    fn select(&self, filter: &JobFilter) -> Vec<&StoredJob> {
        let mut matched: Vec<&StoredJob> = self
            .jobs
            .values()
            .filter(|stored| filter.matches(&stored.job))
            .collect();

        matched.sort_by_key(|stored| (stored.job.queued_at, stored.seq));
        if filter.newest_first {
            matched.reverse();
        }
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}

fn unlock(job: &mut Job) {
    job.locked_at = None;
    job.locked_by = None;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    storage: Arc<RwLock<Storage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.storage.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Applies `f` to a stored record directly. Intended for tests that need
    /// to age a lock or move a fire time.
    pub async fn modify<F>(&self, id: JobId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Job),
    {
        let mut storage = self.storage.write().await;
        let stored = storage
            .jobs
            .get_mut(&id)
            .ok_or_else(|| FramecastError::JobNotFound { id: id.to_string() })?;
        f(&mut stored.job);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_tables(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        let mut storage = self.storage.write().await;

        if let Some(key) = &job.job_key {
            let existing = storage
                .jobs
                .values()
                .find(|stored| stored.job.name == job.name && stored.job.job_key.as_ref() == Some(key));
            if let Some(stored) = existing {
                return Ok(EnqueueOutcome::Existing(stored.job.id));
            }
        }

        Ok(EnqueueOutcome::Created(storage.insert(job)))
    }

    async fn upsert_recurring(&self, job: Job) -> Result<JobId> {
        let mut storage = self.storage.write().await;

        let existing = storage
            .jobs
            .values_mut()
            .find(|stored| stored.job.name == job.name && stored.job.is_recurring());

        if let Some(stored) = existing {
            let existing = &mut stored.job;
            let changed = existing.repeat_cron != job.repeat_cron
                || existing.repeat_timezone != job.repeat_timezone;
            if changed {
                existing.repeat_cron = job.repeat_cron;
                existing.repeat_timezone = job.repeat_timezone;
                existing.next_run_at = job.next_run_at;
            }
            existing.priority = job.priority;
            return Ok(existing.id);
        }

        Ok(storage.insert(job))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let storage = self.storage.read().await;
        Ok(storage.jobs.get(&id).map(|stored| stored.job.clone()))
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let storage = self.storage.read().await;
        Ok(storage
            .select(filter)
            .into_iter()
            .map(|stored| stored.job.clone())
            .collect())
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Job>> {
        let mut storage = self.storage.write().await;

        let open_handlers: Vec<&str> = request
            .handlers
            .iter()
            .filter(|cap| storage.running_count(&cap.name) < cap.max_running as usize)
            .map(|cap| cap.name.as_str())
            .collect();

        let candidate = storage
            .jobs
            .values()
            .filter(|stored| open_handlers.contains(&stored.job.name.as_str()))
            .filter(|stored| stored.job.is_runnable(request.now))
            .min_by_key(|stored| {
                (
                    Reverse(stored.job.priority),
                    stored.job.next_run_at,
                    stored.seq,
                )
            })
            .map(|stored| stored.job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let stored = storage
            .jobs
            .get_mut(&id)
            .ok_or_else(|| FramecastError::JobNotFound { id: id.to_string() })?;
        stored.job.locked_at = Some(request.now);
        stored.job.locked_by = Some(request.worker.clone());
        stored.job.last_run_at = Some(request.now);

        Ok(Some(stored.job.clone()))
    }

    async fn update_progress(
        &self,
        id: JobId,
        worker: &str,
        progress: u8,
        heartbeat: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut storage = self.storage.write().await;
        let job = storage.owned_mut(id, worker)?;

        job.progress = job.progress.max(progress.min(100));
        if let Some(at) = heartbeat {
            job.locked_at = Some(at);
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        id: JobId,
        worker: &str,
        output: Option<serde_json::Value>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut storage = self.storage.write().await;
        let job = storage.finishable_mut(id, worker)?;

        if let (Some(serde_json::Value::Object(output)), Some(data)) =
            (output, job.data.as_object_mut())
        {
            data.extend(output);
        }
        job.progress = 100;
        job.last_finished_at = Some(finished_at);
        unlock(job);
        Ok(())
    }

    async fn fail_job(
        &self,
        id: JobId,
        worker: &str,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut storage = self.storage.write().await;
        let job = storage.finishable_mut(id, worker)?;

        job.failed_at = Some(failed_at);
        job.fail_reason = Some(reason.to_string());
        unlock(job);
        Ok(())
    }

    async fn reschedule_recurring(
        &self,
        id: JobId,
        worker: &str,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut storage = self.storage.write().await;
        let job = storage.finishable_mut(id, worker)?;

        match outcome {
            RunOutcome::Succeeded => {
                job.last_finished_at = Some(finished_at);
                job.failed_at = None;
                job.fail_reason = None;
            }
            RunOutcome::Failed(reason) => {
                job.failed_at = Some(finished_at);
                job.fail_reason = Some(reason);
            }
        }
        job.next_run_at = next_run_at;
        job.progress = 0;
        unlock(job);
        Ok(())
    }

    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut storage = self.storage.write().await;
        let mut released = 0;
        for stored in storage.jobs.values_mut() {
            if stored.job.lock_expired(cutoff) {
                unlock(&mut stored.job);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn cancel(&self, filter: &JobFilter) -> Result<u64> {
        let mut storage = self.storage.write().await;
        let doomed: Vec<JobId> = storage
            .select(filter)
            .into_iter()
            .filter(|stored| !stored.job.is_locked())
            .map(|stored| stored.job.id)
            .collect();

        for id in &doomed {
            storage.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut storage = self.storage.write().await;
        let expired: Vec<JobId> = storage
            .jobs
            .values()
            .map(|stored| &stored.job)
            .filter(|job| !job.is_recurring() && !job.is_locked())
            .filter(|job| {
                job.last_finished_at.is_some_and(|at| at < cutoff)
                    || job.failed_at.is_some_and(|at| at < cutoff)
            })
            .map(|job| job.id)
            .collect();

        Ok(expired
            .iter()
            .filter_map(|id| storage.jobs.remove(id))
            .map(|stored| stored.job)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{priority::JobPriority, store::HandlerCap};
    use chrono::Duration;
    use serde_json::json;

    fn claim(worker: &str, caps: &[(&str, u32)]) -> ClaimRequest {
        ClaimRequest {
            worker: worker.to_string(),
            now: Utc::now(),
            handlers: caps
                .iter()
                .map(|(name, max)| HandlerCap::new(*name, *max))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_key() {
        let store = MemoryStore::new();
        let first = store
            .enqueue(Job::new("work", json!({"n": 1})).with_key("k"))
            .await
            .unwrap();
        let second = store
            .enqueue(Job::new("work", json!({"n": 2})).with_key("k"))
            .await
            .unwrap();

        assert_eq!(second, EnqueueOutcome::Existing(first.id()));
        assert_eq!(store.len().await, 1);

        // Same key under another handler name is a different record
        store
            .enqueue(Job::new("other", json!({})).with_key("k"))
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fire_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let older = store
            .enqueue(Job::new("work", json!({})).with_next_run_at(now - Duration::seconds(30)))
            .await
            .unwrap()
            .id();
        let urgent = store
            .enqueue(
                Job::new("work", json!({}))
                    .with_priority(JobPriority::High)
                    .with_next_run_at(now - Duration::seconds(1)),
            )
            .await
            .unwrap()
            .id();

        let request = claim("w1", &[("work", 5)]);
        assert_eq!(store.claim_next(&request).await.unwrap().unwrap().id, urgent);
        assert_eq!(store.claim_next(&request).await.unwrap().unwrap().id, older);
        assert!(store.claim_next(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_handler_cap() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.enqueue(Job::new("video", json!({}))).await.unwrap();
        }

        let request = claim("w1", &[("video", 1)]);
        let first = store.claim_next(&request).await.unwrap();
        assert!(first.is_some());
        assert!(store.claim_next(&request).await.unwrap().is_none());

        let first = first.unwrap();
        store
            .complete_job(first.id, "w1", None, Utc::now())
            .await
            .unwrap();
        assert!(store.claim_next(&request).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_ignores_unregistered_handlers() {
        let store = MemoryStore::new();
        store.enqueue(Job::new("unknown", json!({}))).await.unwrap();
        let request = claim("w1", &[("work", 1)]);
        assert!(store.claim_next(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_owner_checked() {
        let store = MemoryStore::new();
        let id = store.enqueue(Job::new("work", json!({}))).await.unwrap().id();
        store.claim_next(&claim("w1", &[("work", 1)])).await.unwrap();

        store.update_progress(id, "w1", 30, None).await.unwrap();
        store.update_progress(id, "w1", 20, None).await.unwrap();
        assert_eq!(store.get_job(id).await.unwrap().unwrap().progress, 30);

        let err = store.update_progress(id, "w2", 50, None).await.unwrap_err();
        assert!(matches!(err, FramecastError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_moves_lock_timestamp() {
        let store = MemoryStore::new();
        let id = store.enqueue(Job::new("work", json!({}))).await.unwrap().id();
        let claimed = store
            .claim_next(&claim("w1", &[("work", 1)]))
            .await
            .unwrap()
            .unwrap();

        let later = claimed.locked_at.unwrap() + Duration::seconds(90);
        store.update_progress(id, "w1", 10, Some(later)).await.unwrap();
        assert_eq!(store.get_job(id).await.unwrap().unwrap().locked_at, Some(later));
    }

    #[tokio::test]
    async fn test_complete_merges_output() {
        let store = MemoryStore::new();
        let id = store
            .enqueue(Job::new("work", json!({"input": "a"})))
            .await
            .unwrap()
            .id();
        store.claim_next(&claim("w1", &[("work", 1)])).await.unwrap();
        store
            .complete_job(id, "w1", Some(json!({"outputPath": "/out.mp4"})), Utc::now())
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.data["input"], "a");
        assert_eq!(job.data["outputPath"], "/out.mp4");
        assert_eq!(job.progress, 100);
        assert!(!job.is_locked());
    }

    #[tokio::test]
    async fn test_stale_locks_are_released_and_reclaimed() {
        let store = MemoryStore::new();
        let id = store.enqueue(Job::new("work", json!({}))).await.unwrap().id();
        store.claim_next(&claim("w1", &[("work", 1)])).await.unwrap();
        store
            .modify(id, |job| job.locked_at = Some(Utc::now() - Duration::minutes(11)))
            .await
            .unwrap();

        let released = store
            .release_stale_locks(Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let reclaimed = store
            .claim_next(&claim("w2", &[("work", 1)]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));

        // The original worker has lost the lease
        let err = store.fail_job(id, "w1", "late", Utc::now()).await.unwrap_err();
        assert!(matches!(err, FramecastError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_cancel_skips_locked_records() {
        let store = MemoryStore::new();
        store
            .enqueue(Job::new("work", json!({})).with_key("a"))
            .await
            .unwrap();
        store
            .enqueue(Job::new("work", json!({})).with_key("b"))
            .await
            .unwrap();
        let locked = store
            .claim_next(&claim("w1", &[("work", 1)]))
            .await
            .unwrap()
            .unwrap();

        let removed = store.cancel(&JobFilter::new().with_name("work")).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_job(locked.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recurring_upsert_keeps_pending_fire_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let schedule = crate::cron::CronSchedule::new("0 2 * * *").unwrap();

        let first = Job::recurring("cleanup", &schedule, now).unwrap();
        let armed_at = first.next_run_at;
        let id = store.upsert_recurring(first).await.unwrap();

        let again = Job::recurring("cleanup", &schedule, now + Duration::days(3)).unwrap();
        assert_eq!(store.upsert_recurring(again).await.unwrap(), id);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().next_run_at, armed_at);
        assert_eq!(store.len().await, 1);

        let hourly = crate::cron::CronSchedule::new("0 * * * *").unwrap();
        let changed = Job::recurring("cleanup", &hourly, now).unwrap();
        let expected = changed.next_run_at;
        store.upsert_recurring(changed).await.unwrap();
        assert_eq!(store.get_job(id).await.unwrap().unwrap().next_run_at, expected);
    }

    #[tokio::test]
    async fn test_purge_finished_keeps_recent_and_recurring() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = store.enqueue(Job::new("work", json!({}))).await.unwrap().id();
        let fresh = store.enqueue(Job::new("work", json!({}))).await.unwrap().id();
        store
            .modify(old, |job| job.last_finished_at = Some(now - Duration::days(8)))
            .await
            .unwrap();
        store
            .modify(fresh, |job| job.failed_at = Some(now - Duration::hours(1)))
            .await
            .unwrap();

        let schedule = crate::cron::CronSchedule::new("0 2 * * *").unwrap();
        let mut recurring = Job::recurring("cleanup", &schedule, now).unwrap();
        recurring.last_finished_at = Some(now - Duration::days(30));
        store.upsert_recurring(recurring).await.unwrap();

        let purged = store.purge_finished(now - Duration::days(7)).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, old);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_find_jobs_newest_first_with_limit() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(
                store
                    .enqueue(Job::new("work", json!({})).with_owner("u1"))
                    .await
                    .unwrap()
                    .id(),
            );
        }

        let found = store
            .find_jobs(&JobFilter::new().with_owner("u1").newest_first().with_limit(2))
            .await
            .unwrap();
        let found: Vec<JobId> = found.into_iter().map(|job| job.id).collect();
        assert_eq!(found, vec![ids[3], ids[2]]);
    }
}
