//! Storage backends for the task queue.
//!
//! A backend owns persistence and indexing; job state transitions live on [`Job`]
//! and are driven by [`Queue`](crate::Queue).

use crate::error::QueueResult;
use crate::job::{Job, JobId, QueueTier};
use crate::stats::QueueStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Slack added to a job's timeout before its processing lease expires.
pub const LEASE_GRACE: Duration = Duration::from_secs(60);

/// Completed jobs kept by [`MemoryBackend`] unless configured otherwise.
pub const DEFAULT_COMPLETED_LIMIT: usize = 10_000;

/// When a job popped at `now` counts as abandoned.
pub fn lease_deadline(job: &Job, now: DateTime<Utc>) -> DateTime<Utc> {
    chrono::Duration::from_std(job.timeout() + LEASE_GRACE)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Queue storage backend.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a job and index it as ready or delayed. Must not return before the
    /// job is durable.
    async fn push(&self, job: &Job) -> QueueResult<()>;

    /// Promote due delayed jobs, then take the oldest ready job from the highest
    /// non-empty tier and mark it processing under a lease (see [`lease_deadline`]).
    /// Taking the job and recording the lease is one atomic step.
    async fn pop(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Remove jobs whose processing lease ran out before `now` and return them.
    /// Each abandoned job is returned by exactly one caller.
    async fn reclaim(&self, now: DateTime<Utc>) -> QueueResult<Vec<Job>>;

    /// Record a successful completion.
    async fn complete(&self, job: &Job) -> QueueResult<()>;

    /// Record a failed attempt that will run again at `job.run_at`.
    async fn retry(&self, job: &Job) -> QueueResult<()>;

    /// Move a job to the dead set.
    async fn bury(&self, job: &Job) -> QueueResult<()>;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// List dead jobs, oldest first.
    async fn dead(&self, limit: usize) -> QueueResult<Vec<Job>>;

    /// Remove a job from the dead set, returning it.
    async fn take_dead(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Current depth and counters.
    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Drop everything.
    async fn clear(&self) -> QueueResult<()>;
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    ready: HashMap<QueueTier, VecDeque<JobId>>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    processing: HashMap<JobId, DateTime<Utc>>,
    completed: VecDeque<(DateTime<Utc>, JobId)>,
    dead: Vec<JobId>,
}

impl MemoryState {
    fn index(&mut self, job: &Job) {
        match job.run_at {
            Some(run_at) => {
                self.delayed.insert((run_at, job.id));
            }
            None => self.ready.entry(job.tier).or_default().push_back(job.id),
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(run_at, id)) = self.delayed.first() {
            if run_at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(tier) = self.jobs.get(&id).map(|job| job.tier) {
                self.ready.entry(tier).or_default().push_back(id);
            }
        }
    }

    /// Forget completed jobs past the retention window or over the count limit.
    fn evict_completed(&mut self, now: DateTime<Utc>, retention: chrono::Duration, limit: usize) {
        while let Some(&(finished, id)) = self.completed.front() {
            let fresh = finished
                .checked_add_signed(retention)
                .is_none_or(|expiry| expiry > now);
            if fresh && self.completed.len() <= limit {
                break;
            }
            self.completed.pop_front();
            self.jobs.remove(&id);
        }
    }
}

/// In-memory backend for tests and single-process deployments.
///
/// Completed job bodies are kept for `retention` (default one day) and at most
/// `completed_limit` of them at a time; pending, delayed and dead jobs are never
/// evicted.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    processed: AtomicU64,
    failed: AtomicU64,
    retention: chrono::Duration,
    completed_limit: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retention: chrono::Duration::days(1),
            completed_limit: DEFAULT_COMPLETED_LIMIT,
        }
    }
}

impl MemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep completed jobs for `retention`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        self
    }

    /// Keep at most `limit` completed jobs.
    pub fn with_completed_limit(mut self, limit: usize) -> Self {
        self.completed_limit = limit;
        self
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(&self, job: &Job) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        state.index(job);
        Ok(())
    }

    async fn pop(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut state = self.state.lock().await;
        state.promote_due(now);

        for tier in QueueTier::BY_PRIORITY {
            let Some(id) = state.ready.get_mut(&tier).and_then(VecDeque::pop_front) else {
                continue;
            };
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.start_processing();
            let job = job.clone();
            state.processing.insert(id, lease_deadline(&job, now));
            return Ok(Some(job));
        }

        Ok(None)
    }

    async fn reclaim(&self, now: DateTime<Utc>) -> QueueResult<Vec<Job>> {
        let mut state = self.state.lock().await;
        let expired: Vec<JobId> = state
            .processing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut jobs = Vec::with_capacity(expired.len());
        for id in expired {
            state.processing.remove(&id);
            if let Some(job) = state.jobs.get(&id) {
                jobs.push(job.clone());
            }
        }
        Ok(jobs)
    }

    async fn complete(&self, job: &Job) -> QueueResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.processing.remove(&job.id);
        state.jobs.insert(job.id, job.clone());
        state.completed.push_back((job.finished_at.unwrap_or(now), job.id));
        state.evict_completed(now, self.retention, self.completed_limit);
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn retry(&self, job: &Job) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.processing.remove(&job.id);
        state.jobs.insert(job.id, job.clone());
        state.index(job);
        self.failed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn bury(&self, job: &Job) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.processing.remove(&job.id);
        state.jobs.insert(job.id, job.clone());
        state.dead.push(job.id);
        self.failed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn dead(&self, limit: usize) -> QueueResult<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .dead
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn take_dead(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(position) = state.dead.iter().position(|dead| *dead == id) else {
            return Ok(None);
        };
        state.dead.remove(position);
        Ok(state.jobs.get(&id).cloned())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            delayed: state.delayed.len() as u64,
            processing: state.processing.len() as u64,
            dead: state.dead.len() as u64,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (tier, ids) in &state.ready {
            *stats.depth_mut(*tier) = ids.len() as u64;
        }
        Ok(stats)
    }

    async fn clear(&self) -> QueueResult<()> {
        *self.state.lock().await = MemoryState::default();
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use serde_json::json;

    #[tokio::test]
    async fn test_pop_respects_tier_priority() {
        let backend = MemoryBackend::new();
        let low = Job::new("low", json!({})).with_tier(QueueTier::Low);
        let default = Job::new("default", json!({}));
        let critical = Job::new("critical", json!({})).with_tier(QueueTier::Critical);

        backend.push(&low).await.unwrap();
        backend.push(&default).await.unwrap();
        backend.push(&critical).await.unwrap();

        let now = Utc::now();
        assert_eq!(backend.pop(now).await.unwrap().unwrap().job_type, "critical");
        assert_eq!(backend.pop(now).await.unwrap().unwrap().job_type, "default");
        assert_eq!(backend.pop(now).await.unwrap().unwrap().job_type, "low");
        assert!(backend.pop(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_tier() {
        let backend = MemoryBackend::new();
        for i in 0..3 {
            backend.push(&Job::new(format!("job-{i}"), json!({}))).await.unwrap();
        }

        let now = Utc::now();
        for i in 0..3 {
            let job = backend.pop(now).await.unwrap().unwrap();
            assert_eq!(job.job_type, format!("job-{i}"));
            assert_eq!(job.attempts, 1);
            assert_eq!(job.status.state, JobState::Processing);
        }
    }

    #[tokio::test]
    async fn test_delayed_job_promoted_when_due() {
        let backend = MemoryBackend::new();
        let run_at = Utc::now() + chrono::Duration::seconds(30);
        backend.push(&Job::new("later", json!({})).run_at(run_at)).await.unwrap();

        assert!(backend.pop(Utc::now()).await.unwrap().is_none());
        assert_eq!(backend.stats().await.unwrap().delayed, 1);

        let job = backend.pop(run_at).await.unwrap().unwrap();
        assert_eq!(job.job_type, "later");
    }

    #[tokio::test]
    async fn test_stats_and_dead_set() {
        let backend = MemoryBackend::new();
        let job = Job::new("x", json!({})).with_max_attempts(1);
        backend.push(&job).await.unwrap();

        let mut job = backend.pop(Utc::now()).await.unwrap().unwrap();
        assert_eq!(backend.stats().await.unwrap().processing, 1);

        job.bury("broken");
        backend.bury(&job).await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.failed, 1);

        let dead = backend.dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status.state, JobState::Dead);

        assert!(backend.take_dead(job.id).await.unwrap().is_some());
        assert_eq!(backend.stats().await.unwrap().dead, 0);
    }

    #[tokio::test]
    async fn test_reclaim_returns_jobs_past_their_lease() {
        let backend = MemoryBackend::new();
        let job = Job::new("x", json!({})).with_timeout(Duration::from_secs(10));
        backend.push(&job).await.unwrap();

        let now = Utc::now();
        let popped = backend.pop(now).await.unwrap().unwrap();
        let deadline = lease_deadline(&popped, now);

        assert!(backend.reclaim(deadline - chrono::Duration::seconds(1)).await.unwrap().is_empty());
        assert_eq!(backend.stats().await.unwrap().processing, 1);

        let reclaimed = backend.reclaim(deadline).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job.id);
        assert_eq!(reclaimed[0].attempts, 1);
        assert_eq!(backend.stats().await.unwrap().processing, 0);

        // Already handed out once.
        assert!(backend.reclaim(deadline).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completed_jobs_are_evicted_over_limit() {
        let backend = MemoryBackend::new().with_completed_limit(2);
        let mut ids = Vec::new();
        for i in 0..3 {
            let job = Job::new(format!("job-{i}"), json!({}));
            ids.push(job.id);
            backend.push(&job).await.unwrap();
            let mut job = backend.pop(Utc::now()).await.unwrap().unwrap();
            job.complete();
            backend.complete(&job).await.unwrap();
        }

        assert!(backend.get(ids[0]).await.unwrap().is_none());
        assert!(backend.get(ids[1]).await.unwrap().is_some());
        assert!(backend.get(ids[2]).await.unwrap().is_some());
        assert_eq!(backend.stats().await.unwrap().processed, 3);
    }

    #[tokio::test]
    async fn test_completed_jobs_expire_after_retention() {
        let backend = MemoryBackend::new().with_retention(Duration::ZERO);
        let job = Job::new("x", json!({}));
        backend.push(&job).await.unwrap();
        let mut job = backend.pop(Utc::now()).await.unwrap().unwrap();
        job.complete();
        backend.complete(&job).await.unwrap();

        assert!(backend.get(job.id).await.unwrap().is_none());

        // Unfinished work is never evicted.
        let pending = Job::new("y", json!({}));
        backend.push(&pending).await.unwrap();
        assert!(backend.get(pending.id).await.unwrap().is_some());
    }
}
