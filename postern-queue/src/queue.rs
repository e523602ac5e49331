//! Queue facade over a storage backend.

use crate::backend::{MemoryBackend, QueueBackend};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobId, JobOptions, JobState};
use crate::redis_backend::RedisBackend;
use crate::stats::QueueStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ABANDONED: &str = "abandoned: worker stopped before finishing the job";

/// Receives jobs that exhausted their retry budget.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Called once per job, after it has been moved to the dead set.
    async fn on_dead_letter(&self, job: &Job);
}

/// Durable, priority-tiered job queue.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn QueueBackend>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    max_size: usize,
}

impl Queue {
    /// Connect to Redis.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        info!(prefix = %config.key_prefix, "Initializing job queue");
        let max_size = config.max_size;
        let backend = RedisBackend::connect(config).await?;
        Ok(Self::with_backend(Arc::new(backend)).with_max_size(max_size))
    }

    /// In-process queue.
    pub fn memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    /// Queue over an arbitrary backend.
    pub fn with_backend(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            dead_letter: None,
            max_size: 0,
        }
    }

    /// Install a hook that is told about every dead job.
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Cap outstanding jobs (0 = unlimited).
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Enqueue a job. Returns once the job is persisted.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        data: JobData,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        self.enqueue_job(Job::new(job_type, data).with_options(options)).await
    }

    /// Enqueue a fully built job.
    pub async fn enqueue_job(&self, job: Job) -> QueueResult<JobId> {
        if self.max_size > 0 {
            let stats = self.backend.stats().await?;
            if stats.outstanding() >= self.max_size as u64 {
                warn!(job_type = %job.job_type, max_size = self.max_size, "Queue full, rejecting job");
                return Err(QueueError::QueueFull);
            }
        }

        self.backend.push(&job).await?;
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            tier = %job.tier,
            delayed = job.run_at.is_some(),
            "Job enqueued"
        );
        Ok(job.id)
    }

    /// Take the next ready job, highest tier first.
    pub async fn dequeue(&self) -> QueueResult<Option<Job>> {
        self.backend.pop(Utc::now()).await
    }

    /// Mark a job as completed.
    pub async fn complete(&self, mut job: Job) -> QueueResult<()> {
        job.complete();
        self.backend.complete(&job).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "Job completed");
        Ok(())
    }

    /// Record a failed attempt. The job is rescheduled with backoff while attempts
    /// remain, otherwise it is moved to the dead set. Returns the resulting state.
    pub async fn fail(&self, mut job: Job, error: impl Into<String>) -> QueueResult<JobState> {
        let error = error.into();
        match job.fail(error.clone()) {
            JobState::Dead => {
                self.bury(job, &error).await?;
                Ok(JobState::Dead)
            }
            state => {
                self.backend.retry(&job).await?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_in_secs = job.backoff_delay().as_secs(),
                    error = %error,
                    "Job failed, scheduled for retry"
                );
                Ok(state)
            }
        }
    }

    /// Move a job straight to the dead set.
    pub async fn kill(&self, mut job: Job, error: impl Into<String>) -> QueueResult<()> {
        let error = error.into();
        job.bury(error.clone());
        self.bury(job, &error).await
    }

    async fn bury(&self, job: Job, error: &str) -> QueueResult<()> {
        self.backend.bury(&job).await?;
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            error = %error,
            "Job moved to dead set"
        );
        if let Some(sink) = &self.dead_letter {
            sink.on_dead_letter(&job).await;
        }
        Ok(())
    }

    /// Return jobs whose worker vanished (crash, kill, lost connection) to the
    /// queue. Each counts as a failed attempt: it is retried with backoff while
    /// budget remains and moved to the dead set otherwise. Returns how many jobs
    /// were recovered.
    pub async fn recover_abandoned(&self) -> QueueResult<usize> {
        self.recover_abandoned_at(Utc::now()).await
    }

    /// [`recover_abandoned`](Self::recover_abandoned) as of `now`.
    pub async fn recover_abandoned_at(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let abandoned = self.backend.reclaim(now).await?;
        let count = abandoned.len();
        for job in abandoned {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                "Recovering job abandoned by its worker"
            );
            self.fail(job, ABANDONED).await?;
        }
        if count > 0 {
            info!(count, "Recovered abandoned jobs");
        }
        Ok(count)
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.backend.get(id).await
    }

    /// Queue depth and counters.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.backend.stats().await
    }

    /// Dead jobs, oldest first.
    pub async fn dead_jobs(&self, limit: usize) -> QueueResult<Vec<Job>> {
        self.backend.dead(limit).await
    }

    /// Put a dead job back in its tier with a fresh retry budget.
    pub async fn requeue_dead(&self, id: JobId) -> QueueResult<JobId> {
        let mut job = self
            .backend
            .take_dead(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        job.revive();
        self.backend.push(&job).await?;
        info!(job_id = %id, job_type = %job.job_type, "Dead job requeued");
        Ok(id)
    }

    /// Drop all jobs.
    pub async fn clear(&self) -> QueueResult<()> {
        warn!("Clearing job queue");
        self.backend.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::QueueTier;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<JobId>>,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn on_dead_letter(&self, job: &Job) {
            self.seen.lock().unwrap().push(job.id);
        }
    }

    #[tokio::test]
    async fn test_failed_job_is_delayed_with_backoff() {
        let queue = Queue::memory();
        let id = queue
            .enqueue("email:send", json!({"email_id": 7}), JobOptions::default())
            .await
            .unwrap();

        let job = queue.dequeue().await.unwrap().unwrap();
        let before = Utc::now();
        assert_eq!(queue.fail(job, "smtp timeout").await.unwrap(), JobState::Failed);

        let stored = queue.get_job(id).await.unwrap().unwrap();
        let run_at = stored.run_at.unwrap();
        assert!(run_at >= before + chrono::Duration::milliseconds(900));
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_budget_exhausted() {
        let sink = Arc::new(RecordingSink::default());
        let queue = Queue::memory().with_dead_letter_sink(sink.clone());
        let id = queue
            .enqueue(
                "campaign:process",
                json!({"campaign_id": 1}),
                JobOptions::new(QueueTier::Default, 1, Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queue.fail(job, "boom").await.unwrap(), JobState::Dead);

        assert_eq!(sink.seen.lock().unwrap().as_slice(), &[id]);
        let dead = queue.dead_jobs(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_requeue_dead_resets_attempts() {
        let queue = Queue::memory();
        let id = queue
            .enqueue("webhook:deliver", json!({}), JobOptions::default())
            .await
            .unwrap();

        let job = queue.dequeue().await.unwrap().unwrap();
        queue.kill(job, "bad payload").await.unwrap();

        queue.requeue_dead(id).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
        assert_eq!(queue.stats().await.unwrap().dead, 0);

        assert!(matches!(
            queue.requeue_dead(JobId::new_v4()).await,
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_job_is_retried() {
        let queue = Queue::memory();
        let id = queue
            .enqueue(
                "email:send",
                json!({"email_id": 3}),
                JobOptions::new(QueueTier::Default, 3, Duration::from_secs(30)),
            )
            .await
            .unwrap();

        // The worker takes the job and never reports back.
        let taken = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queue.recover_abandoned().await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(queue.recover_abandoned_at(later).await.unwrap(), 1);
        assert_eq!(queue.recover_abandoned_at(later).await.unwrap(), 0);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.delayed, 1);

        let stored = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status.state, JobState::Failed);
        assert_eq!(stored.attempts, taken.attempts);
        assert!(stored.status.error.as_deref().unwrap().starts_with("abandoned"));
    }

    #[tokio::test]
    async fn test_abandoned_job_without_budget_is_dead() {
        let sink = Arc::new(RecordingSink::default());
        let queue = Queue::memory().with_dead_letter_sink(sink.clone());
        let id = queue
            .enqueue(
                "campaign:process",
                json!({"campaign_id": 4}),
                JobOptions::new(QueueTier::Default, 1, Duration::from_secs(60)),
            )
            .await
            .unwrap();

        queue.dequeue().await.unwrap().unwrap();
        let later = Utc::now() + chrono::Duration::minutes(10);
        assert_eq!(queue.recover_abandoned_at(later).await.unwrap(), 1);

        assert_eq!(sink.seen.lock().unwrap().as_slice(), &[id]);
        assert_eq!(queue.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn test_max_size() {
        let queue = Queue::memory().with_max_size(1);
        queue.enqueue("a", json!({}), JobOptions::default()).await.unwrap();

        let err = queue.enqueue("b", json!({}), JobOptions::default()).await;
        assert!(matches!(err, Err(QueueError::QueueFull)));
    }
}
