//! Redis backend.
//!
//! Key layout under the configured prefix:
//!
//! - `job:{id}`: job body as JSON (completed jobs expire after the retention time)
//! - `pending:{tier}`: ready jobs, scored by enqueue time in milliseconds
//! - `delayed`: scheduled jobs and retries, scored by `run_at` in milliseconds
//! - `processing`: jobs held by a worker, scored by lease deadline in milliseconds
//! - `dead`: jobs that exhausted their retries
//! - `stats:processed`, `stats:failed`: lifetime counters

use crate::backend::{LEASE_GRACE, QueueBackend, lease_deadline};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState, QueueTier};
use crate::stats::QueueStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use tracing::{debug, info, warn};

/// Pops the head of the first non-empty tier and leases it in `processing` in one
/// step, so a crash can never leave a job in neither set.
///
/// KEYS: pending tiers by priority, then `processing`. ARGV[1]: lease deadline (ms).
static POP_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local processing = KEYS[#KEYS]
        for i = 1, #KEYS - 1 do
            local popped = redis.call('ZPOPMIN', KEYS[i], 1)
            if popped[1] then
                redis.call('ZADD', processing, ARGV[1], popped[1])
                return popped[1]
            end
        end
        return false
        ",
    )
});

/// Queue backend persisted in Redis.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    config: QueueConfig,
}

impl RedisBackend {
    /// Connect using the given configuration.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        let url = config.connection_url()?;
        debug!(prefix = %config.key_prefix, "Connecting queue backend to Redis");

        let client = Client::open(url.as_str()).map_err(|e| QueueError::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client).await?;

        info!(prefix = %config.key_prefix, "Redis queue backend ready");
        Ok(Self { connection, config })
    }

    fn job_key(&self, id: JobId) -> String {
        self.config.key(&format!("job:{}", id))
    }

    fn pending_key(&self, tier: QueueTier) -> String {
        self.config.key(&format!("pending:{}", tier.as_str()))
    }

    async fn save(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let body =
            serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;

        // Only finished jobs may expire; everything else must survive until handled.
        if job.status.state == JobState::Completed {
            let _: () = conn
                .set_ex(self.job_key(job.id), body, self.config.retention_time.as_secs())
                .await?;
        } else {
            let _: () = conn.set(self.job_key(job.id), body).await?;
        }
        Ok(())
    }

    async fn index(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        match job.run_at {
            Some(run_at) => {
                let _: () = conn
                    .zadd(self.config.key("delayed"), job.id.to_string(), run_at.timestamp_millis())
                    .await?;
            }
            None => {
                let _: () = conn
                    .zadd(
                        self.pending_key(job.tier),
                        job.id.to_string(),
                        Utc::now().timestamp_millis(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let delayed_key = self.config.key("delayed");
        let due: Vec<String> = conn
            .zrangebyscore(&delayed_key, "-inf", now.timestamp_millis())
            .await?;

        for id in due {
            // ZREM decides the race between workers promoting the same job.
            let removed: i64 = conn.zrem(&delayed_key, &id).await?;
            if removed == 0 {
                continue;
            }
            let Ok(job_id) = id.parse::<JobId>() else {
                continue;
            };
            if let Some(job) = self.get(job_id).await? {
                let _: () = conn
                    .zadd(self.pending_key(job.tier), &id, now.timestamp_millis())
                    .await?;
            }
        }
        Ok(())
    }

    async fn finish_processing(&self, id: JobId) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.zrem(self.config.key("processing"), id.to_string()).await?;
        Ok(())
    }

    async fn count(&self, key: &str) -> QueueResult<u64> {
        let mut conn = self.connection.clone();
        let value: Option<u64> = conn.get(self.config.key(key)).await?;
        Ok(value.unwrap_or(0))
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push(&self, job: &Job) -> QueueResult<()> {
        self.save(job).await?;
        self.index(job).await
    }

    async fn pop(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        self.promote_due(now).await?;
        let mut conn = self.connection.clone();
        let processing = self.config.key("processing");

        // Until the body is loaded the lease only covers the grace period.
        let provisional = now + chrono::Duration::from_std(LEASE_GRACE).unwrap_or_default();
        let mut invocation = POP_SCRIPT.prepare_invoke();
        for tier in QueueTier::BY_PRIORITY {
            invocation.key(self.pending_key(tier));
        }
        invocation.key(&processing).arg(provisional.timestamp_millis());

        loop {
            let popped: Option<String> = invocation.invoke_async(&mut conn).await?;
            let Some(id) = popped else {
                return Ok(None);
            };

            let job = match id.parse::<JobId>() {
                Ok(job_id) => self.get(job_id).await?,
                Err(_) => None,
            };
            let Some(mut job) = job else {
                warn!(job_id = %id, "Dropping queue entry without a job body");
                let _: () = conn.zrem(&processing, &id).await?;
                continue;
            };

            job.start_processing();
            self.save(&job).await?;
            let _: () = conn
                .zadd(&processing, &id, lease_deadline(&job, now).timestamp_millis())
                .await?;
            return Ok(Some(job));
        }
    }

    async fn reclaim(&self, now: DateTime<Utc>) -> QueueResult<Vec<Job>> {
        let mut conn = self.connection.clone();
        let processing = self.config.key("processing");
        let expired: Vec<String> = conn
            .zrangebyscore(&processing, "-inf", now.timestamp_millis())
            .await?;

        let mut jobs = Vec::new();
        for id in expired {
            // ZREM decides the race between workers reclaiming the same job.
            let removed: i64 = conn.zrem(&processing, &id).await?;
            if removed == 0 {
                continue;
            }
            if let Ok(job_id) = id.parse::<JobId>()
                && let Some(job) = self.get(job_id).await?
            {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn complete(&self, job: &Job) -> QueueResult<()> {
        self.save(job).await?;
        self.finish_processing(job.id).await?;
        let mut conn = self.connection.clone();
        let _: () = conn.incr(self.config.key("stats:processed"), 1).await?;
        Ok(())
    }

    async fn retry(&self, job: &Job) -> QueueResult<()> {
        self.save(job).await?;
        self.index(job).await?;
        self.finish_processing(job.id).await?;
        let mut conn = self.connection.clone();
        let _: () = conn.incr(self.config.key("stats:failed"), 1).await?;
        Ok(())
    }

    async fn bury(&self, job: &Job) -> QueueResult<()> {
        self.save(job).await?;
        let mut conn = self.connection.clone();
        let _: () = conn
            .zadd(self.config.key("dead"), job.id.to_string(), Utc::now().timestamp_millis())
            .await?;
        self.finish_processing(job.id).await?;
        let _: () = conn.incr(self.config.key("stats:failed"), 1).await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.connection.clone();
        let body: Option<String> = conn.get(self.job_key(id)).await?;

        body.map(|json| {
            serde_json::from_str(&json).map_err(|e| QueueError::Deserialization(e.to_string()))
        })
        .transpose()
    }

    async fn dead(&self, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrange(self.config.key("dead"), 0, (limit - 1) as isize)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(job_id) = id.parse::<JobId>()
                && let Some(job) = self.get(job_id).await?
            {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn take_dead(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.zrem(self.config.key("dead"), id.to_string()).await?;
        if removed == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.connection.clone();
        let mut stats = QueueStats::default();

        for tier in QueueTier::BY_PRIORITY {
            *stats.depth_mut(tier) = conn.zcard(self.pending_key(tier)).await?;
        }
        stats.delayed = conn.zcard(self.config.key("delayed")).await?;
        stats.processing = conn.zcard(self.config.key("processing")).await?;
        stats.dead = conn.zcard(self.config.key("dead")).await?;
        stats.processed = self.count("stats:processed").await?;
        stats.failed = self.count("stats:failed").await?;

        Ok(stats)
    }

    async fn clear(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}:*", self.config.key_prefix);
        let keys: Vec<String> = conn.keys(&pattern).await?;

        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }
}
