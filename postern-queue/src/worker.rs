//! Worker pool that pulls jobs and dispatches them to handlers.

use crate::config::WorkerConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobState};
use crate::queue::Queue;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Job handler function type.
pub type JobHandler =
    Arc<dyn Fn(Job) -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>> + Send + Sync>;

type HandlerMap = HashMap<String, JobHandler>;

/// Worker for processing jobs from a queue.
///
/// Handlers are registered before [`start`](Worker::start); the set is frozen while
/// the pool runs.
pub struct Worker {
    queue: Queue,
    handlers: HandlerMap,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Create a new worker.
    pub fn new(queue: Queue) -> Self {
        Self::with_config(queue, WorkerConfig::default())
    }

    /// Create a worker with custom configuration.
    pub fn with_config(queue: Queue, config: WorkerConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: None,
            handles: Vec::new(),
        }
    }

    /// Register a job handler. A later registration for the same type replaces the
    /// earlier one.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use postern_queue::*;
    ///
    /// let mut worker = Worker::new(Queue::memory());
    /// worker.register_handler("email:send", |job| async move {
    ///     println!("sending {}", job.data);
    ///     Ok(())
    /// });
    /// ```
    pub fn register_handler<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        let wrapped: JobHandler = Arc::new(
            move |job: Job| -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>> {
                Box::pin(handler(job))
            },
        );
        self.handlers.insert(job_type.into(), wrapped);
    }

    /// Registered job types.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Whether the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Process at most one job on the calling task. Returns the job's resulting
    /// state, or `None` if nothing was ready.
    pub async fn process_next(&self) -> QueueResult<Option<JobState>> {
        match self.queue.dequeue().await? {
            Some(job) => execute(&self.queue, &self.handlers, job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Drain every ready job on the calling task. Returns how many were processed.
    pub async fn drain(&self) -> QueueResult<usize> {
        let mut processed = 0;
        while self.process_next().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Start the worker pool.
    pub fn start(&mut self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::WorkerAlreadyRunning);
        }

        info!(
            concurrency = self.config.concurrency,
            job_types = ?self.job_types(),
            "Starting worker pool"
        );

        let handlers = Arc::new(self.handlers.clone());
        for worker_id in 0..self.config.concurrency {
            let queue = self.queue.clone();
            let handlers = handlers.clone();
            let running = self.running.clone();
            let poll_interval = self.config.poll_interval;

            self.handles.push(tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    match queue.dequeue().await {
                        Ok(Some(job)) => {
                            if let Err(e) = execute(&queue, &handlers, job).await {
                                error!(worker_id, error = %e, "Failed to record job result");
                            }
                        }
                        Ok(None) => tokio::time::sleep(poll_interval).await,
                        Err(e) => {
                            error!(worker_id, error = %e, "Error dequeuing job");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
                debug!(worker_id, "Worker loop stopped");
            }));
        }

        let queue = self.queue.clone();
        let (shutdown, mut stopped) = watch::channel(false);
        self.shutdown = Some(shutdown);
        let recovery_interval = self.config.recovery_interval;
        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recovery_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = queue.recover_abandoned().await {
                    error!(error = %e, "Error recovering abandoned jobs");
                }
            }
            debug!("Recovery loop stopped");
        }));

        Ok(())
    }

    /// Stop the worker pool, letting in-flight jobs finish within the shutdown
    /// timeout. Loops still busy after that are aborted.
    pub async fn stop(&mut self) -> QueueResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(QueueError::WorkerNotRunning);
        }
        info!("Stopping worker pool");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        for mut handle in self.handles.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Worker loop did not stop in time, aborting");
                handle.abort();
            }
        }

        info!("Worker pool stopped");
        Ok(())
    }
}

/// Run one job through its handler and record the outcome on the queue.
async fn execute(queue: &Queue, handlers: &HandlerMap, job: Job) -> QueueResult<JobState> {
    let Some(handler) = handlers.get(&job.job_type).cloned() else {
        warn!(job_id = %job.id, job_type = %job.job_type, "No handler for job type");
        let err = QueueError::NoHandler(job.job_type.clone());
        queue.kill(job, err.to_string()).await?;
        return Ok(JobState::Dead);
    };

    debug!(
        job_id = %job.id,
        job_type = %job.job_type,
        attempt = job.attempts,
        "Processing job"
    );

    let timeout = job.timeout();
    let result = match tokio::time::timeout(timeout, handler(job.clone())).await {
        Ok(result) => result,
        Err(_) => Err(QueueError::Timeout(timeout.as_secs())),
    };

    match result {
        Ok(()) => {
            queue.complete(job).await?;
            Ok(JobState::Completed)
        }
        Err(e) if !e.is_retryable() => {
            queue.kill(job, e.to_string()).await?;
            Ok(JobState::Dead)
        }
        Err(e) => queue.fail(job, e.to_string()).await,
    }
}
