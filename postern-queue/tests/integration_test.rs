//! Integration tests for postern-queue

use postern_queue::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[test]
fn test_queue_config_builder() {
    let config = QueueConfig::new("redis://localhost:6379")
        .with_max_size(1000)
        .with_retention_time(Duration::from_secs(3600));

    assert_eq!(config.max_size, 1000);
    assert_eq!(config.retention_time, Duration::from_secs(3600));
    assert_eq!(config.key_prefix, "postern:queue");
}

#[tokio::test]
async fn test_pool_drains_critical_before_default_before_low() {
    let queue = Queue::memory();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut worker = Worker::with_config(queue.clone(), WorkerConfig::default().with_concurrency(1));
    for job_type in ["bounce:process", "email:send", "cleanup"] {
        let seen = seen.clone();
        worker.register_handler(job_type, move |job| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(job.job_type);
                Ok(())
            }
        });
    }

    queue
        .enqueue("cleanup", json!({}), JobOptions::new(QueueTier::Low, 1, Duration::from_secs(5)))
        .await
        .unwrap();
    queue.enqueue("email:send", json!({}), JobOptions::default()).await.unwrap();
    queue
        .enqueue(
            "bounce:process",
            json!({}),
            JobOptions::new(QueueTier::Critical, 3, Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert_eq!(worker.drain().await.unwrap(), 3);
    assert_eq!(
        *seen.lock().await,
        vec!["bounce:process", "email:send", "cleanup"]
    );
}

#[tokio::test]
async fn test_started_pool_processes_jobs() {
    let queue = Queue::memory();
    let done = Arc::new(AtomicUsize::new(0));

    let mut worker = Worker::with_config(
        queue.clone(),
        WorkerConfig::default()
            .with_concurrency(4)
            .with_poll_interval(Duration::from_millis(5)),
    );
    let counter = done.clone();
    worker.register_handler("email:send", move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    for i in 0..20 {
        queue
            .enqueue("email:send", json!({"email_id": i}), JobOptions::default())
            .await
            .unwrap();
    }

    worker.start().unwrap();
    for _ in 0..200 {
        if done.load(Ordering::SeqCst) == 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.stop().await.unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 20);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.processed, 20);
    assert_eq!(stats.outstanding(), 0);
}

#[tokio::test]
async fn test_handler_timeout_counts_as_failure() {
    let queue = Queue::memory();
    let mut worker = Worker::new(queue.clone());
    worker.register_handler("slow", |_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    });

    queue
        .enqueue("slow", json!({}), JobOptions::new(QueueTier::Default, 1, Duration::from_secs(1)))
        .await
        .unwrap();

    assert_eq!(worker.process_next().await.unwrap(), Some(JobState::Dead));
    let dead = queue.dead_jobs(1).await.unwrap();
    assert!(dead[0].status.error.as_deref().unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn test_retry_backoff_grows_until_dead() {
    let backend = Arc::new(MemoryBackend::new());
    let queue = Queue::with_backend(backend.clone());
    let id = queue
        .enqueue(
            "webhook:deliver",
            json!({}),
            JobOptions::new(QueueTier::Default, 4, Duration::from_secs(30)),
        )
        .await
        .unwrap();

    let mut delays = Vec::new();
    let mut clock = chrono::Utc::now();
    loop {
        let job = backend.pop(clock).await.unwrap().expect("job should be due");
        let started = chrono::Utc::now();
        let state = queue.fail(job, "HTTP 500").await.unwrap();
        if state == JobState::Dead {
            break;
        }
        let stored = queue.get_job(id).await.unwrap().unwrap();
        let run_at = stored.run_at.unwrap();
        delays.push((run_at - started).num_milliseconds());
        clock = run_at;
    }

    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(queue.stats().await.unwrap().dead, 1);
}

#[tokio::test]
async fn test_abandoned_job_runs_again() {
    let backend = Arc::new(MemoryBackend::new());
    let queue = Queue::with_backend(backend.clone());
    let id = queue
        .enqueue(
            "email:send",
            json!({"email_id": 9}),
            JobOptions::new(QueueTier::Default, 3, Duration::from_secs(30)),
        )
        .await
        .unwrap();

    // The first worker dies while holding the job.
    let first = backend.pop(chrono::Utc::now()).await.unwrap().unwrap();
    assert_eq!(first.id, id);
    assert!(queue.dequeue().await.unwrap().is_none());

    let later = chrono::Utc::now() + chrono::Duration::minutes(5);
    assert_eq!(queue.recover_abandoned_at(later).await.unwrap(), 1);

    let again = backend
        .pop(later + chrono::Duration::minutes(1))
        .await
        .unwrap()
        .expect("job is back in its tier");
    assert_eq!(again.id, id);
    assert_eq!(again.attempts, 2);

    queue.complete(again).await.unwrap();
    let stored = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status.state, JobState::Completed);
    assert_eq!(queue.stats().await.unwrap().processing, 0);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_redis_abandoned_job_is_reclaimed() {
    let config = QueueConfig::new("redis://localhost:6379").with_key_prefix("postern:test:reclaim");
    let queue = Queue::connect(config).await.unwrap();
    queue.clear().await.unwrap();

    let id = queue
        .enqueue(
            "email:send",
            json!({"email_id": 2}),
            JobOptions::new(QueueTier::Default, 3, Duration::from_secs(5)),
        )
        .await
        .unwrap();
    queue.dequeue().await.unwrap().unwrap();
    assert_eq!(queue.stats().await.unwrap().processing, 1);

    let later = chrono::Utc::now() + chrono::Duration::minutes(5);
    assert_eq!(queue.recover_abandoned_at(later).await.unwrap(), 1);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.delayed, 1);
    assert_eq!(queue.get_job(id).await.unwrap().unwrap().attempts, 1);
    queue.clear().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_redis_round_trip() {
    let config = QueueConfig::new("redis://localhost:6379").with_key_prefix("postern:test");
    let queue = Queue::connect(config).await.unwrap();
    queue.clear().await.unwrap();

    let id = queue
        .enqueue("email:send", json!({"email_id": 1}), JobOptions::default())
        .await
        .unwrap();
    let job = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);

    queue.complete(job).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().processed, 1);
    queue.clear().await.unwrap();
}
