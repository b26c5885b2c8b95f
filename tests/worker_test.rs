//! Worker loop tests: execution, failure capture, shutdown, and many
//! workers sharing one backlog.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobq_rs::engine::Queue;
use jobq_rs::model::*;
use jobq_rs::store::MemoryStore;
use jobq_rs::worker::{LogHandler, Worker, WorkerConfig, WorkerPool, handler_fn};
use serde_json::json;
use tokio::sync::Notify;

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        ..WorkerConfig::default()
    }
}

async fn submit(queue: &Queue, payload: serde_json::Value) -> JobId {
    queue.submit(NewJob::new(payload)).await.unwrap().job.id
}

/// Poll until every job is terminal, or panic after `limit`.
async fn wait_terminal(queue: &Queue, ids: &[JobId], limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let mut pending = 0;
        for id in ids {
            if !queue.get(*id).await.unwrap().status.is_terminal() {
                pending += 1;
            }
        }
        if pending == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{pending} job(s) still not terminal"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_ends_completed() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let id = submit(&queue, json!({"task": "x"})).await;

    let before = queue.get_status(id).await.unwrap();
    assert_eq!(before.status, Status::Queued);
    assert_eq!(before.attempt_count, 0);

    let worker = Worker::new(queue.clone(), Arc::new(LogHandler::default()), fast_config())
        .with_id("worker-a");
    let report = worker.drain().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let job = queue.get(id).await.unwrap();
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
    assert!(job.completed_at.is_some());
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn failing_job_records_error() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let id = submit(&queue, json!({"task": "x"})).await;

    let handler = handler_fn(|_job| async { Err::<(), _>(anyhow::anyhow!("disk full")) });
    let worker = Worker::new(queue.clone(), Arc::new(handler), fast_config());
    let report = worker.drain().await.unwrap();
    assert_eq!(report.failed, 1);

    let report = queue.get_status(id).await.unwrap();
    assert_eq!(report.status, Status::Failed);
    assert_eq!(report.last_error.as_deref(), Some("disk full"));
    assert!(queue.get(id).await.unwrap().completed_at.is_some());
}

#[tokio::test]
async fn handler_panic_fails_only_that_job() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let bad = submit(&queue, json!({"explode": true})).await;
    let good = submit(&queue, json!({"explode": false})).await;

    let handler = handler_fn(|job: Job| async move {
        if job.payload["explode"] == json!(true) {
            panic!("boom");
        }
        Ok::<(), anyhow::Error>(())
    });
    let worker = Worker::new(queue.clone(), Arc::new(handler), fast_config());
    let report = worker.drain().await.unwrap();
    assert_eq!(report.processed(), 2);

    let bad = queue.get(bad).await.unwrap();
    assert_eq!(bad.status, Status::Failed);
    assert_eq!(bad.last_error.as_deref(), Some("handler panicked: boom"));
    assert_eq!(queue.get(good).await.unwrap().status, Status::Completed);
}

#[tokio::test]
async fn execution_timeout_fails_the_job() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let id = submit(&queue, json!({"task": "slow"})).await;

    let handler = handler_fn(|_job| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<(), anyhow::Error>(())
    });
    let config = WorkerConfig {
        execution_timeout: Some(Duration::from_millis(20)),
        ..fast_config()
    };
    Worker::new(queue.clone(), Arc::new(handler), config)
        .drain()
        .await
        .unwrap();

    let job = queue.get(id).await.unwrap();
    assert_eq!(job.status, Status::Failed);
    assert!(job.last_error.unwrap().contains("timed out"));
}

// ---------------------------------------------------------------------------
// Run loop and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_loop_picks_up_later_submissions_until_shutdown() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let worker = Arc::new(Worker::new(
        queue.clone(),
        Arc::new(LogHandler::default()),
        fast_config(),
    ));

    let running = Arc::clone(&worker);
    let handle = tokio::spawn(async move { running.run().await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let id = submit(&queue, json!({"task": "late"})).await;
    wait_terminal(&queue, &[id], Duration::from_secs(5)).await;

    worker.shutdown();
    let report = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker should stop promptly")
        .unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(queue.get(id).await.unwrap().status, Status::Completed);
}

#[tokio::test]
async fn shutdown_finishes_current_job_and_claims_no_more() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let first = submit(&queue, json!({"n": 1})).await;
    let second = submit(&queue, json!({"n": 2})).await;

    let started = Arc::new(Notify::new());
    let signal = Arc::clone(&started);
    let handler = handler_fn(move |_job| {
        let signal = Arc::clone(&signal);
        async move {
            signal.notify_one();
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<(), anyhow::Error>(())
        }
    });

    let worker = Arc::new(Worker::new(queue.clone(), Arc::new(handler), fast_config()));
    let running = Arc::clone(&worker);
    let handle = tokio::spawn(async move { running.run().await });

    started.notified().await;
    worker.shutdown();
    let report = handle.await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(queue.get(first).await.unwrap().status, Status::Completed);
    let untouched = queue.get(second).await.unwrap();
    assert_eq!(untouched.status, Status::Queued);
    assert_eq!(untouched.attempt_count, 0);
}

#[tokio::test]
async fn store_outage_is_retried_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    let queue = Queue::new(store.clone());
    let id = submit(&queue, json!({"task": "x"})).await;

    store.set_available(false);
    let worker = Arc::new(Worker::new(
        queue.clone(),
        Arc::new(LogHandler::default()),
        fast_config(),
    ));
    let running = Arc::clone(&worker);
    let handle = tokio::spawn(async move { running.run().await });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!handle.is_finished());
    store.set_available(true);

    wait_terminal(&queue, &[id], Duration::from_secs(5)).await;
    worker.shutdown();
    let report = handle.await.unwrap();
    assert!(report.store_errors > 0);
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn outcome_write_survives_outage_during_execution() {
    let store = Arc::new(MemoryStore::new());
    let queue = Queue::new(store.clone());
    let id = submit(&queue, json!({"task": "x"})).await;

    // The store drops out while the handler runs and stays down well past
    // several backoff periods.
    let offline = store.clone();
    let handler = handler_fn(move |_job| {
        let offline = offline.clone();
        async move {
            offline.set_available(false);
            Ok::<(), anyhow::Error>(())
        }
    });
    let restore = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        restore.set_available(true);
    });

    let report = Worker::new(queue.clone(), Arc::new(handler), fast_config())
        .drain()
        .await
        .unwrap();
    assert_eq!(report.completed, 1);

    let job = queue.get(id).await.unwrap();
    assert_eq!(job.status, Status::Completed);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn finalize_cap_is_opt_in() {
    let store = Arc::new(MemoryStore::new());
    let queue = Queue::new(store.clone());
    let id = submit(&queue, json!({"task": "x"})).await;

    let offline = store.clone();
    let handler = handler_fn(move |_job| {
        let offline = offline.clone();
        async move {
            offline.set_available(false);
            Ok::<(), anyhow::Error>(())
        }
    });
    let config = WorkerConfig {
        finalize_attempts: Some(2),
        ..fast_config()
    };
    let worker = Worker::new(queue.clone(), Arc::new(handler), config);
    // The claim after the abandoned write also hits the outage.
    assert!(worker.drain().await.is_err());

    store.set_available(true);
    assert_eq!(queue.get(id).await.unwrap().status, Status::Processing);
}

// ---------------------------------------------------------------------------
// Many workers, one backlog
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_workers_drain_hundred_jobs_exactly_once() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let mut ids = Vec::new();
    for n in 0..100 {
        ids.push(submit(&queue, json!({ "n": n })).await);
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let handler = Arc::new(handler_fn(move |job: Job| {
        let record = Arc::clone(&record);
        async move {
            record.lock().unwrap().push(job.id);
            tokio::task::yield_now().await;
            Ok::<(), anyhow::Error>(())
        }
    }));

    let mut handles = Vec::new();
    for w in 0..10 {
        let worker = Worker::new(queue.clone(), handler.clone(), fast_config())
            .with_id(format!("worker-{w}"));
        handles.push(tokio::spawn(async move { worker.drain().await.unwrap() }));
    }
    let mut processed = 0;
    for handle in handles {
        processed += handle.await.unwrap().processed();
    }

    let seen = seen.lock().unwrap().clone();
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(processed, 100);
    assert_eq!(seen.len(), 100, "a job was executed more than once");
    assert_eq!(unique, ids.iter().copied().collect::<HashSet<_>>());

    for id in &ids {
        let job = queue.get(*id).await.unwrap();
        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.attempt_count, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_processes_backlog_and_reports_per_worker() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let mut ids = Vec::new();
    for n in 0..20 {
        ids.push(submit(&queue, json!({ "n": n })).await);
    }

    let pool = WorkerPool::spawn(&queue, Arc::new(LogHandler::default()), fast_config(), 4);
    assert_eq!(pool.len(), 4);

    wait_terminal(&queue, &ids, Duration::from_secs(5)).await;
    let reports = pool.shutdown().await;

    assert_eq!(reports.len(), 4);
    let total: u64 = reports.iter().map(|(_, r)| r.processed()).sum();
    assert_eq!(total, 20);
    for (worker_id, _) in &reports {
        assert!(worker_id.starts_with("worker-"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_reports_follow_spawn_order() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let pool = WorkerPool::spawn(&queue, Arc::new(LogHandler::default()), fast_config(), 12);
    let reports = pool.shutdown().await;

    let suffixes: Vec<usize> = reports
        .iter()
        .map(|(id, _)| id.rsplit('-').next().unwrap().parse().unwrap())
        .collect();
    assert_eq!(suffixes, (0..12).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_pool_still_finishes_in_flight_job() {
    let queue = Queue::new(Arc::new(MemoryStore::new()));
    let first = submit(&queue, json!({"n": 1})).await;

    let started = Arc::new(Notify::new());
    let signal = Arc::clone(&started);
    let handler = handler_fn(move |_job| {
        let signal = Arc::clone(&signal);
        async move {
            signal.notify_one();
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<(), anyhow::Error>(())
        }
    });

    let pool = WorkerPool::spawn(&queue, Arc::new(handler), fast_config(), 1);
    started.notified().await;
    drop(pool);

    wait_terminal(&queue, &[first], Duration::from_secs(5)).await;
    assert_eq!(queue.get(first).await.unwrap().status, Status::Completed);

    // Workers stop after their current job, so later submissions stay queued.
    let second = submit(&queue, json!({"n": 2})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.get(second).await.unwrap().status, Status::Queued);
}
