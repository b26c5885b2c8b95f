//! A set of workers sharing one queue, one handler, and one shutdown token.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::Queue;

use super::{JobHandler, Worker, WorkerConfig, WorkerReport};

/// Call [`shutdown`](Self::shutdown) or [`join`](Self::join) to collect the
/// reports. Dropping the pool cancels its workers and detaches them, so each
/// still finalizes the job it holds before exiting.
pub struct WorkerPool {
    shutdown: CancellationToken,
    workers: JoinSet<(usize, String, WorkerReport)>,
}

impl WorkerPool {
    /// Spawn `count` workers onto the current tokio runtime.
    ///
    /// Worker ids share a random prefix so jobs claimed by this pool can be
    /// told apart from other processes' work.
    pub fn spawn(
        queue: &Queue,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
        count: usize,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let prefix = Uuid::new_v4().simple().to_string();
        let prefix = &prefix[..8];
        let mut workers = JoinSet::new();

        for n in 0..count {
            let worker = Worker::new(queue.clone(), Arc::clone(&handler), config.clone())
                .with_id(format!("worker-{prefix}-{n}"))
                .with_shutdown(shutdown.child_token());
            workers.spawn(async move {
                let report = worker.run().await;
                (n, worker.id().to_string(), report)
            });
        }

        info!(count, prefix, "worker pool started");
        Self { shutdown, workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Token that stops every worker in the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel all workers and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> Vec<(String, WorkerReport)> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for every worker to stop (after someone cancels the token).
    /// Reports come back in spawn order.
    pub async fn join(mut self) -> Vec<(String, WorkerReport)> {
        let mut reports = Vec::with_capacity(self.workers.len());
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("worker task ended abnormally: {e}"),
            }
        }
        reports.sort_by_key(|(n, _, _)| *n);
        reports
            .into_iter()
            .map(|(_, id, report)| (id, report))
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        warn!(
            count = self.workers.len(),
            "worker pool dropped without join, stopping workers in the background"
        );
        self.shutdown.cancel();
        self.workers.detach_all();
    }
}
