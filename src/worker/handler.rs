//! Job execution contract.
//!
//! The engine never interprets payloads. Application code supplies a
//! [`JobHandler`], invoked once per claimed job; an `Err` (or a panic) marks
//! the job failed with the error's message.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::model::Job;

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn execute(&self, job: &Job) -> anyhow::Result<()>;
}

/// Logs each payload after an optional simulated delay. Never fails.
#[derive(Debug, Clone, Default)]
pub struct LogHandler {
    delay: Duration,
}

impl LogHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl JobHandler for LogHandler {
    async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        info!(job_id = %job.id, payload = %job.payload, "processed job");
        Ok(())
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct HandlerFn<F>(F);

/// Wrap `f` as a handler. The closure receives an owned copy of the job.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        (self.0)(job.clone()).await
    }
}
