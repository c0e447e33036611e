//! The job queue the engine dispatches through.
//!
//! The orchestrator treats the queue purely as a transport for "advance this
//! run" signals: at-least-once delivery, delayed delivery (`start_after`),
//! scheduled cron fan-out, and per-queue concurrency caps. [`JobQueue`] is
//! the contract; [`PgQueue`] implements it on the same database as the run
//! store, which is what lets `send` participate in a run-store transaction.

mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

pub use postgres::PgQueue;

use crate::error::{HandlerError, Result};

/// The shared queue all run dispatches funnel through (unless a workflow has
/// its own queue).
pub const WORKFLOW_RUN_QUEUE: &str = "workflow-run";

/// A delivered job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: Value,
    /// Delivery attempts so far, including this one.
    pub attempts: i32,
    /// Redeliveries allowed after a failed delivery.
    pub retry_limit: i32,
    pub created_at: OffsetDateTime,
}

/// Options for [`JobQueue::send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Earliest delivery time; `None` means deliverable immediately.
    pub start_after: Option<OffsetDateTime>,
    /// How long a claimed job stays invisible before it is considered
    /// abandoned and redelivered.
    pub expire_in_seconds: u64,
    /// Redeliveries allowed after a failed delivery before the job is
    /// marked failed.
    pub retry_limit: i32,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            start_after: None,
            expire_in_seconds: 300,
            retry_limit: 2,
        }
    }
}

impl SendOptions {
    pub fn delayed(start_after: OffsetDateTime) -> Self {
        Self {
            start_after: Some(start_after),
            ..Default::default()
        }
    }

    pub fn expire_in_seconds(mut self, seconds: u64) -> Self {
        self.expire_in_seconds = seconds;
        self
    }
}

/// Subscriber tuning for [`JobQueue::work`].
#[derive(Debug, Clone)]
pub struct WorkOptions {
    pub polling_interval: Duration,
    pub batch_size: i64,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(500),
            batch_size: 1,
        }
    }
}

/// Handler a worker invokes with each claimed batch.
///
/// Returning `Ok` acks the whole batch; returning `Err` nacks it for
/// redelivery (bounded by each job's `retry_limit`).
pub type JobHandler = Arc<
    dyn Fn(Vec<Job>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync,
>;

/// Queue contract the orchestrator depends on.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create the queue tables if absent. Idempotent.
    async fn migrate(&self) -> Result<()>;

    /// Boot the cron schedule materializer.
    async fn start(&self) -> Result<()>;

    /// Register a queue. Idempotent; re-registering updates the concurrency
    /// limit.
    async fn create_queue(&self, name: &str, concurrency_limit: Option<u32>) -> Result<()>;

    /// Enqueue a payload.
    async fn send(&self, queue: &str, payload: Value, options: SendOptions) -> Result<Uuid>;

    /// Enqueue a payload inside the caller's transaction, so the enqueue
    /// commits or rolls back atomically with row writes.
    async fn send_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<Uuid>;

    /// Subscribe a handler to a queue. Spawns a polling worker that runs
    /// until [`JobQueue::stop`].
    async fn work(&self, queue: &str, options: WorkOptions, handler: JobHandler) -> Result<()>;

    /// Register (or replace) a cron that sends `payload` to `queue` on every
    /// tick, evaluated in `timezone`.
    async fn schedule(
        &self,
        queue: &str,
        expression: &str,
        payload: Value,
        timezone: &str,
    ) -> Result<()>;

    /// Remove a queue's cron.
    async fn unschedule(&self, queue: &str) -> Result<()>;

    /// Drain all workers and the schedule materializer.
    async fn stop(&self) -> Result<()>;
}
