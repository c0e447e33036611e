//! PostgreSQL-backed job queue.
//!
//! Jobs live in `runloom.queue_jobs`. Delivery claims use `FOR UPDATE SKIP
//! LOCKED` so workers on any number of processes never claim the same job;
//! the claim sets `locked_until = now() + expire_in_seconds`, computed in
//! the database to avoid clock skew. Cron schedules live in
//! `runloom.queue_schedules` and are materialized into jobs by a scheduler
//! loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Job, JobHandler, JobQueue, SendOptions, WorkOptions};
use crate::cron::CronSchedule;
use crate::error::Result;

const SCHEDULER_POLL: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue implementation sharing the engine's Postgres database.
pub struct PgQueue {
    core: QueueCore,
    worker_id: String,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_seq: AtomicUsize,
    scheduler_started: AtomicBool,
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    payload: Json<Value>,
    attempts: i32,
    retry_limit: i32,
    created_at: OffsetDateTime,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            queue: row.queue_name,
            payload: row.payload.0,
            attempts: row.attempts,
            retry_limit: row.retry_limit,
            created_at: row.created_at,
        }
    }
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: QueueCore { pool },
            worker_id: Uuid::new_v4().to_string(),
            shutdown,
            workers: Mutex::new(Vec::new()),
            worker_seq: AtomicUsize::new(0),
            scheduler_started: AtomicBool::new(false),
        }
    }

    fn push_worker(&self, handle: JoinHandle<()>) {
        self.workers
            .lock()
            .expect("queue worker list poisoned")
            .push(handle);
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn migrate(&self) -> Result<()> {
        for statement in [
            "CREATE SCHEMA IF NOT EXISTS runloom",
            r#"
            CREATE TABLE IF NOT EXISTS runloom.queues (
                name               text PRIMARY KEY,
                concurrency_limit  integer,
                created_at         timestamptz NOT NULL DEFAULT now()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runloom.queue_jobs (
                id                 uuid PRIMARY KEY,
                queue_name         text NOT NULL,
                payload            jsonb NOT NULL DEFAULT '{}'::jsonb,
                attempts           integer NOT NULL DEFAULT 0,
                retry_limit        integer NOT NULL DEFAULT 2,
                expire_in_seconds  bigint NOT NULL DEFAULT 300,
                start_after        timestamptz NOT NULL DEFAULT now(),
                created_at         timestamptz NOT NULL DEFAULT now(),
                locked_until       timestamptz,
                locked_by          text,
                completed_at       timestamptz,
                failed_at          timestamptz,
                last_error         text
            )
            "#,
            "CREATE INDEX IF NOT EXISTS queue_jobs_claim_idx \
             ON runloom.queue_jobs (queue_name, start_after) \
             WHERE completed_at IS NULL AND failed_at IS NULL",
            r#"
            CREATE TABLE IF NOT EXISTS runloom.queue_schedules (
                queue_name    text PRIMARY KEY,
                cron          text NOT NULL,
                timezone      text NOT NULL DEFAULT 'UTC',
                payload       jsonb NOT NULL DEFAULT '{}'::jsonb,
                next_fire_at  timestamptz NOT NULL,
                created_at    timestamptz NOT NULL DEFAULT now(),
                updated_at    timestamptz NOT NULL DEFAULT now()
            )
            "#,
        ] {
            sqlx::query(statement).execute(&self.core.pool).await?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.scheduler_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let core = self.core.clone();
        let mut shutdown = self.shutdown.subscribe();
        let worker_id = format!("{}-scheduler", self.worker_id);

        let handle = tokio::spawn(async move {
            let mut poll = interval(SCHEDULER_POLL);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(worker_id = %worker_id, "schedule materializer started");

            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        if let Err(e) = core.materialize_due_schedules().await {
                            error!(error = %e, "error materializing cron schedules");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(worker_id = %worker_id, "schedule materializer shutting down");
                            break;
                        }
                    }
                }
            }
        });
        self.push_worker(handle);
        Ok(())
    }

    async fn create_queue(&self, name: &str, concurrency_limit: Option<u32>) -> Result<()> {
        sqlx::query(
            "INSERT INTO runloom.queues (name, concurrency_limit) \
             VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET concurrency_limit = EXCLUDED.concurrency_limit",
        )
        .bind(name)
        .bind(concurrency_limit.map(|limit| limit as i32))
        .execute(&self.core.pool)
        .await?;
        Ok(())
    }

    async fn send(&self, queue: &str, payload: Value, options: SendOptions) -> Result<Uuid> {
        QueueCore::insert_job(&self.core.pool, queue, &payload, &options).await
    }

    async fn send_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<Uuid> {
        QueueCore::insert_job(&mut **tx, queue, &payload, &options).await
    }

    async fn work(&self, queue: &str, options: WorkOptions, handler: JobHandler) -> Result<()> {
        let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst);
        let worker = format!("{}-{}-{}", self.worker_id, queue, seq);
        let queue_name = queue.to_owned();
        let core = self.core.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut poll = interval(options.polling_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(worker = %worker, queue = %queue_name, "queue worker started");

            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        if let Err(e) = core
                            .drain_once(&queue_name, &options, &handler, &worker)
                            .await
                        {
                            error!(queue = %queue_name, error = %e, "error processing queue jobs");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(worker = %worker, queue = %queue_name, "queue worker shutting down");
                            break;
                        }
                    }
                }
            }
        });
        self.push_worker(handle);
        Ok(())
    }

    async fn schedule(
        &self,
        queue: &str,
        expression: &str,
        payload: Value,
        timezone: &str,
    ) -> Result<()> {
        let schedule = CronSchedule::parse(expression, timezone)?;
        let next_fire_at = schedule
            .next_after(OffsetDateTime::now_utc())?
            .ok_or_else(|| crate::error::Error::InvalidCron {
                expression: expression.to_owned(),
                reason: "schedule has no future occurrences".to_owned(),
            })?;

        sqlx::query(
            "INSERT INTO runloom.queue_schedules \
             (queue_name, cron, timezone, payload, next_fire_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (queue_name) DO UPDATE \
             SET cron = EXCLUDED.cron, \
                 timezone = EXCLUDED.timezone, \
                 payload = EXCLUDED.payload, \
                 next_fire_at = EXCLUDED.next_fire_at, \
                 updated_at = now()",
        )
        .bind(queue)
        .bind(expression)
        .bind(timezone)
        .bind(Json(&payload))
        .bind(next_fire_at)
        .execute(&self.core.pool)
        .await?;
        Ok(())
    }

    async fn unschedule(&self, queue: &str) -> Result<()> {
        sqlx::query("DELETE FROM runloom.queue_schedules WHERE queue_name = $1")
            .bind(queue)
            .execute(&self.core.pool)
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("queue worker list poisoned"));
        if handles.is_empty() {
            return Ok(());
        }

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "queue shutdown timeout exceeded, abandoning workers"
            );
        }
        Ok(())
    }
}

/// Pool-owning guts shared between the queue handle and its worker tasks.
#[derive(Clone)]
struct QueueCore {
    pool: PgPool,
}

impl QueueCore {
    async fn insert_job<'e, E>(
        executor: E,
        queue: &str,
        payload: &Value,
        options: &SendOptions,
    ) -> Result<Uuid>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO runloom.queue_jobs \
             (id, queue_name, payload, retry_limit, expire_in_seconds, start_after) \
             VALUES ($1, $2, $3, $4, $5, COALESCE($6, now()))",
        )
        .bind(id)
        .bind(queue)
        .bind(Json(payload))
        .bind(options.retry_limit)
        .bind(options.expire_in_seconds as i64)
        .bind(options.start_after)
        .execute(executor)
        .await?;
        Ok(id)
    }

    /// Claim up to `batch` due jobs from a queue.
    ///
    /// For a concurrency-limited queue the queue row is locked first, which
    /// serializes claimers and makes the in-flight count + claim atomic: at
    /// most `limit - in_flight` jobs are handed out.
    async fn claim(&self, queue: &str, batch: i64, worker: &str) -> Result<Vec<Job>> {
        let mut tx = self.pool.begin().await?;

        let limit: Option<Option<i32>> = sqlx::query_scalar(
            "SELECT concurrency_limit FROM runloom.queues WHERE name = $1 FOR UPDATE",
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;

        let claim_limit = match limit.flatten() {
            Some(cap) => {
                let in_flight: i64 = sqlx::query_scalar(
                    "SELECT count(*) FROM runloom.queue_jobs \
                     WHERE queue_name = $1 \
                       AND completed_at IS NULL AND failed_at IS NULL \
                       AND locked_until > now()",
                )
                .bind(queue)
                .fetch_one(&mut *tx)
                .await?;
                (i64::from(cap) - in_flight).clamp(0, batch)
            }
            None => batch,
        };

        if claim_limit == 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            UPDATE runloom.queue_jobs
            SET locked_until = now() + (expire_in_seconds * interval '1 second'),
                locked_by = $2,
                attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM runloom.queue_jobs
                WHERE queue_name = $1
                  AND completed_at IS NULL
                  AND failed_at IS NULL
                  AND start_after <= now()
                  AND (locked_until IS NULL OR locked_until < now())
                ORDER BY created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue_name, payload, attempts, retry_limit, created_at
            "#,
        )
        .bind(queue)
        .bind(worker)
        .bind(claim_limit)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn complete(&self, job_ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            "UPDATE runloom.queue_jobs \
             SET completed_at = now(), locked_until = NULL, locked_by = NULL \
             WHERE id = ANY($1)",
        )
        .bind(job_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed delivery: release for redelivery while attempts
    /// remain, otherwise mark the job failed.
    async fn record_failure(&self, job: &Job, error_message: &str) -> Result<()> {
        if job.attempts > job.retry_limit {
            warn!(
                job_id = %job.id,
                queue = %job.queue,
                attempts = job.attempts,
                error = %error_message,
                "job exceeded its retry limit, marking failed"
            );
            sqlx::query(
                "UPDATE runloom.queue_jobs \
                 SET failed_at = now(), last_error = $2, locked_until = NULL, locked_by = NULL \
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE runloom.queue_jobs \
                 SET locked_until = NULL, locked_by = NULL, last_error = $2 \
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn drain_once(
        &self,
        queue: &str,
        options: &WorkOptions,
        handler: &JobHandler,
        worker: &str,
    ) -> Result<()> {
        let jobs = self.claim(queue, options.batch_size, worker).await?;
        if jobs.is_empty() {
            return Ok(());
        }

        debug!(queue = %queue, count = jobs.len(), worker = %worker, "processing jobs");

        let handler = Arc::clone(handler);
        match handler(jobs.clone()).await {
            Ok(()) => {
                let ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
                self.complete(&ids).await?;
            }
            Err(e) => {
                let message = crate::error::error_chain(&*e);
                for job in &jobs {
                    self.record_failure(job, &message).await?;
                }
            }
        }
        Ok(())
    }

    /// Materialize due cron schedules into jobs and advance their
    /// `next_fire_at`.
    async fn materialize_due_schedules(&self) -> Result<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let due: Vec<(String, String, String, Json<Value>)> = sqlx::query_as(
            "SELECT queue_name, cron, timezone, payload \
             FROM runloom.queue_schedules \
             WHERE next_fire_at <= now() \
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await?;

        for (queue, expression, timezone, payload) in due {
            Self::insert_job(&mut *tx, &queue, &payload.0, &SendOptions::default()).await?;
            debug!(queue = %queue, "cron fired");

            let next = CronSchedule::parse(&expression, &timezone)
                .and_then(|schedule| schedule.next_after(OffsetDateTime::now_utc()));
            match next {
                Ok(Some(next_fire_at)) => {
                    sqlx::query(
                        "UPDATE runloom.queue_schedules \
                         SET next_fire_at = $2, updated_at = now() \
                         WHERE queue_name = $1",
                    )
                    .bind(&queue)
                    .bind(next_fire_at)
                    .execute(&mut *tx)
                    .await?;
                }
                Ok(None) => {
                    info!(queue = %queue, "cron schedule has no future occurrences, removing");
                    sqlx::query("DELETE FROM runloom.queue_schedules WHERE queue_name = $1")
                        .bind(&queue)
                        .execute(&mut *tx)
                        .await?;
                }
                Err(e) => {
                    // Push a corrupt schedule forward rather than firing it
                    // on every poll.
                    warn!(queue = %queue, error = %e, "cron schedule failed to parse");
                    sqlx::query(
                        "UPDATE runloom.queue_schedules \
                         SET next_fire_at = now() + interval '1 minute', updated_at = now() \
                         WHERE queue_name = $1",
                    )
                    .bind(&queue)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
