//! PostgreSQL run store implementation.

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use time::OffsetDateTime;
use tracing::info;

use super::{clamp_limit, NewRun, RunFilter, RunPage, RunPatch};
use crate::error::Result;
use crate::run::{generate_run_id, RunStatus, Timeline, WorkflowRun};

/// Name of the partial unique index backing idempotent run creation.
pub(crate) const IDEMPOTENCY_CONSTRAINT: &str = "workflow_runs_idempotency_idx";

const RUN_COLUMNS: &str = "id, workflow_id, resource_id, status, input, output, error, \
     current_step_id, timeline, created_at, updated_at, paused_at, resumed_at, \
     completed_at, timeout_at, retry_count, max_retries, job_id, cron, timezone, \
     idempotency_key";

/// Store for `workflow_runs` rows.
///
/// # Concurrency
///
/// Different runs can be mutated concurrently (different rows). Mutations of
/// the same run are serialized by `SELECT … FOR UPDATE`; the lock is held
/// for the duration of the surrounding transaction and released on commit.
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct RunRow {
    id: String,
    workflow_id: String,
    resource_id: Option<String>,
    status: String,
    input: Json<Value>,
    output: Option<Json<Value>>,
    error: Option<String>,
    current_step_id: Option<String>,
    timeline: Json<Timeline>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    paused_at: Option<OffsetDateTime>,
    resumed_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    timeout_at: Option<OffsetDateTime>,
    retry_count: i32,
    max_retries: i32,
    job_id: Option<String>,
    cron: Option<String>,
    timezone: Option<String>,
    idempotency_key: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<WorkflowRun> {
        Ok(WorkflowRun {
            id: self.id,
            workflow_id: self.workflow_id,
            resource_id: self.resource_id,
            status: RunStatus::parse(&self.status)?,
            input: self.input.0,
            output: self.output.map(|json| json.0),
            error: self.error,
            current_step_id: self.current_step_id,
            timeline: self.timeline.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
            paused_at: self.paused_at,
            resumed_at: self.resumed_at,
            completed_at: self.completed_at,
            timeout_at: self.timeout_at,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            job_id: self.job_id,
            cron: self.cron,
            timezone: self.timezone,
            idempotency_key: self.idempotency_key,
        })
    }
}

impl PgRunStore {
    /// Create a new run store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction on the store's pool.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Create the schema if absent; additively upgrade it otherwise.
    ///
    /// Idempotent: safe to run on every engine start. A pre-existing
    /// `workflow_runs` table from before the cron feature gets the cron
    /// columns and partial index applied without touching its data. Never
    /// drops or renames.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS runloom")
            .execute(&self.pool)
            .await?;

        let table_exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'runloom' AND table_name = 'workflow_runs'
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        if !table_exists {
            info!("creating runloom.workflow_runs");
            sqlx::query(
                r#"
                CREATE TABLE runloom.workflow_runs (
                    id               text PRIMARY KEY,
                    workflow_id      text NOT NULL,
                    resource_id      text,
                    status           text NOT NULL,
                    input            jsonb NOT NULL DEFAULT '{}'::jsonb,
                    output           jsonb,
                    error            text,
                    current_step_id  text,
                    timeline         jsonb NOT NULL DEFAULT '{}'::jsonb,
                    created_at       timestamptz NOT NULL DEFAULT now(),
                    updated_at       timestamptz NOT NULL DEFAULT now(),
                    paused_at        timestamptz,
                    resumed_at       timestamptz,
                    completed_at     timestamptz,
                    timeout_at       timestamptz,
                    retry_count      integer NOT NULL DEFAULT 0,
                    max_retries      integer NOT NULL DEFAULT 0,
                    job_id           text,
                    cron             text,
                    timezone         text,
                    idempotency_key  text
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
        } else {
            // Apply the cron columns to tables that pre-date them.
            let has_cron: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM information_schema.columns
                    WHERE table_schema = 'runloom'
                      AND table_name = 'workflow_runs'
                      AND column_name = 'cron'
                )
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

            if !has_cron {
                info!("adding cron columns to runloom.workflow_runs");
                sqlx::query(
                    "ALTER TABLE runloom.workflow_runs \
                     ADD COLUMN IF NOT EXISTS cron text, \
                     ADD COLUMN IF NOT EXISTS timezone text",
                )
                .execute(&self.pool)
                .await?;
            }
        }

        for statement in [
            "CREATE INDEX IF NOT EXISTS workflow_runs_workflow_id_idx \
             ON runloom.workflow_runs (workflow_id)",
            "CREATE INDEX IF NOT EXISTS workflow_runs_created_at_idx \
             ON runloom.workflow_runs (created_at)",
            "CREATE INDEX IF NOT EXISTS workflow_runs_resource_id_idx \
             ON runloom.workflow_runs (resource_id)",
            // Accelerates the cron "last completed" lookup.
            "CREATE INDEX IF NOT EXISTS workflow_runs_cron_completed_idx \
             ON runloom.workflow_runs (workflow_id, completed_at DESC) \
             WHERE cron IS NOT NULL AND status = 'completed'",
            // Idempotent run creation: one active run per (workflow, key).
            "CREATE UNIQUE INDEX IF NOT EXISTS workflow_runs_idempotency_idx \
             ON runloom.workflow_runs (workflow_id, idempotency_key) \
             WHERE idempotency_key IS NOT NULL \
               AND status IN ('pending', 'running', 'paused')",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Insert a new run inside the caller's transaction.
    ///
    /// Allocates a sortable id and writes the row with `status = RUNNING`,
    /// an empty timeline, and `retry_count = 0`.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new_run: NewRun,
    ) -> Result<WorkflowRun> {
        let id = generate_run_id();
        let sql = format!(
            "INSERT INTO runloom.workflow_runs \
             (id, workflow_id, resource_id, status, input, timeline, max_retries, \
              timeout_at, cron, timezone, idempotency_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {RUN_COLUMNS}"
        );

        let row: RunRow = sqlx::query_as(&sql)
            .bind(&id)
            .bind(&new_run.workflow_id)
            .bind(&new_run.resource_id)
            .bind(RunStatus::Running.as_str())
            .bind(Json(&new_run.input))
            .bind(Json(Timeline::default()))
            .bind(new_run.max_retries)
            .bind(new_run.timeout_at)
            .bind(&new_run.cron)
            .bind(&new_run.timezone)
            .bind(&new_run.idempotency_key)
            .fetch_one(&mut **tx)
            .await?;

        row.into_run()
    }

    /// Fetch a run, or `None` when the id is absent or the resource id does
    /// not match.
    pub async fn get(
        &self,
        run_id: &str,
        resource_id: Option<&str>,
    ) -> Result<Option<WorkflowRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runloom.workflow_runs \
             WHERE id = $1 AND ($2::text IS NULL OR resource_id = $2)"
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRow::into_run).transpose()
    }

    /// Fetch a run under a row-level exclusive lock.
    ///
    /// The lock is held until the transaction commits or rolls back; any
    /// other dispatcher touching the same run blocks on it.
    pub async fn get_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        run_id: &str,
        resource_id: Option<&str>,
    ) -> Result<Option<WorkflowRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runloom.workflow_runs \
             WHERE id = $1 AND ($2::text IS NULL OR resource_id = $2) \
             FOR UPDATE"
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .bind(resource_id)
            .fetch_optional(&mut **tx)
            .await?;

        row.map(RunRow::into_run).transpose()
    }

    /// The most recent COMPLETED run for a workflow, used by cron context.
    pub async fn get_last_completed(&self, workflow_id: &str) -> Result<Option<WorkflowRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runloom.workflow_runs \
             WHERE workflow_id = $1 AND status = 'completed' \
             ORDER BY completed_at DESC NULLS LAST \
             LIMIT 1"
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRow::into_run).transpose()
    }

    /// The active (non-terminal) run matching an idempotency key.
    pub async fn get_active_by_idempotency(
        &self,
        workflow_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runloom.workflow_runs \
             WHERE workflow_id = $1 AND idempotency_key = $2 \
               AND status IN ('pending', 'running', 'paused') \
             ORDER BY created_at DESC \
             LIMIT 1"
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(workflow_id)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRow::into_run).transpose()
    }

    /// Apply a partial update, bumping `updated_at`.
    ///
    /// Returns the updated row, or `None` when the id is absent or the
    /// resource id does not match.
    pub async fn update(
        &self,
        run_id: &str,
        resource_id: Option<&str>,
        patch: RunPatch,
    ) -> Result<Option<WorkflowRun>> {
        let mut builder = Self::patch_query(run_id, resource_id, &patch);
        let row: Option<RunRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    /// [`PgRunStore::update`] inside the caller's transaction, typically
    /// while holding the row lock taken by [`PgRunStore::get_for_update`].
    pub async fn update_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        run_id: &str,
        resource_id: Option<&str>,
        patch: RunPatch,
    ) -> Result<Option<WorkflowRun>> {
        let mut builder = Self::patch_query(run_id, resource_id, &patch);
        let row: Option<RunRow> = builder
            .build_query_as()
            .fetch_optional(&mut **tx)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    fn patch_query<'a>(
        run_id: &'a str,
        resource_id: Option<&'a str>,
        patch: &'a RunPatch,
    ) -> QueryBuilder<'a, Postgres> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("UPDATE runloom.workflow_runs SET updated_at = now()");

        if let Some(status) = &patch.status {
            builder.push(", status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(output) = &patch.output {
            builder.push(", output = ");
            builder.push_bind(Json(output));
        }
        if let Some(error) = &patch.error {
            builder.push(", error = ");
            builder.push_bind(error.as_deref());
        }
        if let Some(step_id) = &patch.current_step_id {
            builder.push(", current_step_id = ");
            builder.push_bind(step_id.as_str());
        }
        if let Some(timeline) = &patch.timeline {
            builder.push(", timeline = ");
            builder.push_bind(Json(timeline));
        }
        if let Some(paused_at) = &patch.paused_at {
            builder.push(", paused_at = ");
            builder.push_bind(*paused_at);
        }
        if let Some(resumed_at) = &patch.resumed_at {
            builder.push(", resumed_at = ");
            builder.push_bind(*resumed_at);
        }
        if let Some(completed_at) = &patch.completed_at {
            builder.push(", completed_at = ");
            builder.push_bind(*completed_at);
        }
        if let Some(retry_count) = &patch.retry_count {
            builder.push(", retry_count = ");
            builder.push_bind(*retry_count);
        }
        if let Some(job_id) = &patch.job_id {
            builder.push(", job_id = ");
            builder.push_bind(job_id.as_str());
        }

        builder.push(" WHERE id = ");
        builder.push_bind(run_id);
        builder.push(" AND (");
        builder.push_bind(resource_id);
        builder.push("::text IS NULL OR resource_id = ");
        builder.push_bind(resource_id);
        builder.push(")");
        builder.push(" RETURNING ");
        builder.push(RUN_COLUMNS);

        builder
    }

    /// List runs ordered by `created_at DESC` with opaque cursor pagination.
    ///
    /// The cursor is a run id resolved to its `created_at`; one extra row is
    /// fetched to compute `has_more`.
    pub async fn list(&self, filter: RunFilter) -> Result<RunPage> {
        let limit = clamp_limit(filter.limit);

        // Resolve cursors outside the main query.
        let starting_after = match &filter.starting_after {
            Some(id) => Some(self.cursor_position(id).await?),
            None => None,
        };
        let ending_before = match &filter.ending_before {
            Some(id) => Some(self.cursor_position(id).await?),
            None => None,
        };
        let ascending = ending_before.is_some() && starting_after.is_none();

        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM runloom.workflow_runs WHERE 1 = 1"));

        if let Some(resource_id) = &filter.resource_id {
            builder.push(" AND resource_id = ");
            builder.push_bind(resource_id.as_str());
        }
        if let Some(workflow_id) = &filter.workflow_id {
            builder.push(" AND workflow_id = ");
            builder.push_bind(workflow_id.as_str());
        }
        if let Some(statuses) = &filter.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_owned()).collect();
            builder.push(" AND status = ANY(");
            builder.push_bind(statuses);
            builder.push(")");
        }
        if let Some((created_at, id)) = &starting_after {
            builder.push(" AND (created_at, id) < (");
            builder.push_bind(*created_at);
            builder.push(", ");
            builder.push_bind(id.as_str());
            builder.push(")");
        }
        if let Some((created_at, id)) = &ending_before {
            builder.push(" AND (created_at, id) > (");
            builder.push_bind(*created_at);
            builder.push(", ");
            builder.push_bind(id.as_str());
            builder.push(")");
        }

        if ascending {
            builder.push(" ORDER BY created_at ASC, id ASC");
        } else {
            builder.push(" ORDER BY created_at DESC, id DESC");
        }
        builder.push(" LIMIT ");
        builder.push_bind(limit + 1);

        let rows: Vec<RunRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        let has_more = rows.len() as i64 > limit;
        let mut runs = rows
            .into_iter()
            .take(limit as usize)
            .map(RunRow::into_run)
            .collect::<Result<Vec<_>>>()?;
        if ascending {
            // The page was fetched oldest-first to honor the cursor; callers
            // always see newest-first.
            runs.reverse();
        }

        Ok(RunPage { runs, has_more })
    }

    async fn cursor_position(&self, run_id: &str) -> Result<(OffsetDateTime, String)> {
        let row: Option<PgRow> =
            sqlx::query("SELECT created_at, id FROM runloom.workflow_runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else {
            return Err(crate::error::Error::NotFound("pagination cursor run"));
        };
        Ok((row.try_get("created_at")?, row.try_get("id")?))
    }
}
