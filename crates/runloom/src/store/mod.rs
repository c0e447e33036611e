//! Run persistence over PostgreSQL.
//!
//! The store owns the `workflow_runs` table: idempotent migration, CRUD with
//! row-level locking, the cron "last completed" lookup, and cursor-paginated
//! listing. All mutations of a run happen under `SELECT … FOR UPDATE` inside
//! a transaction.

mod postgres;

use serde_json::Value;
use time::OffsetDateTime;

pub use postgres::PgRunStore;
pub(crate) use postgres::IDEMPOTENCY_CONSTRAINT;

use crate::run::{RunStatus, Timeline};

/// Fields for a new run row. Status starts as RUNNING with an empty
/// timeline and `retry_count = 0`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: String,
    pub resource_id: Option<String>,
    pub input: Value,
    pub max_retries: i32,
    pub timeout_at: Option<OffsetDateTime>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Partial update of a run row.
///
/// Unset fields are left untouched; `updated_at` is always bumped.
/// `error` and `paused_at` are nullable, so setting them takes an `Option`
/// (`None` writes SQL NULL).
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub(crate) status: Option<RunStatus>,
    pub(crate) output: Option<Value>,
    pub(crate) error: Option<Option<String>>,
    pub(crate) current_step_id: Option<String>,
    pub(crate) timeline: Option<Timeline>,
    pub(crate) paused_at: Option<Option<OffsetDateTime>>,
    pub(crate) resumed_at: Option<OffsetDateTime>,
    pub(crate) completed_at: Option<OffsetDateTime>,
    pub(crate) retry_count: Option<i32>,
    pub(crate) job_id: Option<String>,
}

impl RunPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn current_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.current_step_id = Some(step_id.into());
        self
    }

    pub fn timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn paused_at(mut self, paused_at: Option<OffsetDateTime>) -> Self {
        self.paused_at = Some(paused_at);
        self
    }

    pub fn resumed_at(mut self, resumed_at: OffsetDateTime) -> Self {
        self.resumed_at = Some(resumed_at);
        self
    }

    pub fn completed_at(mut self, completed_at: OffsetDateTime) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    pub fn retry_count(mut self, retry_count: i32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Filter and pagination parameters for listing runs.
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub resource_id: Option<String>,
    pub workflow_id: Option<String>,
    pub statuses: Option<Vec<RunStatus>>,
    /// Clamped to `1..=100`.
    pub limit: i64,
    /// Run id cursor: rows strictly older (in `created_at DESC` order).
    pub starting_after: Option<String>,
    /// Run id cursor: rows strictly newer.
    pub ending_before: Option<String>,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            resource_id: None,
            workflow_id: None,
            statuses: None,
            limit: 20,
            starting_after: None,
            ending_before: None,
        }
    }
}

/// One page of runs, newest first.
#[derive(Debug, Clone)]
pub struct RunPage {
    pub runs: Vec<crate::run::WorkflowRun>,
    /// More rows exist past this page (detected by over-fetching one row).
    pub has_more: bool,
}

pub(crate) fn clamp_limit(limit: i64) -> i64 {
    limit.max(1).min(100)
}
