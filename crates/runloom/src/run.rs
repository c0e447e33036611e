//! Run records, statuses, and the persisted step timeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use svix_ksuid::{Ksuid, KsuidLike};
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// Event name used by `pause`/`resume`; part of the queue wire protocol and
/// reserved — user events must not collide with it.
pub const PAUSE_EVENT: &str = "__internal_pause";

/// Prefix of the reserved event names used by `wait_until` steps.
pub const WAIT_UNTIL_PREFIX: &str = "__wait_until_";

/// Generate an externally visible run id.
///
/// K-sortable: ids created later sort later, which makes `created_at`
/// cursors stable. Exposed as `run_` + 27-char base62 KSUID.
pub fn generate_run_id() -> String {
    format!("run_{}", Ksuid::new(None, None))
}

/// Lifecycle state of a workflow run.
///
/// Transitions follow `PENDING? → RUNNING → (PAUSED ↔ RUNNING)* →
/// (COMPLETED | FAILED | CANCELLED)`. COMPLETED and CANCELLED are terminal;
/// FAILED is terminal once retries are exhausted (a mid-retry run is flipped
/// back to RUNNING before its next dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Lowercase string form, as persisted in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the persisted lowercase form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown run status: {other}"))),
        }
    }

    /// COMPLETED, FAILED, or CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wait-for marker payload stored under `"<step_id>-wait-for"` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitFor {
    /// The event that resumes the waiting step.
    pub event_name: String,
    /// Advisory timeout in milliseconds. Persisted and surfaced on reads;
    /// firing it is left to an external sweeper.
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One timeline entry: either a cached step output or a wait-for marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<WaitFor>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// The run-local mapping from step id to cached output, and from
/// `"<step_id>-wait-for"` keys to pause markers.
///
/// Output entries are write-once: once a step has an output it never
/// changes, which is what makes handler replay safe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline(pub BTreeMap<String, TimelineEntry>);

impl Timeline {
    /// Key under which a step's wait-for marker is stored.
    pub fn wait_key(step_id: &str) -> String {
        format!("{step_id}-wait-for")
    }

    /// Cached output for a step, if the step has completed.
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.0.get(step_id).and_then(|entry| entry.output.as_ref())
    }

    /// Wait-for marker for a step, if the run paused on it.
    pub fn wait_marker(&self, step_id: &str) -> Option<&WaitFor> {
        self.0
            .get(&Self::wait_key(step_id))
            .and_then(|entry| entry.wait_for.as_ref())
    }

    /// Record a step output. Write-once: an existing output is never
    /// replaced.
    pub fn record_output(&mut self, step_id: &str, output: Value, timestamp: OffsetDateTime) {
        if self.output(step_id).is_some() {
            return;
        }
        self.0.insert(
            step_id.to_owned(),
            TimelineEntry {
                output: Some(output),
                wait_for: None,
                timestamp,
            },
        );
    }

    /// Record a wait-for marker for a step entering PAUSED.
    pub fn record_wait(&mut self, step_id: &str, wait_for: WaitFor, timestamp: OffsetDateTime) {
        self.0.insert(
            Self::wait_key(step_id),
            TimelineEntry {
                output: None,
                wait_for: Some(wait_for),
                timestamp,
            },
        );
    }

    /// Whether any entry has been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries (outputs and markers).
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A persisted workflow run.
///
/// One row in `workflow_runs`; the single shared mutable resource of the
/// engine. All mutations happen under a row-level exclusive lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    /// K-sortable id, `run_`-prefixed.
    pub id: String,
    /// Id of the workflow definition this run executes.
    pub workflow_id: String,
    /// Opaque tenant/entity scope; never interpreted, only matched.
    pub resource_id: Option<String>,
    pub status: RunStatus,
    pub input: Value,
    /// Handler result; set only when COMPLETED.
    pub output: Option<Value>,
    /// Failure message; set only when FAILED.
    pub error: Option<String>,
    /// The step the handler most recently advanced to.
    pub current_step_id: Option<String>,
    pub timeline: Timeline,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paused_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resumed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timeout_at: Option<OffsetDateTime>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Last queue job that advanced this run, for observability.
    pub job_id: Option<String>,
    /// Cron expression; set only for cron-triggered runs.
    pub cron: Option<String>,
    /// Cron timezone; set only for cron-triggered runs.
    pub timezone: Option<String>,
    pub idempotency_key: Option<String>,
}
