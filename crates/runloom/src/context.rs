//! Execution context handed to workflow handlers.
//!
//! A handler receives a [`WorkflowContext`] on every dispatch and drives the
//! run forward through the step facade (`run`, `wait_for`, `pause`,
//! `wait_until` — implemented in `steps.rs`). Each dispatch is a replay: the
//! handler is called from the top, and step calls either return cached
//! results from the timeline or perform their side effect.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::Result;
use crate::queue::JobQueue;
use crate::run::Timeline;
use crate::store::PgRunStore;

/// Result of a single step call.
///
/// `Suspended` means the dispatch cannot advance past this step right now —
/// the run paused on a wait, or was cancelled/failed out from under the
/// handler. The handler should stop and return [`Flow::Suspended`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step has a result (freshly executed or replayed from the
    /// timeline); the handler continues.
    Advanced(Value),
    /// End of this dispatch; the handler must not perform further work.
    Suspended,
}

impl StepOutcome {
    /// The step value, or `None` when suspended.
    pub fn value(self) -> Option<Value> {
        match self {
            StepOutcome::Advanced(value) => Some(value),
            StepOutcome::Suspended => None,
        }
    }
}

/// What a handler dispatch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// The handler ran to the end of its control flow with this result.
    /// The dispatcher completes the run once the last static step is done.
    Done(Value),
    /// A step suspended; the run stays where it is until the next dispatch.
    Suspended,
}

impl Flow {
    /// Convenience for handlers completing with a serializable value.
    pub fn done<T: Serialize>(value: T) -> Result<Flow> {
        Ok(Flow::Done(serde_json::to_value(value)?))
    }
}

/// Schedule information supplied to cron-triggered runs.
///
/// Absent on API-triggered runs, which is how the read path distinguishes
/// the two.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleContext {
    /// When this fire's run was created.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// `completed_at` of the previous COMPLETED run; `None` on the first
    /// trigger.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_timestamp: Option<OffsetDateTime>,
    pub timezone: String,
}

pub(crate) struct ContextInner {
    pub(crate) run_id: String,
    pub(crate) workflow_id: String,
    pub(crate) resource_id: Option<String>,
    pub(crate) input: Value,
    pub(crate) timeline: Timeline,
    pub(crate) schedule: Option<ScheduleContext>,
    pub(crate) store: PgRunStore,
    pub(crate) queue: Arc<dyn JobQueue>,
    /// Queue that re-dispatches of this run route through (the shared queue,
    /// or the per-workflow queue when the definition is concurrency-limited).
    pub(crate) dispatch_queue: String,
    pub(crate) job_expire_seconds: u64,
}

/// Per-dispatch handler context. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl WorkflowContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: String,
        workflow_id: String,
        resource_id: Option<String>,
        input: Value,
        timeline: Timeline,
        schedule: Option<ScheduleContext>,
        store: PgRunStore,
        queue: Arc<dyn JobQueue>,
        dispatch_queue: String,
        job_expire_seconds: u64,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run_id,
                workflow_id,
                resource_id,
                input,
                timeline,
                schedule,
                store,
                queue,
                dispatch_queue,
                job_expire_seconds,
            }),
        }
    }

    /// The run being dispatched.
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// The workflow definition id.
    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    /// The run's resource scope, if any.
    pub fn resource_id(&self) -> Option<&str> {
        self.inner.resource_id.as_deref()
    }

    /// The run input.
    pub fn input(&self) -> &Value {
        &self.inner.input
    }

    /// The run input deserialized into a concrete type.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.inner.input.clone())?)
    }

    /// Snapshot of the timeline as of the start of this dispatch.
    ///
    /// Step calls consult the live row, not this snapshot; this is for
    /// handler-side introspection only.
    pub fn timeline(&self) -> &Timeline {
        &self.inner.timeline
    }

    /// Schedule context; present only on cron-triggered runs.
    pub fn schedule(&self) -> Option<&ScheduleContext> {
        self.inner.schedule.as_ref()
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("run_id", &self.inner.run_id)
            .field("workflow_id", &self.inner.workflow_id)
            .field("resource_id", &self.inner.resource_id)
            .finish_non_exhaustive()
    }
}
