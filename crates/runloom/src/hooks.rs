//! Lifecycle hooks invoked by the dispatcher.
//!
//! Hooks observe a run's lifecycle; they can never affect it. A hook that
//! fails is logged and swallowed — it does not change the run's status or
//! the dispatcher's retry decisions.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::error::HandlerError;
use crate::run::WorkflowRun;

/// Hook receiving the run snapshot at a lifecycle point.
pub type RunHook =
    Arc<dyn Fn(WorkflowRun) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Hook receiving the terminal outcome of a run.
pub type CompletionHook = Arc<
    dyn Fn(WorkflowRun, RunOutcome) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync,
>;

/// Terminal outcome delivered to `on_complete`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { output: Value },
    Failed { error: String },
}

impl RunOutcome {
    /// `true` for [`RunOutcome::Completed`].
    pub fn ok(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

/// Lifecycle callbacks for a workflow definition.
///
/// `on_start` fires once per run, on its first dispatch. `on_complete`
/// fires exactly once per terminal transition (COMPLETED, or FAILED after
/// retries are exhausted). `on_cancel` fires when `cancel_workflow` lands.
#[derive(Clone, Default)]
pub struct WorkflowHooks {
    pub on_start: Option<RunHook>,
    pub on_success: Option<RunHook>,
    pub on_failure: Option<RunHook>,
    pub on_cancel: Option<RunHook>,
    pub on_complete: Option<CompletionHook>,
}

impl WorkflowHooks {
    pub fn is_empty(&self) -> bool {
        self.on_start.is_none()
            && self.on_success.is_none()
            && self.on_failure.is_none()
            && self.on_cancel.is_none()
            && self.on_complete.is_none()
    }
}

impl std::fmt::Debug for WorkflowHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Wrap an async closure into a [`RunHook`].
pub fn run_hook<F, Fut>(f: F) -> RunHook
where
    F: Fn(WorkflowRun) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |run| Box::pin(f(run)))
}

/// Wrap an async closure into a [`CompletionHook`].
pub fn completion_hook<F, Fut>(f: F) -> CompletionHook
where
    F: Fn(WorkflowRun, RunOutcome) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |run, outcome| Box::pin(f(run, outcome)))
}

/// Invoke a lifecycle hook, logging and swallowing any failure.
pub(crate) async fn fire_run_hook(name: &str, hook: &Option<RunHook>, run: &WorkflowRun) {
    let Some(hook) = hook else { return };
    let hook = Arc::clone(hook);
    if let Err(e) = hook(run.clone()).await {
        warn!(hook = name, run_id = %run.id, error = %e, "lifecycle hook failed");
    }
}

/// Invoke the completion hook, logging and swallowing any failure.
pub(crate) async fn fire_completion_hook(
    hook: &Option<CompletionHook>,
    run: &WorkflowRun,
    outcome: RunOutcome,
) {
    let Some(hook) = hook else { return };
    let hook = Arc::clone(hook);
    if let Err(e) = hook(run.clone(), outcome).await {
        warn!(hook = "on_complete", run_id = %run.id, error = %e, "lifecycle hook failed");
    }
}
