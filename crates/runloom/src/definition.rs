//! Workflow definitions and their builder.
//!
//! A definition pairs a handler with an explicit static step list plus
//! per-definition options (retry policy, cron, concurrency limit, hooks).
//! The step list is a registration argument — it is what progress reporting
//! and duplicate-id detection run against, and its last entry is what the
//! dispatcher checks before completing a run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Flow, WorkflowContext};
use crate::error::{Error, HandlerError, Result};
use crate::hooks::{completion_hook, run_hook, RunOutcome, WorkflowHooks};
use crate::retry::RetryPolicy;
use crate::run::WorkflowRun;

/// The handler function executed (and replayed) on every dispatch.
pub type WorkflowHandler = Arc<
    dyn Fn(WorkflowContext) -> BoxFuture<'static, std::result::Result<Flow, HandlerError>>
        + Send
        + Sync,
>;

/// What a step does when the handler reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    /// Durable unit of work.
    Run,
    /// Wait for an external event.
    WaitFor,
    /// Manual pause, resumed via `resume_workflow`.
    Pause,
    /// Wait until a wall-clock instant.
    WaitUntil,
}

/// One entry of a definition's static step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub id: String,
    pub kind: StepKind,
    /// The handler may skip this step on some inputs.
    #[serde(default)]
    pub conditional: bool,
    /// The step sits inside a loop in the handler's control flow.
    #[serde(default, rename = "loop")]
    pub looped: bool,
    /// The step id is computed at dispatch time.
    #[serde(default, rename = "isDynamic")]
    pub dynamic: bool,
}

impl StepSpec {
    fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            conditional: false,
            looped: false,
            dynamic: false,
        }
    }

    pub fn run(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Run)
    }

    pub fn wait_for(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::WaitFor)
    }

    pub fn pause(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Pause)
    }

    pub fn wait_until(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::WaitUntil)
    }

    pub fn conditional(mut self) -> Self {
        self.conditional = true;
        self
    }

    pub fn looped(mut self) -> Self {
        self.looped = true;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }
}

/// Cron trigger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronConfig {
    pub expression: String,
    pub timezone: String,
}

/// Validates run input before a run row is created.
///
/// The engine never interprets input beyond handing it to this seam; a
/// rejection surfaces as a validation error from `start_workflow`.
pub trait InputSchema: Send + Sync {
    fn validate(&self, input: &Value) -> std::result::Result<(), String>;
}

impl<F> InputSchema for F
where
    F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync,
{
    fn validate(&self, input: &Value) -> std::result::Result<(), String> {
        self(input)
    }
}

/// An immutable workflow definition, shared across dispatcher workers.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub(crate) handler: WorkflowHandler,
    pub steps: Vec<StepSpec>,
    pub(crate) input_schema: Option<Arc<dyn InputSchema>>,
    /// Workflow-level timeout; persisted as `timeout_at` on runs.
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub cron: Option<CronConfig>,
    /// Cap on simultaneously-running dispatches for this workflow.
    pub concurrency: Option<u32>,
    pub(crate) hooks: WorkflowHooks,
}

impl WorkflowDefinition {
    /// Start building a definition.
    pub fn builder(id: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder::new(id)
    }

    /// The id of the final static step, which gates completion.
    pub fn last_step_id(&self) -> Option<&str> {
        self.steps.last().map(|step| step.id.as_str())
    }

    /// Whether dispatches of this workflow route through its own queue.
    pub(crate) fn has_dedicated_queue(&self) -> bool {
        self.cron.is_some() || self.concurrency.is_some()
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("steps", &self.steps)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("cron", &self.cron)
            .field("concurrency", &self.concurrency)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkflowDefinition`].
///
/// # Example
///
/// ```ignore
/// let definition = WorkflowDefinition::builder("invoice")
///     .step(StepSpec::run("charge"))
///     .step(StepSpec::wait_for("settlement"))
///     .retries(3)
///     .handler(|ctx| async move {
///         let Some(charge) = ctx.run("charge", || charge_card()).await?.value() else {
///             return Ok(Flow::Suspended);
///         };
///         let Some(settled) = ctx.wait_for("settlement", "settled", None).await?.value() else {
///             return Ok(Flow::Suspended);
///         };
///         Flow::done(settled)
///     })
///     .build()?;
/// ```
pub struct WorkflowDefinitionBuilder {
    id: String,
    handler: Option<WorkflowHandler>,
    steps: Vec<StepSpec>,
    input_schema: Option<Arc<dyn InputSchema>>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    cron: Option<CronConfig>,
    concurrency: Option<u32>,
    hooks: WorkflowHooks,
}

impl WorkflowDefinitionBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler: None,
            steps: Vec::new(),
            input_schema: None,
            timeout: None,
            retry: RetryPolicy::default(),
            cron: None,
            concurrency: None,
            hooks: WorkflowHooks::default(),
        }
    }

    /// Append one step to the static step list.
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Append several steps to the static step list.
    pub fn steps(mut self, steps: impl IntoIterator<Item = StepSpec>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Set the handler function.
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Flow, HandlerError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Attach an input schema.
    pub fn input_schema(mut self, schema: impl InputSchema + 'static) -> Self {
        self.input_schema = Some(Arc::new(schema));
        self
    }

    /// Workflow-level timeout, persisted as `timeout_at` on each run.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shorthand: N retries with the default backoff.
    pub fn retries(mut self, max_retries: u32) -> Self {
        self.retry = RetryPolicy::retries(max_retries);
        self
    }

    /// Full retry policy; overrides [`Self::retries`].
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Trigger this workflow on a cron schedule, evaluated in UTC.
    pub fn cron(self, expression: impl Into<String>) -> Self {
        self.cron_in_timezone(expression, "UTC")
    }

    /// Trigger this workflow on a cron schedule in the given timezone.
    pub fn cron_in_timezone(
        mut self,
        expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        self.cron = Some(CronConfig {
            expression: expression.into(),
            timezone: timezone.into(),
        });
        self
    }

    /// Cap simultaneous handler dispatches for this workflow.
    pub fn concurrency(mut self, limit: u32) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkflowRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.hooks.on_start = Some(run_hook(f));
        self
    }

    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkflowRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.hooks.on_success = Some(run_hook(f));
        self
    }

    pub fn on_failure<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkflowRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.hooks.on_failure = Some(run_hook(f));
        self
    }

    pub fn on_cancel<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkflowRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.hooks.on_cancel = Some(run_hook(f));
        self
    }

    pub fn on_complete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkflowRun, RunOutcome) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.hooks.on_complete = Some(completion_hook(f));
        self
    }

    /// Set pre-built hook callbacks.
    pub fn hooks(mut self, hooks: WorkflowHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Assemble the definition.
    ///
    /// Requires an id and a handler. Step-list and cron validation happen at
    /// registration.
    pub fn build(self) -> Result<WorkflowDefinition> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("workflow id must not be empty".into()));
        }
        let Some(handler) = self.handler else {
            return Err(Error::Validation(format!(
                "workflow {:?} has no handler",
                self.id
            )));
        };

        Ok(WorkflowDefinition {
            id: self.id,
            handler,
            steps: self.steps,
            input_schema: self.input_schema,
            timeout: self.timeout,
            retry: self.retry,
            cron: self.cron,
            concurrency: self.concurrency,
            hooks: self.hooks,
        })
    }
}
