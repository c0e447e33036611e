//! Dispatch loop: consumes queue jobs, replays handlers, applies the retry
//! policy.
//!
//! Every "advance this run" job funnels through [`Dispatcher::process`]:
//! initial dispatches, event deliveries, manual resumes, wait-until wakeups,
//! and retries. One dispatch loads the run, resolves its paused state
//! against the incoming event, replays the handler through the middleware
//! pipeline, and then either completes the run, schedules a retry, or marks
//! it terminally failed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::context::{Flow, ScheduleContext, WorkflowContext};
use crate::definition::WorkflowDefinition;
use crate::error::{error_chain, Error, HandlerError, Result};
use crate::hooks::{fire_completion_hook, fire_run_hook, RunOutcome};
use crate::middleware::{Middleware, Next};
use crate::queue::{Job, JobHandler, JobQueue, SendOptions, WORKFLOW_RUN_QUEUE};
use crate::registry::WorkflowRegistry;
use crate::run::RunStatus;
use crate::store::{PgRunStore, RunPatch};

/// Payload of an "advance this run" job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJob {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub workflow_id: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<RunEvent>,
}

/// Event carried by a dispatch, matched against a paused run's wait-for
/// marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Queue a definition's run dispatches route through.
///
/// Concurrency-limited workflows get their own queue so queue-level caps
/// apply to every dispatch, retries and event resumptions included.
pub(crate) fn dispatch_queue_name(definition: &WorkflowDefinition) -> String {
    if definition.concurrency.is_some() {
        definition.id.clone()
    } else {
        WORKFLOW_RUN_QUEUE.to_owned()
    }
}

pub(crate) struct Dispatcher {
    pub(crate) store: PgRunStore,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) registry: Arc<WorkflowRegistry>,
    pub(crate) middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    pub(crate) job_expire_seconds: u64,
}

impl Dispatcher {
    /// Queue handler processing each job of a batch in order.
    pub(crate) fn job_handler(self: Arc<Self>) -> JobHandler {
        let dispatcher = self;
        Arc::new(move |jobs| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                for job in &jobs {
                    dispatcher
                        .process(job)
                        .await
                        .map_err(|e| -> HandlerError { Box::new(e) })?;
                }
                Ok(())
            })
        })
    }

    /// Run one dispatch.
    pub(crate) async fn process(&self, job: &Job) -> Result<()> {
        let run_job: RunJob = serde_json::from_value(job.payload.clone())?;
        let resource_id = run_job.resource_id.as_deref();

        // Poison job: the run row cannot be found. Raise so the queue
        // records the failure.
        let Some(run) = self.store.get(&run_job.run_id, resource_id).await? else {
            error!(run_id = %run_job.run_id, job_id = %job.id, "dispatch for unknown run");
            return Err(Error::NotFound("workflow run"));
        };
        if run.status == RunStatus::Cancelled {
            debug!(run_id = %run.id, "run cancelled, dropping dispatch");
            return Ok(());
        }

        // Definition no longer registered: also poison.
        let Some(definition) = self.registry.get(&run.workflow_id) else {
            error!(run_id = %run.id, workflow_id = %run.workflow_id, "dispatch for unregistered workflow");
            return Err(Error::UnknownWorkflow(run.workflow_id.clone()));
        };

        self.store
            .update(&run.id, resource_id, RunPatch::new().job_id(job.id.to_string()))
            .await?;

        let schedule = match &run.cron {
            Some(_) => {
                let last = self.store.get_last_completed(&run.workflow_id).await?;
                Some(ScheduleContext {
                    timestamp: run.created_at,
                    last_timestamp: last.and_then(|prior| prior.completed_at),
                    timezone: run.timezone.clone().unwrap_or_else(|| "UTC".to_owned()),
                })
            }
            None => None,
        };

        if run.status == RunStatus::Paused {
            self.resume_paused(&run.id, resource_id, run_job.event.as_ref())
                .await?;
        }

        let Some(run) = self.store.get(&run.id, resource_id).await? else {
            return Err(Error::NotFound("workflow run"));
        };

        // First dispatch of a fresh run: nothing recorded, never resumed,
        // never retried.
        if run.retry_count == 0 && run.timeline.is_empty() && run.resumed_at.is_none() {
            fire_run_hook("on_start", &definition.hooks.on_start, &run).await;
        }

        let ctx = WorkflowContext::new(
            run.id.clone(),
            run.workflow_id.clone(),
            run.resource_id.clone(),
            run.input.clone(),
            run.timeline.clone(),
            schedule,
            self.store.clone(),
            Arc::clone(&self.queue),
            dispatch_queue_name(&definition),
            self.job_expire_seconds,
        );

        debug!(run_id = %run.id, workflow_id = %run.workflow_id, job_id = %job.id, "dispatching handler");
        let flow = Next::new(&self.middlewares, &definition.handler)
            .run(&ctx)
            .await;

        match flow {
            Ok(flow) => {
                self.finish_dispatch(&definition, &run.id, resource_id, flow)
                    .await
            }
            Err(cause) => {
                self.handle_failure(&definition, &run.id, resource_id, job, cause)
                    .await
            }
        }
    }

    /// Resolve a dispatch arriving at a PAUSED run.
    ///
    /// A matching event writes the waiting step's output and resumes; a
    /// mismatched (or absent) event still flips to RUNNING so the handler
    /// replays, but writes nothing — the replay re-enters PAUSED.
    async fn resume_paused(
        &self,
        run_id: &str,
        resource_id: Option<&str>,
        event: Option<&RunEvent>,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let Some(run) = self.store.get_for_update(&mut tx, run_id, resource_id).await? else {
            return Err(Error::NotFound("workflow run"));
        };
        if run.status != RunStatus::Paused {
            // Raced with another dispatch; nothing to resolve.
            return Ok(());
        }

        let now = OffsetDateTime::now_utc();
        let waiting_step = run.current_step_id.as_deref();
        let marker_event = waiting_step
            .and_then(|step| run.timeline.wait_marker(step))
            .map(|marker| marker.event_name.clone());
        let matched = matches!(
            (event, marker_event.as_deref()),
            (Some(event), Some(marker)) if event.name == marker
        );

        let mut patch = RunPatch::new()
            .status(RunStatus::Running)
            .paused_at(None)
            .resumed_at(now);

        match (matched, waiting_step) {
            (true, Some(step_id)) => {
                let data = event
                    .and_then(|event| event.data.clone())
                    .unwrap_or_else(|| json!({}));
                let mut timeline = run.timeline.clone();
                timeline.record_output(step_id, data, now);
                patch = patch.timeline(timeline);
                debug!(run_id, step = step_id, "event matched wait marker, resuming");
            }
            _ => {
                debug!(run_id, "dispatch for paused run without matching event; replay will re-pause");
            }
        }

        self.store.update_tx(&mut tx, run_id, resource_id, patch).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Complete the run if this dispatch finished the last static step.
    async fn finish_dispatch(
        &self,
        definition: &WorkflowDefinition,
        run_id: &str,
        resource_id: Option<&str>,
        flow: Flow,
    ) -> Result<()> {
        let Flow::Done(output) = flow else {
            // Suspended mid-handler: the dispatch simply ends.
            return Ok(());
        };

        let mut tx = self.store.begin().await?;
        let Some(run) = self.store.get_for_update(&mut tx, run_id, resource_id).await? else {
            return Err(Error::NotFound("workflow run"));
        };

        let reached_last = match (definition.last_step_id(), run.current_step_id.as_deref()) {
            (Some(last), Some(current)) => last == current,
            _ => false,
        };
        if run.status != RunStatus::Running || !reached_last {
            // Paused or cancelled mid-dispatch, or the handler skipped the
            // final step on this input.
            return Ok(());
        }

        let output = if output.is_null() { json!({}) } else { output };
        let completed = self
            .store
            .update_tx(
                &mut tx,
                run_id,
                resource_id,
                RunPatch::new()
                    .status(RunStatus::Completed)
                    .output(output.clone())
                    .completed_at(OffsetDateTime::now_utc()),
            )
            .await?
            .ok_or(Error::NotFound("workflow run"))?;
        tx.commit().await?;

        info!(run_id = %completed.id, workflow_id = %completed.workflow_id, "run completed");
        fire_run_hook("on_success", &definition.hooks.on_success, &completed).await;
        fire_completion_hook(
            &definition.hooks.on_complete,
            &completed,
            RunOutcome::Completed { output },
        )
        .await;
        Ok(())
    }

    /// Apply the retry policy after a failed dispatch.
    async fn handle_failure(
        &self,
        definition: &WorkflowDefinition,
        run_id: &str,
        resource_id: Option<&str>,
        job: &Job,
        cause: HandlerError,
    ) -> Result<()> {
        let message = error_chain(&*cause);

        let mut tx = self.store.begin().await?;
        let Some(run) = self.store.get_for_update(&mut tx, run_id, resource_id).await? else {
            return Err(Error::NotFound("workflow run"));
        };
        if matches!(run.status, RunStatus::Completed | RunStatus::Cancelled) {
            // A late failure never overwrites a terminal status.
            return Ok(());
        }

        if run.retry_count < run.max_retries {
            let retry_count = run.retry_count + 1;
            // The run stays live between attempts: flip back to RUNNING and
            // clear the failure the step facade recorded.
            self.store
                .update_tx(
                    &mut tx,
                    run_id,
                    resource_id,
                    RunPatch::new()
                        .status(RunStatus::Running)
                        .error(None)
                        .retry_count(retry_count),
                )
                .await?;
            tx.commit().await?;

            let delay = definition.retry.delay(retry_count as u32);
            let start_after = OffsetDateTime::now_utc() + delay;
            self.queue
                .send(
                    &dispatch_queue_name(definition),
                    job.payload.clone(),
                    SendOptions::delayed(start_after).expire_in_seconds(self.job_expire_seconds),
                )
                .await?;

            info!(
                run_id,
                retry = retry_count,
                max_retries = run.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "handler failed, retry scheduled"
            );
            Ok(())
        } else {
            let failed = self
                .store
                .update_tx(
                    &mut tx,
                    run_id,
                    resource_id,
                    RunPatch::new()
                        .status(RunStatus::Failed)
                        .error(Some(message.clone())),
                )
                .await?
                .ok_or(Error::NotFound("workflow run"))?;
            tx.commit().await?;

            error!(
                run_id,
                workflow_id = %failed.workflow_id,
                error = %message,
                "run failed, retries exhausted"
            );
            fire_run_hook("on_failure", &definition.hooks.on_failure, &failed).await;
            fire_completion_hook(
                &definition.hooks.on_complete,
                &failed,
                RunOutcome::Failed {
                    error: message.clone(),
                },
            )
            .await;

            // Rethrow so the queue records the delivery as failed.
            Err(Error::RunFailed {
                workflow_id: failed.workflow_id.clone(),
                run_id: failed.id.clone(),
                cause: message,
            })
        }
    }
}
