//! The step facade: durable primitives handlers drive a run with.
//!
//! Every mutation here happens under the run's row lock, but a step body
//! executes *between* transactions so long-running work never holds a lock.
//! The sequence for `run` is:
//!
//! 1. Lock the row. Short-circuit if the run is CANCELLED, PAUSED, or
//!    FAILED; return the cached output if the step already completed.
//! 2. Record `current_step_id` and commit.
//! 3. Execute the body with no lock held.
//! 4. Reopen a transaction and merge the output into the timeline
//!    (write-once), or mark the run FAILED and propagate.
//!
//! `wait_for`/`pause`/`wait_until` never block: they flip the run to PAUSED,
//! write the wait-for marker, and return [`StepOutcome::Suspended`] so the
//! handler can exit naturally. The dispatcher observes the PAUSED row and
//! ends the dispatch without completing the run.

use std::future::Future;

use serde_json::{json, Value};
use sqlx::{Postgres, Transaction};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::context::{StepOutcome, WorkflowContext};
use crate::dispatcher::{RunEvent, RunJob};
use crate::error::{error_chain, Error, HandlerError, Result};
use crate::queue::SendOptions;
use crate::run::{RunStatus, WaitFor, PAUSE_EVENT, WAIT_UNTIL_PREFIX};
use crate::store::RunPatch;

/// Statuses that make an in-flight dispatch stand down at the next step
/// boundary. Cancellation is cooperative: nothing interrupts a running body,
/// but the following step call lands here.
fn short_circuits(status: RunStatus) -> bool {
    matches!(
        status,
        RunStatus::Cancelled | RunStatus::Paused | RunStatus::Failed
    )
}

/// `undefined`-like results are normalized to `{}` so that "present with no
/// value" is indistinguishable from "absent".
fn normalize_output(value: Value) -> Value {
    if value.is_null() {
        json!({})
    } else {
        value
    }
}

enum WaitEntry {
    /// The event already arrived; this is a replay.
    CacheHit(Value),
    /// Terminal or already-paused run; stand down.
    ShortCircuit,
    /// Freshly paused. The transaction still holds the row lock so callers
    /// can attach more work before committing.
    Paused(Transaction<'static, Postgres>),
}

impl WorkflowContext {
    /// Execute a durable unit of work.
    ///
    /// The body runs at most once to success: replays serve the cached
    /// output without re-invoking it. A body error marks the run FAILED and
    /// propagates so the dispatcher can apply the retry policy.
    pub async fn run<F, Fut>(&self, step_id: &str, body: F) -> Result<StepOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send,
    {
        let inner = &self.inner;
        let resource_id = inner.resource_id.as_deref();

        {
            let mut tx = inner.store.begin().await?;
            let Some(run) = inner
                .store
                .get_for_update(&mut tx, &inner.run_id, resource_id)
                .await?
            else {
                return Err(Error::NotFound("workflow run"));
            };

            if short_circuits(run.status) {
                return Ok(StepOutcome::Suspended);
            }
            if let Some(output) = run.timeline.output(step_id) {
                return Ok(StepOutcome::Advanced(output.clone()));
            }

            inner
                .store
                .update_tx(
                    &mut tx,
                    &inner.run_id,
                    resource_id,
                    RunPatch::new().current_step_id(step_id),
                )
                .await?;
            tx.commit().await?;
        }

        debug!(run_id = %inner.run_id, step_id, "executing step body");
        match body().await {
            Ok(value) => {
                let value = normalize_output(value);
                let mut tx = inner.store.begin().await?;
                let Some(run) = inner
                    .store
                    .get_for_update(&mut tx, &inner.run_id, resource_id)
                    .await?
                else {
                    return Err(Error::NotFound("workflow run"));
                };

                let mut timeline = run.timeline;
                timeline.record_output(step_id, value.clone(), OffsetDateTime::now_utc());
                inner
                    .store
                    .update_tx(
                        &mut tx,
                        &inner.run_id,
                        resource_id,
                        RunPatch::new().timeline(timeline),
                    )
                    .await?;
                tx.commit().await?;

                Ok(StepOutcome::Advanced(value))
            }
            Err(cause) => {
                let message = error_chain(&*cause);
                debug!(run_id = %inner.run_id, step_id, error = %message, "step body failed");

                let mut tx = inner.store.begin().await?;
                if let Some(run) = inner
                    .store
                    .get_for_update(&mut tx, &inner.run_id, resource_id)
                    .await?
                {
                    // Terminal statuses are never overwritten, even by a
                    // failure that raced with a cancellation.
                    if !matches!(run.status, RunStatus::Completed | RunStatus::Cancelled) {
                        inner
                            .store
                            .update_tx(
                                &mut tx,
                                &inner.run_id,
                                resource_id,
                                RunPatch::new()
                                    .status(RunStatus::Failed)
                                    .error(Some(message.clone())),
                            )
                            .await?;
                    }
                    tx.commit().await?;
                }

                Err(Error::StepFailed {
                    step_id: step_id.to_owned(),
                    run_id: inner.run_id.clone(),
                    message,
                })
            }
        }
    }

    /// Wait for an external event.
    ///
    /// On first reach: flips the run to PAUSED, writes the wait-for marker,
    /// and returns [`StepOutcome::Suspended`]. On replay after the event
    /// arrived: returns the event data as the step output. The `timeout` is
    /// advisory metadata persisted in the marker.
    pub async fn wait_for(
        &self,
        step_id: &str,
        event_name: &str,
        timeout_ms: Option<u64>,
    ) -> Result<StepOutcome> {
        match self.begin_wait(step_id, event_name, timeout_ms).await? {
            WaitEntry::CacheHit(output) => Ok(StepOutcome::Advanced(output)),
            WaitEntry::ShortCircuit => Ok(StepOutcome::Suspended),
            WaitEntry::Paused(tx) => {
                tx.commit().await?;
                Ok(StepOutcome::Suspended)
            }
        }
    }

    /// Pause for a manual resume. Exactly a [`WorkflowContext::wait_for`] on
    /// the internal pause event that `resume_workflow` triggers.
    pub async fn pause(&self, step_id: &str) -> Result<StepOutcome> {
        self.wait_for(step_id, PAUSE_EVENT, None).await
    }

    /// Wait until a wall-clock instant.
    ///
    /// Pauses on a reserved event and enqueues a delayed job carrying that
    /// event at `date` — the queue acts as the timer. The pause and the
    /// delayed enqueue commit atomically.
    pub async fn wait_until(&self, step_id: &str, date: OffsetDateTime) -> Result<StepOutcome> {
        let event_name = format!("{WAIT_UNTIL_PREFIX}{step_id}");

        match self.begin_wait(step_id, &event_name, None).await? {
            WaitEntry::CacheHit(output) => Ok(StepOutcome::Advanced(output)),
            WaitEntry::ShortCircuit => Ok(StepOutcome::Suspended),
            WaitEntry::Paused(mut tx) => {
                let inner = &self.inner;
                let iso = date.format(&Rfc3339).map_err(|e| {
                    Error::Validation(format!("wait_until date is not representable: {e}"))
                })?;
                let payload = serde_json::to_value(RunJob {
                    run_id: inner.run_id.clone(),
                    resource_id: inner.resource_id.clone(),
                    workflow_id: inner.workflow_id.clone(),
                    input: inner.input.clone(),
                    event: Some(RunEvent {
                        name: event_name,
                        data: Some(json!({ "date": iso })),
                    }),
                })?;

                inner
                    .queue
                    .send_tx(
                        &mut tx,
                        &inner.dispatch_queue,
                        payload,
                        SendOptions::delayed(date).expire_in_seconds(inner.job_expire_seconds),
                    )
                    .await?;
                tx.commit().await?;

                debug!(run_id = %inner.run_id, step_id, until = %iso, "run waiting until instant");
                Ok(StepOutcome::Suspended)
            }
        }
    }

    async fn begin_wait(
        &self,
        step_id: &str,
        event_name: &str,
        timeout_ms: Option<u64>,
    ) -> Result<WaitEntry> {
        let inner = &self.inner;
        let resource_id = inner.resource_id.as_deref();

        let mut tx = inner.store.begin().await?;
        let Some(run) = inner
            .store
            .get_for_update(&mut tx, &inner.run_id, resource_id)
            .await?
        else {
            return Err(Error::NotFound("workflow run"));
        };

        if short_circuits(run.status) {
            return Ok(WaitEntry::ShortCircuit);
        }
        if let Some(output) = run.timeline.output(step_id) {
            return Ok(WaitEntry::CacheHit(output.clone()));
        }

        let now = OffsetDateTime::now_utc();
        let mut timeline = run.timeline;
        timeline.record_wait(
            step_id,
            WaitFor {
                event_name: event_name.to_owned(),
                timeout_ms,
            },
            now,
        );
        inner
            .store
            .update_tx(
                &mut tx,
                &inner.run_id,
                resource_id,
                RunPatch::new()
                    .status(RunStatus::Paused)
                    .current_step_id(step_id)
                    .paused_at(Some(now))
                    .timeline(timeline),
            )
            .await?;

        debug!(run_id = %inner.run_id, step_id, event = event_name, "run paused");
        Ok(WaitEntry::Paused(tx))
    }
}
