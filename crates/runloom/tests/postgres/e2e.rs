//! End-to-end lifecycle scenarios against a live engine.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use runloom::{
    Flow, HandlerError, Middleware, Next, RetryPolicy, RunFilter, RunOutcome, RunStatus,
    StartWorkflowRequest, StepSpec, TriggerEventRequest, WorkflowContext, WorkflowDefinition,
};
use serde_json::json;
use test_utils::pg_test;

use crate::support::helpers::{test_engine, wait_for_status, wait_until, DEFAULT_TEST_TIMEOUT};

pg_test!(single_step_run_completes, pool => {
    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("w1")
                .step(StepSpec::run("a"))
                .handler(|ctx| async move {
                    let Some(out) = ctx
                        .run("a", || async { Ok(json!({"n": 7})) })
                        .await?
                        .value()
                    else {
                        return Ok(Flow::Suspended);
                    };
                    Ok(Flow::Done(out))
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("w1", json!({})))
        .await?;
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.id.starts_with("run_"));

    let done = wait_for_status(&engine, &run.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;
    assert_eq!(done.output, Some(json!({"n": 7})));
    assert_eq!(done.timeline.output("a"), Some(&json!({"n": 7})));
    assert!(done.completed_at.is_some());

    let progress = engine.check_progress(&run.id, None).await?;
    assert_eq!(progress.completion_percentage, 100);
    assert_eq!(progress.total_steps, 1);
    assert_eq!(progress.completed_steps, 1);

    engine.stop().await?;
    Ok(())
});

pg_test!(wait_for_event_resumes, pool => {
    let starts = Arc::new(AtomicUsize::new(0));
    let starts_hook = Arc::clone(&starts);

    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("signup")
                .step(StepSpec::run("s1"))
                .step(StepSpec::wait_for("s2"))
                .on_start(move |_run| {
                    let starts = Arc::clone(&starts_hook);
                    async move {
                        starts.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .handler(|ctx| async move {
                    let Some(_r1) = ctx.run("s1", || async { Ok(json!("r1")) }).await?.value()
                    else {
                        return Ok(Flow::Suspended);
                    };
                    let Some(_event) = ctx.wait_for("s2", "e", None).await?.value() else {
                        return Ok(Flow::Suspended);
                    };
                    Ok(Flow::Done(json!("done")))
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("signup", json!({})))
        .await?;

    let paused = wait_for_status(&engine, &run.id, RunStatus::Paused, DEFAULT_TEST_TIMEOUT).await?;
    assert_eq!(paused.timeline.output("s1"), Some(&json!("r1")));
    assert_eq!(paused.current_step_id.as_deref(), Some("s2"));
    let marker = paused.timeline.wait_marker("s2").expect("wait marker");
    assert_eq!(marker.event_name, "e");
    assert!(paused.paused_at.is_some());

    let progress = engine.check_progress(&run.id, None).await?;
    assert_eq!(progress.completion_percentage, 50);

    engine
        .trigger_event(TriggerEventRequest::new(&run.id, "e").data(json!({"ok": true})))
        .await?;

    let done = wait_for_status(&engine, &run.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;
    assert_eq!(done.timeline.output("s2"), Some(&json!({"ok": true})));
    assert_eq!(done.output, Some(json!("done")));
    assert!(done.resumed_at.is_some());

    // Two dispatches, one run: the start hook fired once.
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    engine.stop().await?;
    Ok(())
});

pg_test!(mismatched_event_repauses, pool => {
    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("gatekeeper")
                .step(StepSpec::wait_for("gate"))
                .handler(|ctx| async move {
                    let Some(event) = ctx.wait_for("gate", "open", None).await?.value() else {
                        return Ok(Flow::Suspended);
                    };
                    Ok(Flow::Done(event))
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("gatekeeper", json!({})))
        .await?;
    wait_for_status(&engine, &run.id, RunStatus::Paused, DEFAULT_TEST_TIMEOUT).await?;

    // Wrong event: the dispatch unpauses briefly and re-pauses on replay
    // without writing an output.
    engine
        .trigger_event(TriggerEventRequest::new(&run.id, "wrong").data(json!({"x": 1})))
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let still_paused = engine.get_run(&run.id, None).await?;
    assert_eq!(still_paused.status, RunStatus::Paused);
    assert!(still_paused.timeline.output("gate").is_none());

    // The right event still lands afterwards.
    engine
        .trigger_event(TriggerEventRequest::new(&run.id, "open").data(json!({"go": true})))
        .await?;
    let done = wait_for_status(&engine, &run.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;
    assert_eq!(done.output, Some(json!({"go": true})));

    engine.stop().await?;
    Ok(())
});

pg_test!(retry_until_success, pool => {
    let bodies = Arc::new(AtomicUsize::new(0));
    let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let bodies_handler = Arc::clone(&bodies);
    let stamps_handler = Arc::clone(&stamps);

    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("flaky")
                .step(StepSpec::run("charge"))
                .retry(RetryPolicy {
                    max_retries: 3,
                    factor: 2.0,
                    min_delay: Duration::from_millis(300),
                    max_delay: None,
                    jitter: false,
                })
                .handler(move |ctx| {
                    let bodies = Arc::clone(&bodies_handler);
                    let stamps = Arc::clone(&stamps_handler);
                    async move {
                        let Some(out) = ctx
                            .run("charge", || async move {
                                stamps.lock().unwrap().push(Instant::now());
                                let attempt = bodies.fetch_add(1, Ordering::SeqCst) + 1;
                                if attempt < 3 {
                                    Err("transient outage".into())
                                } else {
                                    Ok(json!("ok"))
                                }
                            })
                            .await?
                            .value()
                        else {
                            return Ok(Flow::Suspended);
                        };
                        Ok(Flow::Done(out))
                    }
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("flaky", json!({})))
        .await?;
    let done = wait_for_status(&engine, &run.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;

    assert_eq!(done.output, Some(json!("ok")));
    assert_eq!(done.retry_count, 2);
    assert!(done.error.is_none());
    assert_eq!(bodies.load(Ordering::SeqCst), 3);

    // Backoff: 300ms before the first retry, 600ms before the second.
    let stamps = stamps.lock().unwrap();
    assert!(stamps[1] - stamps[0] >= Duration::from_millis(300));
    assert!(stamps[2] - stamps[1] >= Duration::from_millis(600));

    engine.stop().await?;
    Ok(())
});

pg_test!(retry_exhaustion_fails_terminally, pool => {
    let bodies = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let completions: Arc<Mutex<Vec<RunOutcome>>> = Arc::new(Mutex::new(Vec::new()));

    let bodies_handler = Arc::clone(&bodies);
    let failures_hook = Arc::clone(&failures);
    let completions_hook = Arc::clone(&completions);

    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("doomed")
                .step(StepSpec::run("boom"))
                .retry(RetryPolicy {
                    max_retries: 2,
                    factor: 2.0,
                    min_delay: Duration::from_millis(200),
                    max_delay: Some(Duration::from_secs(2)),
                    jitter: false,
                })
                .on_failure(move |_run| {
                    let failures = Arc::clone(&failures_hook);
                    async move {
                        failures.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .on_complete(move |_run, outcome| {
                    let completions = Arc::clone(&completions_hook);
                    async move {
                        completions.lock().unwrap().push(outcome);
                        Ok(())
                    }
                })
                .handler(move |ctx| {
                    let bodies = Arc::clone(&bodies_handler);
                    async move {
                        let Some(out) = ctx
                            .run("boom", || async move {
                                bodies.fetch_add(1, Ordering::SeqCst);
                                Err::<serde_json::Value, HandlerError>("payment rejected".into())
                            })
                            .await?
                            .value()
                        else {
                            return Ok(Flow::Suspended);
                        };
                        Ok(Flow::Done(out))
                    }
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("doomed", json!({})))
        .await?;
    let failed = wait_for_status(&engine, &run.id, RunStatus::Failed, DEFAULT_TEST_TIMEOUT).await?;

    // Initial attempt + 2 retries.
    assert_eq!(bodies.load(Ordering::SeqCst), 3);
    assert_eq!(failed.retry_count, 2);
    assert_eq!(failed.max_retries, 2);
    let error = failed.error.expect("failure message recorded");
    assert!(error.contains("payment rejected"), "error was: {error}");

    // Hooks fired exactly once, with the failing outcome.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].ok());

    engine.stop().await?;
    Ok(())
});

pg_test!(zero_retries_fail_on_first_error, pool => {
    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("fragile")
                .step(StepSpec::run("only"))
                .handler(|ctx| async move {
                    let Some(out) = ctx
                        .run("only", || async {
                            Err::<serde_json::Value, HandlerError>("nope".into())
                        })
                        .await?
                        .value()
                    else {
                        return Ok(Flow::Suspended);
                    };
                    Ok(Flow::Done(out))
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("fragile", json!({})))
        .await?;
    let failed = wait_for_status(&engine, &run.id, RunStatus::Failed, DEFAULT_TEST_TIMEOUT).await?;
    assert_eq!(failed.retry_count, 0);

    engine.stop().await?;
    Ok(())
});

pg_test!(idempotency_key_returns_active_run, pool => {
    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("onboarding")
                .step(StepSpec::pause("review"))
                .handler(|ctx| async move {
                    let Some(_) = ctx.pause("review").await?.value() else {
                        return Ok(Flow::Suspended);
                    };
                    Ok(Flow::Done(json!({})))
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let first = engine
        .start_workflow(StartWorkflowRequest::new("onboarding", json!({})).idempotency_key("k"))
        .await?;
    wait_for_status(&engine, &first.id, RunStatus::Paused, DEFAULT_TEST_TIMEOUT).await?;

    // Same key while the first run is active: same run back, unchanged.
    let second = engine
        .start_workflow(StartWorkflowRequest::new("onboarding", json!({})).idempotency_key("k"))
        .await?;
    assert_eq!(second.id, first.id);

    // Once the first is terminal the key is free again.
    engine.cancel_workflow(&first.id, None).await?;
    let third = engine
        .start_workflow(StartWorkflowRequest::new("onboarding", json!({})).idempotency_key("k"))
        .await?;
    assert_ne!(third.id, first.id);

    engine.stop().await?;
    Ok(())
});

pg_test!(concurrency_limit_respected, pool => {
    let in_flight = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));

    let in_flight_handler = Arc::clone(&in_flight);
    let peak_handler = Arc::clone(&peak);

    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("serialized")
                .step(StepSpec::run("slow"))
                .concurrency(1)
                .handler(move |ctx| {
                    let in_flight = Arc::clone(&in_flight_handler);
                    let peak = Arc::clone(&peak_handler);
                    async move {
                        let Some(out) = ctx
                            .run("slow", || async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(300)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok(json!({}))
                            })
                            .await?
                            .value()
                        else {
                            return Ok(Flow::Suspended);
                        };
                        Ok(Flow::Done(out))
                    }
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let mut runs = Vec::new();
    for _ in 0..3 {
        runs.push(
            engine
                .start_workflow(StartWorkflowRequest::new("serialized", json!({})))
                .await?,
        );
    }
    for run in &runs {
        wait_for_status(&engine, &run.id, RunStatus::Completed, Duration::from_secs(30)).await?;
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1, "handler bodies overlapped");

    engine.stop().await?;
    Ok(())
});

pg_test!(wait_until_resumes_after_instant, pool => {
    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("napper")
                .step(StepSpec::wait_until("nap"))
                .step(StepSpec::run("after"))
                .handler(|ctx| async move {
                    let wake_at = time::OffsetDateTime::now_utc() + Duration::from_millis(800);
                    let Some(woke) = ctx.wait_until("nap", wake_at).await?.value() else {
                        return Ok(Flow::Suspended);
                    };
                    let Some(out) = ctx
                        .run("after", || async move { Ok(woke) })
                        .await?
                        .value()
                    else {
                        return Ok(Flow::Suspended);
                    };
                    Ok(Flow::Done(out))
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("napper", json!({})))
        .await?;

    let paused = wait_for_status(&engine, &run.id, RunStatus::Paused, DEFAULT_TEST_TIMEOUT).await?;
    let marker = paused.timeline.wait_marker("nap").expect("wait marker");
    assert!(marker.event_name.starts_with("__wait_until_"));

    // The queue's delayed delivery is the timer.
    let done = wait_for_status(&engine, &run.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;
    let woke = done.timeline.output("nap").expect("wait_until output");
    assert!(woke.get("date").is_some());

    engine.stop().await?;
    Ok(())
});

pg_test!(manual_resume_matches_trigger_event, pool => {
    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("approval")
                .step(StepSpec::pause("sign-off"))
                .handler(|ctx| async move {
                    let Some(ack) = ctx.pause("sign-off").await?.value() else {
                        return Ok(Flow::Suspended);
                    };
                    Ok(Flow::Done(ack))
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    // Resumed through resume_workflow.
    let first = engine
        .start_workflow(StartWorkflowRequest::new("approval", json!({})))
        .await?;
    wait_for_status(&engine, &first.id, RunStatus::Paused, DEFAULT_TEST_TIMEOUT).await?;
    engine.resume_workflow(&first.id, None).await?;
    let first = wait_for_status(&engine, &first.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;

    // Resumed through the equivalent internal event.
    let second = engine
        .start_workflow(StartWorkflowRequest::new("approval", json!({})))
        .await?;
    wait_for_status(&engine, &second.id, RunStatus::Paused, DEFAULT_TEST_TIMEOUT).await?;
    engine
        .trigger_event(TriggerEventRequest::new(&second.id, runloom::PAUSE_EVENT))
        .await?;
    let second = wait_for_status(&engine, &second.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;

    // Observationally identical.
    assert_eq!(first.output, second.output);
    assert_eq!(
        first.timeline.output("sign-off"),
        second.timeline.output("sign-off")
    );

    engine.stop().await?;
    Ok(())
});

pg_test!(cancellation_short_circuits_next_step, pool => {
    let after_bodies = Arc::new(AtomicUsize::new(0));
    let cancels = Arc::new(AtomicUsize::new(0));

    let after_handler = Arc::clone(&after_bodies);
    let cancels_hook = Arc::clone(&cancels);

    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("doomed-journey")
                .step(StepSpec::run("slow"))
                .step(StepSpec::run("after"))
                .on_cancel(move |_run| {
                    let cancels = Arc::clone(&cancels_hook);
                    async move {
                        cancels.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .handler(move |ctx| {
                    let after_bodies = Arc::clone(&after_handler);
                    async move {
                        let Some(_slow) = ctx
                            .run("slow", || async {
                                tokio::time::sleep(Duration::from_millis(600)).await;
                                Ok(json!({}))
                            })
                            .await?
                            .value()
                        else {
                            return Ok(Flow::Suspended);
                        };
                        let Some(out) = ctx
                            .run("after", || async move {
                                after_bodies.fetch_add(1, Ordering::SeqCst);
                                Ok(json!({}))
                            })
                            .await?
                            .value()
                        else {
                            return Ok(Flow::Suspended);
                        };
                        Ok(Flow::Done(out))
                    }
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("doomed-journey", json!({})))
        .await?;

    // Cancel while the first step body is in flight. Nothing interrupts the
    // body; the next step boundary stands down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancelled = engine.cancel_workflow(&run.id, None).await?;
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(900)).await;
    let still = engine.get_run(&run.id, None).await?;
    assert_eq!(still.status, RunStatus::Cancelled);
    assert_eq!(after_bodies.load(Ordering::SeqCst), 0);
    assert_eq!(cancels.load(Ordering::SeqCst), 1);

    engine.stop().await?;
    Ok(())
});

pg_test!(cron_materializes_runs_with_schedule_context, pool => {
    // (saw a schedule, saw a prior completion timestamp)
    let contexts: Arc<Mutex<Vec<(bool, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let contexts_handler = Arc::clone(&contexts);

    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("heartbeat")
                .step(StepSpec::run("beat"))
                .cron("* * * * * *")
                .handler(move |ctx| {
                    let contexts = Arc::clone(&contexts_handler);
                    async move {
                        contexts.lock().unwrap().push((
                            ctx.schedule().is_some(),
                            ctx.schedule().and_then(|s| s.last_timestamp).is_some(),
                        ));
                        let Some(out) = ctx.run("beat", || async { Ok(json!({})) }).await?.value()
                        else {
                            return Ok(Flow::Suspended);
                        };
                        Ok(Flow::Done(out))
                    }
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    // A cron fire materializes a run that completes like any other.
    let first = wait_until(Duration::from_secs(20), "first cron run", || {
        let engine = engine.clone();
        async move {
            let page = engine
                .get_runs(RunFilter {
                    workflow_id: Some("heartbeat".into()),
                    statuses: Some(vec![RunStatus::Completed]),
                    limit: 10,
                    ..Default::default()
                })
                .await?;
            Ok(page.runs.into_iter().next())
        }
    })
    .await?;

    assert_eq!(first.cron.as_deref(), Some("* * * * * *"));
    assert_eq!(first.timezone.as_deref(), Some("UTC"));
    assert_eq!(first.input, json!({}));

    // A later fire sees the prior completion in its schedule context.
    wait_until(Duration::from_secs(20), "schedule with last timestamp", || {
        let contexts = Arc::clone(&contexts);
        async move {
            let contexts = contexts.lock().unwrap();
            Ok(contexts.iter().any(|(_, has_last)| *has_last).then_some(()))
        }
    })
    .await?;

    {
        let contexts = contexts.lock().unwrap();
        assert!(
            contexts.iter().all(|(has_schedule, _)| *has_schedule),
            "cron runs always carry a schedule context"
        );
        assert!(
            !contexts.first().map(|(_, has_last)| *has_last).unwrap_or(true),
            "the first trigger has no prior completion"
        );
    }

    engine.stop().await?;
    Ok(())
});

struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Middleware for Recorder {
    async fn handle(
        &self,
        ctx: &WorkflowContext,
        next: Next<'_>,
    ) -> std::result::Result<Flow, HandlerError> {
        self.log.lock().unwrap().push(format!("{}:before", self.name));
        let flow = next.run(ctx).await;
        self.log.lock().unwrap().push(format!("{}:after", self.name));
        flow
    }
}

pg_test!(middleware_wraps_handler_in_order, pool => {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_handler = Arc::clone(&log);

    let engine = test_engine(pool);
    engine.add_middleware(Arc::new(Recorder {
        name: "outer",
        log: Arc::clone(&log),
    }));
    engine.add_middleware(Arc::new(Recorder {
        name: "inner",
        log: Arc::clone(&log),
    }));

    engine
        .register_workflow(
            WorkflowDefinition::builder("observed")
                .step(StepSpec::run("only"))
                .handler(move |ctx| {
                    let log = Arc::clone(&log_handler);
                    async move {
                        let Some(out) = ctx
                            .run("only", || async move {
                                log.lock().unwrap().push("handler".into());
                                Ok(json!({}))
                            })
                            .await?
                            .value()
                        else {
                            return Ok(Flow::Suspended);
                        };
                        Ok(Flow::Done(out))
                    }
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("observed", json!({})))
        .await?;
    wait_for_status(&engine, &run.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;

    let log = log.lock().unwrap();
    assert_eq!(
        log.as_slice(),
        [
            "outer:before",
            "inner:before",
            "handler",
            "inner:after",
            "outer:after"
        ]
    );

    engine.stop().await?;
    Ok(())
});

struct Gate {
    open: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Middleware for Gate {
    async fn handle(
        &self,
        ctx: &WorkflowContext,
        next: Next<'_>,
    ) -> std::result::Result<Flow, HandlerError> {
        if !self.open.load(Ordering::SeqCst) {
            // Not calling `next` suppresses the handler entirely.
            return Ok(Flow::Suspended);
        }
        next.run(ctx).await
    }
}

pg_test!(middleware_can_suppress_handler, pool => {
    let open = Arc::new(AtomicBool::new(false));
    let bodies = Arc::new(AtomicUsize::new(0));
    let bodies_handler = Arc::clone(&bodies);

    let engine = test_engine(pool);
    engine.add_middleware(Arc::new(Gate {
        open: Arc::clone(&open),
    }));
    engine
        .register_workflow(
            WorkflowDefinition::builder("gated")
                .step(StepSpec::run("only"))
                .handler(move |ctx| {
                    let bodies = Arc::clone(&bodies_handler);
                    async move {
                        let Some(out) = ctx
                            .run("only", || async move {
                                bodies.fetch_add(1, Ordering::SeqCst);
                                Ok(json!({}))
                            })
                            .await?
                            .value()
                        else {
                            return Ok(Flow::Suspended);
                        };
                        Ok(Flow::Done(out))
                    }
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(StartWorkflowRequest::new("gated", json!({})))
        .await?;

    // Suppressed: the dispatch ends without touching the handler and the
    // run stays RUNNING.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.get_run(&run.id, None).await?.status, RunStatus::Running);
    assert_eq!(bodies.load(Ordering::SeqCst), 0);

    // A later dispatch with the gate open goes through.
    open.store(true, Ordering::SeqCst);
    engine
        .trigger_event(TriggerEventRequest::new(&run.id, "poke"))
        .await?;
    wait_for_status(&engine, &run.id, RunStatus::Completed, DEFAULT_TEST_TIMEOUT).await?;
    assert_eq!(bodies.load(Ordering::SeqCst), 1);

    engine.stop().await?;
    Ok(())
});

pg_test!(resource_id_scopes_access, pool => {
    let engine = test_engine(pool);
    engine
        .register_workflow(
            WorkflowDefinition::builder("tenant-scoped")
                .step(StepSpec::pause("hold"))
                .handler(|ctx| async move {
                    let Some(_) = ctx.pause("hold").await?.value() else {
                        return Ok(Flow::Suspended);
                    };
                    Ok(Flow::Done(json!({})))
                })
                .build()?,
        )
        .await?;
    engine.start(true).await?;

    let run = engine
        .start_workflow(
            StartWorkflowRequest::new("tenant-scoped", json!({})).resource_id("tenant-a"),
        )
        .await?;
    wait_for_status(&engine, &run.id, RunStatus::Paused, DEFAULT_TEST_TIMEOUT).await?;

    // Wrong or missing tenant: not found.
    assert!(engine.get_run(&run.id, Some("tenant-b")).await.is_err());
    assert!(engine.get_run(&run.id, Some("tenant-a")).await.is_ok());

    // Listing scoped by resource.
    let page = engine
        .get_runs(RunFilter {
            resource_id: Some("tenant-b".into()),
            ..Default::default()
        })
        .await?;
    assert!(page.runs.is_empty());

    engine.stop().await?;
    Ok(())
});
