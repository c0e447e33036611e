//! The engine: public API surface and worker lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::definition::{CronConfig, WorkflowDefinition};
use crate::dispatcher::{dispatch_queue_name, Dispatcher, RunEvent, RunJob};
use crate::error::{Error, HandlerError, Result};
use crate::hooks::fire_run_hook;
use crate::middleware::Middleware;
use crate::progress::{self, RunProgress};
use crate::queue::{JobHandler, JobQueue, PgQueue, SendOptions, WorkOptions, WORKFLOW_RUN_QUEUE};
use crate::registry::WorkflowRegistry;
use crate::run::{RunStatus, WorkflowRun, PAUSE_EVENT};
use crate::store::{NewRun, PgRunStore, RunFilter, RunPage, RunPatch, IDEMPOTENCY_CONSTRAINT};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parallel dispatcher workers on the shared run queue (and on each
    /// per-workflow queue). Default: 3.
    pub worker_count: usize,
    /// `expire_in_seconds` passed to every queue send. Default: 300.
    pub job_expire_seconds: u64,
    /// Queue subscriber polling interval. Default: 500 ms.
    pub polling_interval: Duration,
    /// Jobs claimed per poll. Default: 1.
    pub batch_size: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            job_expire_seconds: 300,
            polling_interval: Duration::from_millis(500),
            batch_size: 1,
        }
    }
}

/// Per-run overrides accepted by [`Engine::start_workflow`].
#[derive(Debug, Clone, Default)]
pub struct StartWorkflowOptions {
    /// Overrides the definition's workflow-level timeout.
    pub timeout: Option<Duration>,
    /// Overrides the definition's retry count.
    pub retries: Option<u32>,
    /// Overrides the engine's job expiration for this run's first dispatch.
    pub expire_in_seconds: Option<u64>,
}

/// Parameters for [`Engine::start_workflow`].
#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    pub workflow_id: String,
    pub resource_id: Option<String>,
    pub input: Value,
    pub idempotency_key: Option<String>,
    pub options: StartWorkflowOptions,
}

impl StartWorkflowRequest {
    pub fn new(workflow_id: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            resource_id: None,
            input,
            idempotency_key: None,
            options: StartWorkflowOptions::default(),
        }
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn options(mut self, options: StartWorkflowOptions) -> Self {
        self.options = options;
        self
    }
}

/// Parameters for [`Engine::trigger_event`].
#[derive(Debug, Clone)]
pub struct TriggerEventRequest {
    pub run_id: String,
    pub resource_id: Option<String>,
    pub event_name: String,
    pub data: Option<Value>,
    pub expire_in_seconds: Option<u64>,
}

impl TriggerEventRequest {
    pub fn new(run_id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            resource_id: None,
            event_name: event_name.into(),
            data: None,
            expire_in_seconds: None,
        }
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

struct EngineInner {
    store: PgRunStore,
    queue: Arc<dyn JobQueue>,
    registry: Arc<WorkflowRegistry>,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    config: EngineConfig,
    started: AtomicBool,
}

/// Durable workflow engine over a single PostgreSQL database.
///
/// Cheap to clone; all clones share the same registry, store, and queue.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(pool, EngineConfig::default());
/// engine.register_workflow(definition).await?;
/// engine.start(true).await?;
///
/// let run = engine
///     .start_workflow(StartWorkflowRequest::new("invoice", json!({"amount": 100})))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine with the built-in Postgres queue on the same pool.
    pub fn new(pool: PgPool, config: EngineConfig) -> Self {
        let queue: Arc<dyn JobQueue> = Arc::new(PgQueue::new(pool.clone()));
        Self::with_queue(pool, queue, config)
    }

    /// Create an engine with a caller-supplied queue adapter.
    pub fn with_queue(pool: PgPool, queue: Arc<dyn JobQueue>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store: PgRunStore::new(pool),
                queue,
                registry: Arc::new(WorkflowRegistry::new()),
                middlewares: Mutex::new(Vec::new()),
                dispatcher: Mutex::new(None),
                config,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// The run store (read access for callers building their own queries).
    pub fn store(&self) -> &PgRunStore {
        &self.inner.store
    }

    /// Append a middleware. Middlewares registered before `start` apply to
    /// every dispatch, in registration order.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner
            .middlewares
            .lock()
            .expect("middleware list poisoned")
            .push(middleware);
    }

    /// Register a workflow definition.
    ///
    /// When called after `start`, a cron/concurrency-limited definition gets
    /// its queue, workers, and schedule wired immediately.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        let definition = self.inner.registry.register(definition)?;
        debug!(workflow_id = %definition.id, "workflow registered");

        if self.inner.started.load(Ordering::SeqCst) && definition.has_dedicated_queue() {
            let dispatcher = self
                .inner
                .dispatcher
                .lock()
                .expect("dispatcher slot poisoned")
                .clone();
            if let Some(dispatcher) = dispatcher {
                self.start_workflow_queue(&definition, &dispatcher).await?;
            }
        }
        Ok(())
    }

    /// Drop a definition from the registry. Persisted runs are untouched;
    /// a registered cron is unscheduled.
    pub async fn unregister_workflow(&self, workflow_id: &str) -> Result<bool> {
        let Some(definition) = self.inner.registry.unregister(workflow_id) else {
            return Ok(false);
        };
        if definition.cron.is_some() {
            self.inner.queue.unschedule(&definition.id).await?;
        }
        Ok(true)
    }

    /// Drop every definition. See [`Engine::unregister_workflow`].
    pub async fn unregister_all_workflows(&self) -> Result<()> {
        for definition in self.inner.registry.unregister_all() {
            if definition.cron.is_some() {
                self.inner.queue.unschedule(&definition.id).await?;
            }
        }
        Ok(())
    }

    /// Migrate the schema and boot the engine.
    ///
    /// With `as_engine = false` the instance serves only the API surface: it
    /// migrates and can create/query/signal runs, but spawns no dispatch
    /// workers and registers no cron schedules.
    pub async fn start(&self, as_engine: bool) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.store.migrate().await?;
        self.inner.queue.migrate().await?;
        self.inner.queue.create_queue(WORKFLOW_RUN_QUEUE, None).await?;

        if !as_engine {
            info!("engine started in client mode");
            return Ok(());
        }

        self.inner.queue.start().await?;

        let middlewares = Arc::new(
            self.inner
                .middlewares
                .lock()
                .expect("middleware list poisoned")
                .clone(),
        );
        let dispatcher = Arc::new(Dispatcher {
            store: self.inner.store.clone(),
            queue: Arc::clone(&self.inner.queue),
            registry: Arc::clone(&self.inner.registry),
            middlewares,
            job_expire_seconds: self.inner.config.job_expire_seconds,
        });
        *self
            .inner
            .dispatcher
            .lock()
            .expect("dispatcher slot poisoned") = Some(Arc::clone(&dispatcher));

        let worker_count = self.inner.config.worker_count.max(1);
        for _ in 0..worker_count {
            self.inner
                .queue
                .work(
                    WORKFLOW_RUN_QUEUE,
                    self.work_options(),
                    Arc::clone(&dispatcher).job_handler(),
                )
                .await?;
        }

        for definition in self.inner.registry.dedicated_queue_definitions() {
            self.start_workflow_queue(&definition, &dispatcher).await?;
        }

        info!(
            workers = worker_count,
            workflows = self.inner.registry.len(),
            "engine started"
        );
        Ok(())
    }

    /// Unschedule crons and drain workers.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        for definition in self.inner.registry.all() {
            if definition.cron.is_some() {
                self.inner.queue.unschedule(&definition.id).await?;
            }
        }
        self.inner.queue.stop().await?;
        info!("engine stopped");
        Ok(())
    }

    fn work_options(&self) -> WorkOptions {
        WorkOptions {
            polling_interval: self.inner.config.polling_interval,
            batch_size: self.inner.config.batch_size,
        }
    }

    /// Create the per-workflow queue, subscribe its workers, and register
    /// its cron.
    async fn start_workflow_queue(
        &self,
        definition: &Arc<WorkflowDefinition>,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<()> {
        self.inner
            .queue
            .create_queue(&definition.id, definition.concurrency)
            .await?;

        let handler = self.workflow_queue_handler(Arc::clone(definition), Arc::clone(dispatcher));
        for _ in 0..self.inner.config.worker_count.max(1) {
            self.inner
                .queue
                .work(&definition.id, self.work_options(), handler.clone())
                .await?;
        }

        if let Some(cron) = &definition.cron {
            self.inner
                .queue
                .schedule(&definition.id, &cron.expression, json!({}), &cron.timezone)
                .await?;
            info!(workflow_id = %definition.id, cron = %cron.expression, tz = %cron.timezone, "cron registered");
        }
        Ok(())
    }

    /// Handler for a per-workflow queue.
    ///
    /// Cron fires carry an empty payload and materialize a new run; run
    /// dispatches (for concurrency-limited workflows) carry a `runId` and go
    /// through the dispatcher.
    fn workflow_queue_handler(
        &self,
        definition: Arc<WorkflowDefinition>,
        dispatcher: Arc<Dispatcher>,
    ) -> JobHandler {
        let engine = self.clone();
        Arc::new(move |jobs| {
            let engine = engine.clone();
            let definition = Arc::clone(&definition);
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                for job in &jobs {
                    if job.payload.get("runId").is_some() {
                        dispatcher.process(job).await.map_err(Into::<HandlerError>::into)?;
                    } else {
                        engine
                            .create_cron_run(&definition)
                            .await
                            .map_err(Into::<HandlerError>::into)?;
                    }
                }
                Ok(())
            })
        })
    }

    async fn create_cron_run(&self, definition: &Arc<WorkflowDefinition>) -> Result<WorkflowRun> {
        let Some(cron) = definition.cron.clone() else {
            return Err(Error::Validation(format!(
                "workflow {:?} is not cron-triggered",
                definition.id
            )));
        };
        self.create_run(
            definition,
            None,
            json!({}),
            None,
            StartWorkflowOptions::default(),
            Some(cron),
        )
        .await
    }

    /// Create a run and enqueue its first dispatch.
    ///
    /// An `idempotency_key` that matches any non-terminal run of the same
    /// workflow returns that run unchanged.
    pub async fn start_workflow(&self, request: StartWorkflowRequest) -> Result<WorkflowRun> {
        let Some(definition) = self.inner.registry.get(&request.workflow_id) else {
            return Err(Error::UnknownWorkflow(request.workflow_id));
        };
        self.create_run(
            &definition,
            request.resource_id,
            request.input,
            request.idempotency_key,
            request.options,
            None,
        )
        .await
    }

    async fn create_run(
        &self,
        definition: &Arc<WorkflowDefinition>,
        resource_id: Option<String>,
        input: Value,
        idempotency_key: Option<String>,
        options: StartWorkflowOptions,
        cron: Option<CronConfig>,
    ) -> Result<WorkflowRun> {
        if definition.steps.is_empty() {
            return Err(Error::Validation(format!(
                "workflow {:?} has an empty step list",
                definition.id
            )));
        }
        if let Some(schema) = &definition.input_schema {
            schema.validate(&input).map_err(|reason| {
                Error::Validation(format!(
                    "input rejected for workflow {:?}: {reason}",
                    definition.id
                ))
            })?;
        }
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self
                .inner
                .store
                .get_active_by_idempotency(&definition.id, key)
                .await?
            {
                debug!(run_id = %existing.id, key = %key, "idempotency key matched an active run");
                return Ok(existing);
            }
        }

        let max_retries = options
            .retries
            .map(|retries| retries as i32)
            .unwrap_or(definition.retry.max_retries as i32);
        let timeout = options.timeout.or(definition.timeout);
        let now = OffsetDateTime::now_utc();

        let new_run = NewRun {
            workflow_id: definition.id.clone(),
            resource_id: resource_id.clone(),
            input: input.clone(),
            max_retries,
            timeout_at: timeout.map(|timeout| now + timeout),
            cron: cron.as_ref().map(|cron| cron.expression.clone()),
            timezone: cron.as_ref().map(|cron| cron.timezone.clone()),
            idempotency_key: idempotency_key.clone(),
        };

        // Row write and first enqueue commit atomically.
        let mut tx = self.inner.store.begin().await?;
        let run = match self.inner.store.insert(&mut tx, new_run).await {
            Ok(run) => run,
            Err(err) if err.is_unique_violation(IDEMPOTENCY_CONSTRAINT) => {
                // Lost a creation race on the idempotency index; return the
                // winner.
                drop(tx);
                let key = idempotency_key.as_deref().unwrap_or_default();
                return self
                    .inner
                    .store
                    .get_active_by_idempotency(&definition.id, key)
                    .await?
                    .ok_or(Error::NotFound("workflow run"));
            }
            Err(err) => return Err(err),
        };

        let payload = serde_json::to_value(RunJob {
            run_id: run.id.clone(),
            resource_id,
            workflow_id: definition.id.clone(),
            input,
            event: None,
        })?;
        let send_options = SendOptions::default().expire_in_seconds(
            options
                .expire_in_seconds
                .unwrap_or(self.inner.config.job_expire_seconds),
        );
        let job_id = self
            .inner
            .queue
            .send_tx(&mut tx, &dispatch_queue_name(definition), payload, send_options)
            .await?;
        let run = self
            .inner
            .store
            .update_tx(&mut tx, &run.id, None, RunPatch::new().job_id(job_id.to_string()))
            .await?
            .ok_or(Error::NotFound("workflow run"))?;
        tx.commit().await?;

        info!(run_id = %run.id, workflow_id = %run.workflow_id, "run created");
        Ok(run)
    }

    /// Manually pause a run between dispatches.
    pub async fn pause_workflow(
        &self,
        run_id: &str,
        resource_id: Option<&str>,
    ) -> Result<WorkflowRun> {
        let mut tx = self.inner.store.begin().await?;
        let Some(run) = self
            .inner
            .store
            .get_for_update(&mut tx, run_id, resource_id)
            .await?
        else {
            return Err(Error::NotFound("workflow run"));
        };
        if run.status == RunStatus::Paused {
            return Ok(run);
        }
        if run.status.is_terminal() {
            return Err(Error::Validation(format!(
                "cannot pause a {} run",
                run.status
            )));
        }

        let paused = self
            .inner
            .store
            .update_tx(
                &mut tx,
                run_id,
                resource_id,
                RunPatch::new()
                    .status(RunStatus::Paused)
                    .paused_at(Some(OffsetDateTime::now_utc())),
            )
            .await?
            .ok_or(Error::NotFound("workflow run"))?;
        tx.commit().await?;

        info!(run_id = %paused.id, "run paused");
        Ok(paused)
    }

    /// Resume a paused run. Observationally identical to triggering the
    /// internal pause event.
    pub async fn resume_workflow(
        &self,
        run_id: &str,
        resource_id: Option<&str>,
    ) -> Result<WorkflowRun> {
        let mut request = TriggerEventRequest::new(run_id, PAUSE_EVENT);
        request.resource_id = resource_id.map(str::to_owned);
        self.trigger_event(request).await
    }

    /// Cancel a run. Terminal runs are returned unchanged; cancellation of
    /// an in-flight dispatch is cooperative (the next step call stands
    /// down).
    pub async fn cancel_workflow(
        &self,
        run_id: &str,
        resource_id: Option<&str>,
    ) -> Result<WorkflowRun> {
        let mut tx = self.inner.store.begin().await?;
        let Some(run) = self
            .inner
            .store
            .get_for_update(&mut tx, run_id, resource_id)
            .await?
        else {
            return Err(Error::NotFound("workflow run"));
        };
        if run.status.is_terminal() {
            return Ok(run);
        }

        let cancelled = self
            .inner
            .store
            .update_tx(
                &mut tx,
                run_id,
                resource_id,
                RunPatch::new().status(RunStatus::Cancelled),
            )
            .await?
            .ok_or(Error::NotFound("workflow run"))?;
        tx.commit().await?;

        info!(run_id = %cancelled.id, "run cancelled");
        if let Some(definition) = self.inner.registry.get(&cancelled.workflow_id) {
            fire_run_hook("on_cancel", &definition.hooks.on_cancel, &cancelled).await;
        }
        Ok(cancelled)
    }

    /// Deliver an event to a run and return its current snapshot.
    ///
    /// The event rides a fresh dispatch job; the dispatcher matches it
    /// against the run's wait-for marker.
    pub async fn trigger_event(&self, request: TriggerEventRequest) -> Result<WorkflowRun> {
        let Some(run) = self
            .inner
            .store
            .get(&request.run_id, request.resource_id.as_deref())
            .await?
        else {
            return Err(Error::NotFound("workflow run"));
        };
        let Some(definition) = self.inner.registry.get(&run.workflow_id) else {
            return Err(Error::UnknownWorkflow(run.workflow_id.clone()));
        };

        let payload = serde_json::to_value(RunJob {
            run_id: run.id.clone(),
            resource_id: run.resource_id.clone(),
            workflow_id: run.workflow_id.clone(),
            input: run.input.clone(),
            event: Some(RunEvent {
                name: request.event_name.clone(),
                data: request.data.clone(),
            }),
        })?;
        let send_options = SendOptions::default().expire_in_seconds(
            request
                .expire_in_seconds
                .unwrap_or(self.inner.config.job_expire_seconds),
        );
        self.inner
            .queue
            .send(&dispatch_queue_name(&definition), payload, send_options)
            .await?;

        debug!(run_id = %run.id, event = %request.event_name, "event enqueued");
        Ok(run)
    }

    /// Fetch one run.
    pub async fn get_run(&self, run_id: &str, resource_id: Option<&str>) -> Result<WorkflowRun> {
        self.inner
            .store
            .get(run_id, resource_id)
            .await?
            .ok_or(Error::NotFound("workflow run"))
    }

    /// List runs, newest first, with cursor pagination.
    pub async fn get_runs(&self, filter: RunFilter) -> Result<RunPage> {
        self.inner.store.list(filter).await
    }

    /// Progress report computed from the static step list and timeline.
    pub async fn check_progress(
        &self,
        run_id: &str,
        resource_id: Option<&str>,
    ) -> Result<RunProgress> {
        let run = self.get_run(run_id, resource_id).await?;
        let Some(definition) = self.inner.registry.get(&run.workflow_id) else {
            return Err(Error::UnknownWorkflow(run.workflow_id.clone()));
        };
        Ok(progress::compute(&definition.steps, &run))
    }
}
