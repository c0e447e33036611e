//! Durable workflow engine whose entire persistence and scheduling substrate
//! is a single PostgreSQL database.
//!
//! A workflow is a handler function that invokes named **steps** — durable
//! units of work, external-event waits, manual pauses, and wall-clock waits.
//! Runloom guarantees each step executes at-most-once to success, persists
//! its result in a per-run timeline, and re-plays the handler after crashes
//! or cross-process transitions by serving cached step results instead of
//! re-running side effects.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             Dispatch                                 │
//! │                                                                      │
//! │   1. Worker claims a "process run" job from the queue                │
//! │   2. Load the run; resolve PAUSED state against the incoming event   │
//! │   3. Replay the handler through the middleware pipeline              │
//! │   4. Each step call locks the row: cached output | side effect |     │
//! │      pause marker                                                    │
//! │   5. Complete, schedule a retry with backoff, or fail terminally     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Suspension is modeled without coroutines: a wait step marks the run
//! PAUSED and the handler returns [`Flow::Suspended`]; a later event (or the
//! queue's delayed delivery, for `wait_until`) enqueues a fresh dispatch
//! that replays the handler cheaply off the timeline.
//!
//! # Example
//!
//! ```ignore
//! use runloom::{Engine, EngineConfig, Flow, StartWorkflowRequest, StepSpec, WorkflowDefinition};
//! use serde_json::json;
//!
//! let definition = WorkflowDefinition::builder("greet")
//!     .step(StepSpec::run("hello"))
//!     .handler(|ctx| async move {
//!         let Some(greeting) = ctx
//!             .run("hello", || async { Ok(json!({"msg": "hi"})) })
//!             .await?
//!             .value()
//!         else {
//!             return Ok(Flow::Suspended);
//!         };
//!         Ok(Flow::Done(greeting))
//!     })
//!     .build()?;
//!
//! let engine = Engine::new(pool, EngineConfig::default());
//! engine.register_workflow(definition).await?;
//! engine.start(true).await?;
//! let run = engine
//!     .start_workflow(StartWorkflowRequest::new("greet", json!({})))
//!     .await?;
//! ```

mod context;
pub mod cron;
mod definition;
mod dispatcher;
mod engine;
mod error;
pub mod hooks;
pub mod middleware;
pub mod progress;
pub mod queue;
mod registry;
mod retry;
mod run;
mod steps;
pub mod store;

pub use context::{Flow, ScheduleContext, StepOutcome, WorkflowContext};
pub use definition::{
    CronConfig, InputSchema, StepKind, StepSpec, WorkflowDefinition, WorkflowDefinitionBuilder,
    WorkflowHandler,
};
pub use dispatcher::{RunEvent, RunJob};
pub use engine::{
    Engine, EngineConfig, StartWorkflowOptions, StartWorkflowRequest, TriggerEventRequest,
};
pub use error::{Error, HandlerError, Result};
pub use hooks::{RunOutcome, WorkflowHooks};
pub use middleware::{Middleware, Next};
pub use progress::RunProgress;
pub use queue::{Job, JobQueue, PgQueue, SendOptions, WorkOptions, WORKFLOW_RUN_QUEUE};
pub use registry::WorkflowRegistry;
pub use retry::RetryPolicy;
pub use run::{
    generate_run_id, RunStatus, Timeline, TimelineEntry, WaitFor, WorkflowRun, PAUSE_EVENT,
    WAIT_UNTIL_PREFIX,
};
pub use store::{NewRun, PgRunStore, RunFilter, RunPage, RunPatch};
