//! Request-style middleware around the handler call.
//!
//! Middleware composes in registration order on the way in and reverse
//! order on the way out, and runs on every dispatch — including retries.
//! A middleware that returns without calling [`Next::run`] suppresses the
//! handler for that dispatch; the run stays where it is and is picked up by
//! the next dispatch, if any.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{Flow, WorkflowContext};
use crate::definition::WorkflowHandler;
use crate::error::HandlerError;

/// One layer of the dispatch pipeline.
///
/// # Example
///
/// ```ignore
/// struct Timing;
///
/// #[async_trait]
/// impl Middleware for Timing {
///     async fn handle(
///         &self,
///         ctx: &WorkflowContext,
///         next: Next<'_>,
///     ) -> Result<Flow, HandlerError> {
///         let started = std::time::Instant::now();
///         let flow = next.run(ctx).await;
///         tracing::info!(run_id = %ctx.run_id(), elapsed = ?started.elapsed(), "dispatch timed");
///         flow
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &WorkflowContext,
        next: Next<'_>,
    ) -> std::result::Result<Flow, HandlerError>;
}

/// The remainder of the pipeline, ending in the workflow handler.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    handler: &'a WorkflowHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(middlewares: &'a [Arc<dyn Middleware>], handler: &'a WorkflowHandler) -> Self {
        Self {
            rest: middlewares,
            handler,
        }
    }

    /// Invoke the rest of the pipeline.
    pub async fn run(self, ctx: &WorkflowContext) -> std::result::Result<Flow, HandlerError> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .handle(
                        ctx,
                        Next {
                            rest,
                            handler: self.handler,
                        },
                    )
                    .await
            }
            None => {
                let handler = Arc::clone(self.handler);
                handler(ctx.clone()).await
            }
        }
    }
}
