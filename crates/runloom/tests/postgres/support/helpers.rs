use std::time::Duration;

use anyhow::{anyhow, Result};
use runloom::{Engine, EngineConfig, RunStatus, WorkflowRun};
use sqlx::PgPool;

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Engine tuned for tests: fast polling, default worker count.
pub fn test_engine(pool: &PgPool) -> Engine {
    Engine::new(
        pool.clone(),
        EngineConfig {
            polling_interval: Duration::from_millis(50),
            ..Default::default()
        },
    )
}

/// Poll until the run reaches `status`.
///
/// Fails fast when the run lands on a different terminal status, so a
/// failing workflow doesn't burn the whole timeout. FAILED counts as
/// terminal only once retries are exhausted — between a step failure and
/// its retry flip the row is briefly FAILED with retries remaining.
pub async fn wait_for_status(
    engine: &Engine,
    run_id: &str,
    status: RunStatus,
    timeout: Duration,
) -> Result<WorkflowRun> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let run = engine.get_run(run_id, None).await?;
        let failed_terminally =
            run.status == RunStatus::Failed && run.retry_count >= run.max_retries;
        let terminal = matches!(run.status, RunStatus::Completed | RunStatus::Cancelled)
            || failed_terminally;

        if run.status == status && (status != RunStatus::Failed || failed_terminally) {
            return Ok(run);
        }
        if terminal {
            return Err(anyhow!(
                "run {run_id} reached terminal status {} while waiting for {status} (error: {:?})",
                run.status,
                run.error
            ));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "timed out waiting for run {run_id} to reach {status}, last saw {}",
                run.status
            ));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until `probe` returns `Some`, or fail at the deadline.
pub async fn wait_until<T, F, Fut>(timeout: Duration, what: &str, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("timed out waiting for {what}"));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
