use std::time::Duration;

use futures::stream::StreamExt;
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::Result;
use crate::tasks::{RunContext, Task, TaskOutcome};

/// Minimum wall-clock time per task in serial mode.
const SERIAL_FLOOR: Duration = Duration::from_secs(3);

/// Drives tasks through a bounded worker pool.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    workers: usize,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TaskRunner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Run tasks concurrently, collecting results in completion order.
    /// On the first failure no further task starts real work: in-flight
    /// tasks finish, queued tasks drain, and the first error is returned
    /// after the pool empties.
    pub async fn run(&self, ctx: &RunContext, tasks: Vec<Task>) -> Result<Vec<TaskOutcome>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        info!("Running {} task(s) with {} worker(s)", tasks.len(), self.workers);
        ctx.reset_counters();

        let mut pool = futures::stream::iter(
            tasks
                .into_iter()
                .map(|mut task| async move { task.run(ctx).await }),
        )
        .buffer_unordered(self.workers);

        let mut outcomes = Vec::new();
        let mut first_error = None;
        while let Some(result) = pool.next().await {
            match result {
                Ok(items) => outcomes.extend(items),
                Err(e) => {
                    error!("Task failed: {e}");
                    ctx.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Run tasks one at a time in queue order, padding fast tasks to the
    /// serial pacing floor. Intended for debugging and tests.
    pub async fn run_serial(&self, ctx: &RunContext, tasks: Vec<Task>) -> Result<Vec<TaskOutcome>> {
        ctx.reset_counters();
        let mut outcomes = Vec::new();
        for mut task in tasks {
            let start = Instant::now();
            outcomes.extend(task.run(ctx).await?);
            let elapsed = start.elapsed();
            if elapsed < SERIAL_FLOOR {
                tokio::time::sleep(SERIAL_FLOOR - elapsed).await;
            }
        }
        Ok(outcomes)
    }
}
