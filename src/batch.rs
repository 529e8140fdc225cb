//! Bounded-concurrency batch execution
//!
//! Tasks are split into fixed-size batches that run one after another.
//! Within a batch at most `concurrency` tasks run at once. A failing or
//! panicking task only fails its own result; the batch always reports an
//! outcome for every task it was given.

use crate::config::BatchConfig;
use crate::error::{ModcheckError, ModcheckResult};
use futures_util::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifier of a task within one run
pub type TaskId = String;

type TaskFn<T> = Box<dyn FnOnce() -> BoxFuture<'static, ModcheckResult<T>> + Send>;

/// A unit of independent work
pub struct Task<T> {
    id: TaskId,
    run: TaskFn<T>,
}

impl<T> Task<T> {
    /// Create a task from a closure producing its future
    pub fn new<F, Fut>(id: impl Into<TaskId>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ModcheckResult<T>> + Send + 'static,
    {
        Self {
            id: id.into(),
            run: Box::new(move || Box::pin(f())),
        }
    }

    /// Task identifier
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

/// What happened to a task
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Succeeded(T),
    Failed(ModcheckError),
    /// Never started because the run was cancelled
    Cancelled,
}

/// Outcome of one task with its wall time
#[derive(Debug)]
pub struct TaskResult<T> {
    pub outcome: TaskOutcome<T>,
    pub duration: Duration,
}

impl<T> TaskResult<T> {
    fn cancelled() -> Self {
        Self {
            outcome: TaskOutcome::Cancelled,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Succeeded(_))
    }

    /// Value of a successful task
    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            TaskOutcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    /// Error of a failed task
    pub fn error(&self) -> Option<&ModcheckError> {
        match &self.outcome {
            TaskOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Results of a run, keyed by task id
#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: HashMap<TaskId, TaskResult<T>>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed: Duration,
}

impl<T> BatchReport<T> {
    /// Whether cancellation kept some tasks from starting
    pub fn was_cancelled(&self) -> bool {
        self.cancelled > 0
    }

    /// Result for one task
    pub fn get(&self, id: &str) -> Option<&TaskResult<T>> {
        self.results.get(id)
    }
}

/// Runs tasks in sequential batches with bounded concurrency
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    batch_size: usize,
}

impl BatchOrchestrator {
    /// Create an orchestrator grouping tasks into batches of `batch_size`
    pub fn new(batch_size: usize) -> ModcheckResult<Self> {
        if batch_size == 0 {
            return Err(ModcheckError::InvalidBatchSize(batch_size));
        }
        Ok(Self { batch_size })
    }

    /// Create an orchestrator from configuration
    pub fn from_config(config: &BatchConfig) -> ModcheckResult<Self> {
        Self::new(config.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run every task and wait for all of them.
    ///
    /// Only fails on invalid arguments. Cancellation is checked between
    /// dispatches: running tasks finish, tasks not yet started are reported
    /// as [`TaskOutcome::Cancelled`].
    pub async fn run<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> ModcheckResult<BatchReport<T>> {
        if concurrency == 0 {
            return Err(ModcheckError::InvalidConcurrency(concurrency));
        }

        let started = Instant::now();
        let total = tasks.len();
        let batches = total.div_ceil(self.batch_size);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut results: HashMap<TaskId, TaskResult<T>> = HashMap::with_capacity(total);

        info!(
            tasks = total,
            batches,
            concurrency,
            "Starting batch run"
        );

        let mut pending = tasks.into_iter();
        for batch_no in 1..=batches {
            let batch: Vec<Task<T>> = pending.by_ref().take(self.batch_size).collect();
            let mut handles: Vec<(TaskId, JoinHandle<TaskResult<T>>)> =
                Vec::with_capacity(batch.len());

            for task in batch {
                if results.contains_key(&task.id) || handles.iter().any(|(id, _)| *id == task.id) {
                    warn!(task_id = %task.id, "Duplicate task id, keeping the first result");
                    continue;
                }
                if cancel.is_cancelled() {
                    results.insert(task.id, TaskResult::cancelled());
                    continue;
                }

                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = Arc::clone(&semaphore).acquire_owned() => Some(
                        permit.map_err(|_| ModcheckError::Internal("task semaphore closed".to_string()))?,
                    ),
                };
                let Some(permit) = permit else {
                    results.insert(task.id, TaskResult::cancelled());
                    continue;
                };

                let Task { id, run } = task;
                debug!(task_id = %id, "Dispatching task");
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    let start = Instant::now();
                    let outcome = match run().await {
                        Ok(value) => TaskOutcome::Succeeded(value),
                        Err(e) => TaskOutcome::Failed(e),
                    };
                    TaskResult {
                        outcome,
                        duration: start.elapsed(),
                    }
                });
                handles.push((id, handle));
            }

            for (id, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        let err = if e.is_panic() {
                            ModcheckError::TaskPanicked {
                                task: id.clone(),
                                reason: panic_message(e.into_panic()),
                            }
                        } else {
                            ModcheckError::TaskAborted(id.clone())
                        };
                        warn!(task_id = %id, error = %err, "Task did not complete");
                        TaskResult {
                            outcome: TaskOutcome::Failed(err),
                            duration: Duration::ZERO,
                        }
                    }
                };
                if let TaskOutcome::Failed(err) = &result.outcome {
                    debug!(task_id = %id, error = %err, "Task failed");
                }
                results.insert(id, result);
            }

            info!(
                batch = batch_no,
                batches,
                completed = results.len(),
                total,
                "Batch finished"
            );
        }

        let mut report = BatchReport {
            results,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            elapsed: started.elapsed(),
        };
        for result in report.results.values() {
            match result.outcome {
                TaskOutcome::Succeeded(_) => report.succeeded += 1,
                TaskOutcome::Failed(_) => report.failed += 1,
                TaskOutcome::Cancelled => report.cancelled += 1,
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch run complete"
        );
        Ok(report)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
