//! Bounded-concurrency fan-out for independent async operations.
//!
//! Every task gets its own result slot. A failing or panicking task is
//! recorded and the batch carries on; results come back in submission order.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskFailure<E> {
    #[error("{0}")]
    Failed(E),
    #[error("task panicked: {0}")]
    Panicked(String),
}

pub type TaskResult<T, E> = Result<T, TaskFailure<E>>;

/// Runs batches of tasks with at most `concurrency` in flight.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundedExecutor;

impl BoundedExecutor {
    /// Run every task and return one result per task, in submission order.
    ///
    /// A task starts as soon as a running one finishes. A concurrency of 0 is
    /// treated as 1.
    pub async fn execute<I, F, Fut, T, E>(tasks: I, concurrency: usize) -> Vec<TaskResult<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let concurrency = concurrency.max(1);
        let mut finished: Vec<(usize, TaskResult<T, E>)> =
            stream::iter(tasks.into_iter().enumerate())
                .map(|(index, task)| async move {
                    // The call itself runs inside the guard so a synchronous
                    // panic in the closure is caught too.
                    let outcome = AssertUnwindSafe(async move { task().await })
                        .catch_unwind()
                        .await;
                    let result = match outcome {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(TaskFailure::Failed(err)),
                        Err(payload) => Err(TaskFailure::Panicked(panic_message(payload))),
                    };
                    (index, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        finished.sort_by_key(|(index, _)| *index);
        debug!(tasks = finished.len(), concurrency, "batch finished");
        finished.into_iter().map(|(_, result)| result).collect()
    }
}

/// Free-function form of [`BoundedExecutor::execute`].
pub async fn execute_bounded<I, F, Fut, T, E>(tasks: I, concurrency: usize) -> Vec<TaskResult<T, E>>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    BoundedExecutor::execute(tasks, concurrency).await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Counts for a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
}

impl BatchSummary {
    pub fn from_results<T, E>(results: &[TaskResult<T, E>]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result {
                Ok(_) => summary.succeeded += 1,
                Err(TaskFailure::Failed(_)) => summary.failed += 1,
                Err(TaskFailure::Panicked(_)) => summary.panicked += 1,
            }
        }
        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}
