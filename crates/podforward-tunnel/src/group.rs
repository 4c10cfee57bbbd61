//! Task group aggregating the first error of its members

use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Spawns cooperating tasks and reports the first failure among them.
///
/// A group created with [`TaskGroup::with_cancellation`] cancels its token as
/// soon as any member fails, so siblings waiting on that token wind down.
pub struct TaskGroup<E> {
    tasks: JoinSet<Result<(), E>>,
    cancel: Option<CancellationToken>,
}

impl<E: Send + 'static> Default for TaskGroup<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + 'static> TaskGroup<E> {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: None,
        }
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: Some(token),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        match self.cancel.clone() {
            Some(token) => {
                self.tasks.spawn(async move {
                    let result = task.await;
                    if result.is_err() {
                        token.cancel();
                    }
                    result
                });
            }
            None => {
                self.tasks.spawn(task);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task and return the first error.
    ///
    /// A panic in any member is resumed here.
    pub async fn wait(mut self) -> Result<(), E> {
        let mut first = None;

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first.is_none() {
                        first = Some(e);
                    }
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => debug!("Task cancelled: {}", e),
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<E> std::fmt::Debug for TaskGroup<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("tasks", &self.tasks.len())
            .field("cancelling", &self.cancel.is_some())
            .finish()
    }
}
