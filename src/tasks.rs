//! Context-propagating task runner.
//!
//! Spawned work runs against a snapshot of the spawner's resolver context:
//! it sees the same scope instances and may trigger lazy builds in them, but
//! it never holds the authority to close them. Aborting a task only abandons
//! the task's own future.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::DiError;
use crate::resolver::ResolverContext;

/// Spawns units of work that inherit the ambient resolver context.
pub trait TaskRunner: Send + Sync {
    fn create_task<F>(&self, work: F) -> Result<TaskHandle<F::Output>, DiError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}

/// Default runner, provided by the builtin module as `task_runner`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextTaskRunner;

impl TaskRunner for ContextTaskRunner {
    fn create_task<F>(&self, work: F) -> Result<TaskHandle<F::Output>, DiError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        create_task(work)
    }
}

/// Spawns `work` on the tokio runtime with a snapshot of the ambient context.
///
/// Fails when there is no ambient context: a task that silently resolves
/// nothing is always a wiring bug.
pub fn create_task<F>(work: F) -> Result<TaskHandle<F::Output>, DiError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let ctx = ResolverContext::current().ok_or_else(|| {
        DiError::ManagedScope("create_task called with no ambient resolver context".to_string())
    })?;
    Ok(spawn_in(ctx, work))
}

/// Spawns `work` with an explicit context snapshot.
pub fn spawn_in<F>(ctx: ResolverContext, work: F) -> TaskHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tracing::debug!(scopes = ctx.scopes().len(), "Spawning context task");
    let inner = tokio::spawn(ctx.run(work).in_current_span());
    TaskHandle { inner }
}

/// Handle to a spawned task. Await it to join; drop it to detach.
#[derive(Debug)]
pub struct TaskHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Abandons the task. Scope instances it observed are untouched.
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, DiError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(|joined| {
            joined.map_err(|err| {
                if err.is_cancelled() {
                    DiError::Task("task was cancelled".to_string())
                } else {
                    DiError::Task(format!("task panicked: {err}"))
                }
            })
        })
    }
}
