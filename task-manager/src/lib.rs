//! Task lifecycle plugin for cuillere
//!
//! A [`TaskManager`] runs every top-level run of a runtime (the core `start`
//! operation) inside a lifecycle observed by [`TaskListener`]s: transaction
//! managers, connection pools or request-scoped resources hook the start and
//! the end of a task without the computations knowing about them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cuillere::{kind, next, Co, Computation, Context, Error, Operation, Plugin, Result, Value};
use futures::future::{join_all, try_join_all};
use thiserror::Error;
use tracing::{debug, warn};

/// Hooks around the execution of a task. Every hook defaults to a no-op.
#[async_trait]
pub trait TaskListener: Send + Sync {
    /// Before the task runs. Listeners initialize concurrently.
    async fn initialize(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the task succeeded, before `complete`. Runs sequentially in
    /// registration order, so a listener may still fail the task.
    async fn pre_complete(&self, _result: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the task and every `pre_complete` succeeded.
    async fn complete(&self, _result: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the task or one of the hooks above failed.
    async fn error(&self, _error: &Error) -> anyhow::Result<()> {
        Ok(())
    }

    /// Always last, with the error the task failed with, if any.
    async fn finalize(&self, _error: Option<&Error>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Failures of the listeners of one lifecycle stage
#[derive(Debug, Error)]
#[error("task {stage} failed: {}", describe(.causes))]
pub struct ListenerFailure {
    pub stage: &'static str,
    pub causes: Vec<anyhow::Error>,
}

fn describe(causes: &[anyhow::Error]) -> String {
    causes
        .iter()
        .map(|cause| format!("caused by: {cause}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn settle(stage: &'static str, outcomes: Vec<anyhow::Result<()>>) -> Result<()> {
    let causes: Vec<_> = outcomes.into_iter().filter_map(|outcome| outcome.err()).collect();
    if causes.is_empty() {
        Ok(())
    } else {
        Err(anyhow::Error::new(ListenerFailure { stage, causes }).into())
    }
}

/// Runs tasks inside the lifecycle of its listeners
#[derive(Default)]
pub struct TaskManager {
    listeners: Vec<Arc<dyn TaskListener>>,
}

impl TaskManager {
    pub fn new(listeners: impl IntoIterator<Item = Arc<dyn TaskListener>>) -> Self {
        Self {
            listeners: listeners.into_iter().collect(),
        }
    }

    pub fn with_listener(mut self, listener: impl TaskListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    async fn initialize(&self, ctx: &Context) -> Result<()> {
        try_join_all(self.listeners.iter().map(|listener| listener.initialize(ctx))).await?;
        Ok(())
    }

    async fn pre_complete(&self, result: &Value) -> Result<()> {
        for listener in &self.listeners {
            listener.pre_complete(result).await?;
        }
        Ok(())
    }

    async fn complete(&self, result: &Value) -> Result<()> {
        let outcomes = join_all(self.listeners.iter().map(|listener| listener.complete(result))).await;
        settle("completion", outcomes)
    }

    async fn error(&self, error: &Error) -> Result<()> {
        let outcomes = join_all(self.listeners.iter().map(|listener| listener.error(error))).await;
        settle("error handling", outcomes)
    }

    async fn finalize(&self, error: Option<&Error>) -> Result<()> {
        let outcomes = join_all(self.listeners.iter().map(|listener| listener.finalize(error))).await;
        settle("finalization", outcomes)
    }

    async fn run(&self, co: &Co, operation: Operation, ctx: &Context) -> Result<Value> {
        self.initialize(ctx).await?;
        let result = co.perform(next(operation)).await?;
        self.pre_complete(&result).await?;
        self.complete(&result).await?;
        Ok(result)
    }

    /// Delegate `operation` to the next handler of its kind from the handler
    /// computation owning `co`, inside the listeners' lifecycle.
    ///
    /// A failing `error` or `finalize` stage replaces the task's outcome;
    /// `finalize` still receives the original error.
    pub async fn execute(&self, co: &Co, operation: Operation, ctx: &Context) -> Result<Value> {
        let mut outcome = self.run(co, operation, ctx).await;
        let error = outcome.as_ref().err().cloned();

        if let Some(error) = &error {
            debug!(%error, "task failed");
            if let Err(failure) = self.error(error).await {
                warn!(%failure, "task error listeners failed");
                outcome = Err(failure);
            }
        }

        if let Err(failure) = self.finalize(error.as_ref()).await {
            warn!(%failure, "task finalization failed");
            outcome = Err(failure);
        }

        outcome
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Run every top-level run of the runtime inside `manager`'s lifecycle.
pub fn plugin(manager: Arc<TaskManager>) -> Plugin {
    executor_plugin(move |_| Some(Arc::clone(&manager)))
}

/// Like [`plugin`], choosing the manager from the run's context. Runs for
/// which `select` returns `None` are delegated untouched.
pub fn executor_plugin<F>(select: F) -> Plugin
where
    F: Fn(&Context) -> Option<Arc<TaskManager>> + Send + Sync + 'static,
{
    Plugin::new().handler(kind::START, move |operation, ctx| {
        let manager = select(ctx);
        let ctx = ctx.clone();
        Computation::named("task", move |co| async move {
            match manager {
                Some(manager) => manager.execute(&co, operation, &ctx).await,
                None => co.perform(next(operation)).await,
            }
        })
    })
}
