// Handles on forked stacks

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::value::Value;

/// Flags shared between a stack and the tasks observing it
#[derive(Debug, Default)]
pub(crate) struct Signal {
    canceled: AtomicBool,
    settled: AtomicBool,
}

impl Signal {
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub(crate) fn settle(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

/// A forked computation running on its own stack.
///
/// Cloning a task clones the handle, not the computation: every clone
/// observes the same result and cancels the same stack.
#[derive(Clone)]
pub struct Task {
    id: Uuid,
    signal: Arc<Signal>,
    result: Shared<BoxFuture<'static, Result<Value>>>,
}

impl Task {
    /// Spawn `run` on the ambient Tokio runtime.
    pub(crate) fn spawn(run: BoxFuture<'static, Result<Value>>, signal: Arc<Signal>) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|error| Error::Type(format!("fork: {error}")))?;
        let join = handle.spawn(run);

        let id = Uuid::new_v4();
        let result = async move {
            match join.await {
                Ok(result) => result,
                Err(error) => Err(Error::msg(format!("task {id} aborted: {error}"))),
            }
        }
        .boxed()
        .shared();

        Ok(Self { id, signal, result })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Eventual value or error of the forked stack.
    pub fn result(&self) -> impl std::future::Future<Output = Result<Value>> + Send + 'static {
        self.result.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.signal.is_settled()
    }

    /// Ask the forked stack to terminate and wait until it has.
    ///
    /// Canceled frames still run their defers. Resolves `Ok` when the task
    /// was already settled or canceled cleanly. A defer that failed while
    /// unwinding is returned, as is any other failure of the task.
    pub async fn cancel(&self) -> Result<()> {
        if self.signal.is_settled() {
            return Ok(());
        }

        debug!(task = %self.id, "canceling task");
        self.signal.cancel();

        match self.result.clone().await {
            Ok(_) => Ok(()),
            Err(error) if error.is_cancellation() => match error.errors().first() {
                Some(cleanup) => Err(cleanup.clone()),
                None => Ok(()),
            },
            Err(error) => Err(error),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("settled", &self.is_settled())
            .finish()
    }
}
