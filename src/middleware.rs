// Middleware plugins
//
// Namespace-less plugins that intercept already-qualified operation kinds and
// delegate them with `next`, adding cross-cutting concerns like tracing or
// metrics without touching the handlers they wrap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::computation::Computation;
use crate::context::Context;
use crate::operation::{next, Operation};
use crate::plugin::Plugin;

/// Log every operation of the given kinds with its duration and outcome.
///
/// Kinds must be qualified (`"@ns/key"`), registration fails otherwise.
/// Register it before the plugins it should observe.
pub fn trace<I, S>(kinds: I) -> Plugin
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    kinds.into_iter().fold(Plugin::new(), |plugin, kind| {
        plugin.handler(kind, |operation: Operation, _ctx: &Context| {
            Computation::named("trace", move |co| async move {
                let kind = operation.kind().to_owned();
                let start = Instant::now();
                trace!(%kind, "operation: start");
                let result = co.perform(next(operation)).await;
                let duration = start.elapsed();
                match &result {
                    Ok(_) => debug!(%kind, ?duration, "operation: success"),
                    Err(e) => warn!(%kind, ?duration, error = %e, "operation: failed"),
                }
                result
            })
        })
    })
}

/// Counts operations of the given kinds
#[derive(Debug, Default)]
pub struct Metrics {
    dispatched: AtomicU64,
    failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Plugin counting into these metrics.
    pub fn plugin<I, S>(self: &Arc<Self>, kinds: I) -> Plugin
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        kinds.into_iter().fold(Plugin::new(), |plugin, kind| {
            let metrics = Arc::clone(self);
            plugin.handler(kind, move |operation: Operation, _ctx: &Context| {
                let metrics = Arc::clone(&metrics);
                Computation::named("metrics", move |co| async move {
                    metrics.dispatched.fetch_add(1, Ordering::Relaxed);
                    let result = co.perform(next(operation)).await;
                    if result.is_err() {
                        metrics.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    result
                })
            })
        })
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
