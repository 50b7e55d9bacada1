// `all` and `allSettled`: fork/join over a list of effects

use futures::future::{join_all, try_join_all};

use crate::computation::Computation;
use crate::context::Context;
use crate::error::Result;
use crate::operation::{fork, Effect, Operation};
use crate::plugin::Plugin;
use crate::task::Task;
use crate::value::{Settled, Value};

pub const NAMESPACE: &str = "@cuillere/concurrent";

/// Payload of `all` and `allSettled`
#[derive(Debug)]
pub struct ConcurrentOperation {
    pub effects: Vec<Effect>,
}

fn concurrent<I, E>(key: &str, effects: I) -> Operation
where
    I: IntoIterator<Item = E>,
    E: Into<Effect>,
{
    Operation::new(
        format!("{NAMESPACE}/{key}"),
        ConcurrentOperation {
            effects: effects.into_iter().map(Into::into).collect(),
        },
    )
}

/// Run every effect concurrently; the value is the list of results in effect
/// order.
///
/// On the first failure the other tasks are canceled and awaited, and the
/// failure is returned. Errors observed while canceling, other than the
/// original one, are attached as [`Error::errors`](crate::Error::errors).
pub fn all<I, E>(effects: I) -> Operation
where
    I: IntoIterator<Item = E>,
    E: Into<Effect>,
{
    concurrent("all", effects)
}

/// Run every effect concurrently and wait for all of them; the value is a
/// list of [`Settled`] outcomes in effect order. Never fails because of a
/// task failure.
pub fn all_settled<I, E>(effects: I) -> Operation
where
    I: IntoIterator<Item = E>,
    E: Into<Effect>,
{
    concurrent("allSettled", effects)
}

pub(crate) fn plugin() -> Plugin {
    Plugin::namespaced(NAMESPACE)
        .handler("all", handle_all)
        .handler("allSettled", handle_all_settled)
}

fn handle_all(operation: Operation, _ctx: &Context) -> Computation {
    Computation::named("all", move |co| async move {
        let ConcurrentOperation { effects } = operation.into_payload()?;

        // Every task is forked before any result is awaited.
        let mut tasks = Vec::with_capacity(effects.len());
        for effect in effects {
            tasks.push(co.perform(fork(effect)).await?.into_task()?);
        }

        match try_join_all(tasks.iter().map(Task::result)).await {
            Ok(values) => Ok(Value::List(values)),
            Err(error) => {
                let canceled = join_all(tasks.iter().map(|task| task.cancel())).await;
                let errors = canceled
                    .into_iter()
                    .filter_map(Result::err)
                    .filter(|reason| !reason.same(&error))
                    .collect();
                Err(error.with_errors(errors))
            }
        }
    })
}

fn handle_all_settled(operation: Operation, _ctx: &Context) -> Computation {
    Computation::named("allSettled", move |co| async move {
        let ConcurrentOperation { effects } = operation.into_payload()?;

        let mut tasks = Vec::with_capacity(effects.len());
        for effect in effects {
            tasks.push(co.perform(fork(effect)).await?.into_task()?);
        }

        let outcomes = join_all(tasks.iter().map(Task::result)).await;
        Ok(outcomes
            .into_iter()
            .map(|outcome| Value::from(Settled::from(outcome)))
            .collect())
    })
}
