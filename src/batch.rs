// Call batching
//
// A batched function yields a batch operation instead of running its body.
// The batch plugin enrolls every such call in the open batch of its
// (function, key) group. The call that opens a batch flushes it: inline after
// one scheduling turn for a zero window, from a forked task once a fixed
// window has elapsed otherwise. Flushing removes the batch and invokes the
// function once with every enrolled argument tuple.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::computation::{Computation, Function};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::operation::{call, fork, Operation};
use crate::plugin::Plugin;
use crate::value::Value;

pub const NAMESPACE: &str = "@cuillere/batch";

const EXECUTE: &str = "@cuillere/batch/execute";

/// Window configuration of the batch plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Coalescing window in milliseconds. `0` flushes at the next scheduling
    /// turn.
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Grouping identity of batched calls
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BatchKey {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl BatchKey {
    /// Falsy keys (`false`, `0`, `""`) bypass batching.
    pub fn is_truthy(&self) -> bool {
        match self {
            BatchKey::Bool(b) => *b,
            BatchKey::Int(n) => *n != 0,
            BatchKey::Str(s) => !s.is_empty(),
        }
    }

    /// Key of a scalar value; other values have no key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(BatchKey::Bool(*b)),
            Value::Int(n) => Some(BatchKey::Int(*n)),
            Value::Str(s) => Some(BatchKey::Str(s.to_string())),
            _ => None,
        }
    }
}

impl From<bool> for BatchKey {
    fn from(b: bool) -> Self {
        BatchKey::Bool(b)
    }
}

impl From<i64> for BatchKey {
    fn from(n: i64) -> Self {
        BatchKey::Int(n)
    }
}

impl From<i32> for BatchKey {
    fn from(n: i32) -> Self {
        BatchKey::Int(n.into())
    }
}

impl From<&str> for BatchKey {
    fn from(s: &str) -> Self {
        BatchKey::Str(s.to_owned())
    }
}

impl From<String> for BatchKey {
    fn from(s: String) -> Self {
        BatchKey::Str(s)
    }
}

/// Payload of the batch operation
struct BatchCall {
    id: Uuid,
    func: Function,
    key: Option<BatchKey>,
    args: Vec<Value>,
}

/// Batch every concurrent call of `func` together.
///
/// `func` receives one argument per enrolled call, the call's argument list
/// as a [`Value::List`], and must return a list with one result per call.
pub fn batched(func: Function) -> Function {
    batched_by(func, |_| Some(BatchKey::Bool(true)))
}

/// Like [`batched`], grouping calls by the key computed from their
/// arguments. Calls without a key, or with a falsy one, run alone.
pub fn batched_by<K>(func: Function, key: K) -> Function
where
    K: Fn(&[Value]) -> Option<BatchKey> + Send + Sync + 'static,
{
    let id = Uuid::new_v4();
    let name = func.name().to_owned();

    Function::new(name, move |args| {
        let operation = Operation::new(
            EXECUTE,
            BatchCall {
                id,
                func: func.clone(),
                key: key(&args),
                args,
            },
        );
        Computation::new(move |co| async move { co.perform(operation).await })
    })
}

struct Enrolled {
    args: Vec<Value>,
    reply: oneshot::Sender<Result<Value>>,
}

type Batches = Arc<Mutex<HashMap<(Uuid, BatchKey), Vec<Enrolled>>>>;

/// The batch plugin with the given window. The runtime always registers one
/// with its configured window; registering another one earlier takes
/// precedence.
pub fn plugin(config: BatchConfig) -> Plugin {
    let batches = Batches::default();
    let window = config.window();

    Plugin::namespaced(NAMESPACE).handler("execute", move |operation, _ctx: &Context| {
        let batches = Arc::clone(&batches);
        Computation::named("batch", move |co| async move {
            let BatchCall {
                id,
                func,
                key,
                args,
            } = operation.into_payload()?;

            let Some(key) = key.filter(BatchKey::is_truthy) else {
                trace!(func = func.name(), "unbatched call");
                let results = co
                    .perform(call(&func, [Value::List(args)]))
                    .await?
                    .into_list()?;
                return results.into_iter().next().ok_or_else(|| {
                    Error::Type(format!("batch: {} returned no result", func.name()))
                });
            };

            let (reply, receiver) = oneshot::channel();
            let opened = {
                let mut batches = batches.lock().await;
                let group = batches.entry((id, key.clone())).or_default();
                group.push(Enrolled { args, reply });
                group.len() == 1
            };

            if opened {
                trace!(func = func.name(), ?key, "batch opened");
                let flusher = flush(Arc::clone(&batches), id, key.clone(), func, window);
                if window.is_zero() {
                    // Calls polled alongside this one enroll while the flush
                    // yields, whatever thread the runtime schedules us on.
                    co.perform(flusher).await?;
                } else if let Err(error) = co.perform(fork(flusher)).await {
                    // Without a flusher the group would never be answered.
                    batches.lock().await.remove(&(id, key));
                    return Err(error);
                }
            }

            receiver
                .await
                .map_err(|_| Error::Type("batch: flushed without a result".into()))?
        })
    })
}

fn flush(batches: Batches, id: Uuid, key: BatchKey, func: Function, window: Duration) -> Computation {
    Computation::named("batch flush", move |co| async move {
        if window.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(window).await;
        }

        let enrolled = batches
            .lock()
            .await
            .remove(&(id, key))
            .unwrap_or_default();
        let (calls, replies): (Vec<_>, Vec<_>) = enrolled
            .into_iter()
            .map(|Enrolled { args, reply }| (Value::List(args), reply))
            .unzip();

        debug!(func = func.name(), calls = calls.len(), "flushing batch");
        let expected = calls.len();
        let outcome = co
            .perform(call(&func, calls))
            .await
            .and_then(Value::into_list)
            .and_then(|results| {
                if results.len() == expected {
                    Ok(results)
                } else {
                    Err(Error::Type(format!(
                        "batch: {} returned {} results for {expected} calls",
                        func.name(),
                        results.len()
                    )))
                }
            });

        // Callers that went away no longer hold a receiver.
        match outcome {
            Ok(results) => {
                for (reply, result) in replies.into_iter().zip(results) {
                    let _ = reply.send(Ok(result));
                }
            }
            Err(error) => {
                debug!(%error, func = func.name(), "batch failed");
                for reply in replies {
                    let _ = reply.send(Err(error.clone()));
                }
            }
        }

        Ok(Value::Null)
    })
}
