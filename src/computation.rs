// Suspendable computations
//
// A computation is an owned future plus a `Co` handle it uses to yield
// effects to the interpreter. Yielding parks the effect in a slot shared
// with the interpreter and suspends; the interpreter answers by storing the
// outcome in the same slot and polling the future again. This is the
// generator protocol made explicit: resume with a value, resume with an
// error, or drop the future to terminate early.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::future::poll_fn;

use crate::error::{Error, Result};
use crate::operation::Effect;
use crate::value::Value;

enum Slot {
    Empty,
    Yielded(Effect),
    Resumed(Result<Value>),
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a computation did when the interpreter resumed it
pub(crate) enum Step {
    /// The computation suspended on an effect.
    Yield(Effect),
    /// The computation ran to completion.
    Complete(Result<Value>),
}

/// Handle a computation uses to perform effects
#[derive(Clone)]
pub struct Co {
    slot: Arc<Mutex<Slot>>,
}

impl Co {
    /// Yield `effect` to the interpreter and wait for its outcome.
    ///
    /// An `Err` outcome is the error raised by the effect; match on it to
    /// recover or propagate it with `?`. A computation performs one effect
    /// at a time: the returned future must be awaited before the next
    /// `perform`.
    pub fn perform(&self, effect: impl Into<Effect>) -> Perform {
        Perform {
            slot: Arc::clone(&self.slot),
            effect: Some(effect.into()),
        }
    }
}

impl fmt::Debug for Co {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Co")
    }
}

/// Future returned by [`Co::perform`]
#[must_use = "effects are only performed when awaited"]
pub struct Perform {
    slot: Arc<Mutex<Slot>>,
    effect: Option<Effect>,
}

impl Future for Perform {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut slot = lock(&this.slot);

        // First poll hands the effect over; the interpreter notices the
        // parked effect as soon as the computation returns `Pending`.
        if let Some(effect) = this.effect.take() {
            *slot = Slot::Yielded(effect);
            return Poll::Pending;
        }

        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Resumed(outcome) => Poll::Ready(outcome),
            other => {
                *slot = other;
                Poll::Pending
            }
        }
    }
}

type Body = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A lazily started, suspendable computation
pub struct Computation {
    name: Option<Arc<str>>,
    co: Co,
    body: Body,
}

impl Computation {
    /// Build a computation from an async body receiving its `Co` handle.
    /// Nothing runs until the interpreter first resumes it.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Co) -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let co = Co {
            slot: Arc::new(Mutex::new(Slot::Empty)),
        };
        Self {
            name: None,
            body: Box::pin(body(co.clone())),
            co,
        }
    }

    pub fn named<F, Fut>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: FnOnce(Co) -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(body).with_name(name)
    }

    /// A computation that completes immediately with `value`.
    pub fn ready(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::new(move |_| async move { Ok(value) })
    }

    /// A computation that fails immediately with `error`.
    pub fn fail(error: Error) -> Self {
        Self::new(move |_| async move { Err(error) })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Resume with `input` and run until the next yielded effect or the end.
    ///
    /// The first resume of a computation ignores `input`. Awaits on anything
    /// other than `Co::perform` are forwarded to the caller's executor.
    pub(crate) async fn resume(&mut self, input: Result<Value>) -> Step {
        *lock(&self.co.slot) = Slot::Resumed(input);

        let co = &self.co;
        let body = &mut self.body;
        poll_fn(|cx| match body.as_mut().poll(cx) {
            Poll::Ready(outcome) => Poll::Ready(Step::Complete(outcome)),
            Poll::Pending => {
                let mut slot = lock(&co.slot);
                match std::mem::replace(&mut *slot, Slot::Empty) {
                    Slot::Yielded(effect) => Poll::Ready(Step::Yield(effect)),
                    other => {
                        *slot = other;
                        Poll::Pending
                    }
                }
            }
        })
        .await
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computation")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// A named function producing computations: the target of `call`
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    body: Arc<dyn Fn(Vec<Value>) -> Computation + Send + Sync>,
}

impl Function {
    pub fn new<F>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: Fn(Vec<Value>) -> Computation + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the computation for one invocation. Unnamed computations take
    /// the function's name.
    pub fn invoke(&self, args: Vec<Value>) -> Computation {
        let computation = (self.body)(args);
        if computation.name.is_some() {
            computation
        } else {
            computation.with_name(Arc::clone(&self.name))
        }
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Function").field(&self.name).finish()
    }
}
