// The frame-stack interpreter
//
// A `Stack` owns an explicit call stack of frames. The bottom frame is a
// sentinel holding the final result; every other frame drives one suspended
// computation. The loop in `drive` resumes the top frame, dispatches what it
// yields (pushing handler or nested frames), and `shift` pops finished frames,
// running their defers and copying results into their parents.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, trace, warn};

use crate::computation::{Computation, Step};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::operation::{kind, Effect, Operation};
use crate::plugin::Registry;
use crate::task::{Signal, Task};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Canceled {
    No,
    ToDo,
    Done,
}

/// Kind and position of the handler a frame was dispatched to
struct HandlerTag {
    kind: String,
    index: usize,
}

struct Frame {
    computation: Option<Computation>,
    name: Option<String>,
    handler: Option<HandlerTag>,
    result: Result<Value>,
    defers: Vec<Effect>,
    canceled: Canceled,
    done: bool,
}

impl Frame {
    fn root() -> Self {
        Self {
            computation: None,
            name: None,
            handler: None,
            result: Ok(Value::Null),
            defers: Vec::new(),
            canceled: Canceled::No,
            done: false,
        }
    }

    fn new(computation: Computation, handler: Option<HandlerTag>) -> Self {
        Self {
            name: computation.name().map(str::to_owned),
            computation: Some(computation),
            handler,
            ..Self::root()
        }
    }

    fn label(&self) -> String {
        match (&self.handler, &self.name) {
            (Some(tag), _) => format!("<yield {}>", tag.kind),
            (None, Some(name)) => name.clone(),
            (None, None) => "<anonymous>".to_owned(),
        }
    }
}

/// Description of a frame, the value of the `generator` operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    /// Name of the computation, if any.
    pub name: Option<String>,
    /// Operation kind, for handler frames.
    pub kind: Option<String>,
    /// Position above the sentinel, starting at 1.
    pub depth: usize,
}

pub(crate) struct Stack {
    registry: Arc<Registry>,
    ctx: Context,
    frames: Vec<Frame>,
    signal: Arc<Signal>,
    cancel_applied: bool,
}

impl Stack {
    pub(crate) fn new(registry: Arc<Registry>, ctx: Context) -> Self {
        Self::with_signal(registry, ctx, Arc::default())
    }

    fn with_signal(registry: Arc<Registry>, ctx: Context, signal: Arc<Signal>) -> Self {
        Self {
            registry,
            ctx,
            frames: vec![Frame::root()],
            signal,
            cancel_applied: false,
        }
    }

    /// Handle `effect` and drive the stack until the sentinel is reached.
    pub(crate) fn run(mut self, effect: Effect) -> BoxFuture<'static, Result<Value>> {
        async move {
            self.handle(effect);
            let result = self.drive().await;
            self.signal.settle();
            result
        }
        .boxed()
    }

    async fn drive(&mut self) -> Result<Value> {
        while self.frames.len() > 1 {
            self.observe_cancellation();

            let frame = self.current_mut();
            if frame.done {
                self.shift();
                continue;
            }

            if frame.canceled == Canceled::ToDo {
                // Terminate as if the computation returned nothing; defers
                // still run on shift.
                frame.canceled = Canceled::Done;
                frame.computation = None;
                frame.result = Ok(Value::Null);
                frame.done = true;
                self.shift();
                continue;
            }

            let input = std::mem::replace(&mut frame.result, Ok(Value::Null));
            let Some(computation) = frame.computation.as_mut() else {
                frame.done = true;
                self.shift();
                continue;
            };

            match computation.resume(input).await {
                Step::Complete(result) => {
                    if let Err(error) = &result {
                        debug!(%error, frames = ?self.chain(), "computation failed");
                    }
                    let frame = self.current_mut();
                    frame.computation = None;
                    frame.result = result;
                    frame.done = true;
                    self.shift();
                }
                Step::Yield(effect) => {
                    self.observe_cancellation();
                    if self.current().canceled == Canceled::ToDo {
                        trace!(kind = effect.kind(), "discarding effect of a canceled frame");
                        continue;
                    }
                    self.handle(effect);
                }
            }
        }

        let result = std::mem::replace(&mut self.frames[0].result, Ok(Value::Null));
        if !self.cancel_applied {
            return result;
        }
        // A defer failing while the stack unwound is reported alongside the
        // cancellation.
        match result {
            Err(error) if !error.is_cancellation() => {
                Err(Error::Cancelled.with_errors(vec![error]))
            }
            _ => Err(Error::Cancelled),
        }
    }

    fn observe_cancellation(&mut self) {
        if self.cancel_applied || !self.signal.is_canceled() {
            return;
        }
        self.cancel_applied = true;
        debug!(frames = self.frames.len() - 1, "stack canceled");
        for frame in &mut self.frames {
            if frame.canceled == Canceled::No {
                frame.canceled = Canceled::ToDo;
            }
        }
    }

    fn current(&self) -> &Frame {
        // The sentinel is never popped.
        &self.frames[self.frames.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Frame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Frame labels from the top of the stack down, the sentinel excluded.
    fn chain(&self) -> Vec<String> {
        self.frames[1..].iter().rev().map(Frame::label).collect()
    }

    fn handle(&mut self, effect: Effect) {
        let outcome = self.validate(&effect).and_then(|()| self.dispatch(effect, 0));
        if let Err(error) = outcome {
            debug!(%error, frames = ?self.chain(), "operation failed");
            self.fail_current(error);
        }
    }

    fn fail_current(&mut self, error: Error) {
        let frame = self.current_mut();
        if frame.done {
            if let Err(existing) = &frame.result {
                warn!(%error, %existing, "deferred operation failed, keeping the earlier error");
                return;
            }
        }
        frame.result = Err(error);
    }

    fn validate(&self, effect: &Effect) -> Result<()> {
        let Effect::Operation(operation) = effect else {
            return Ok(());
        };

        if let Some(inner) = operation.wrapped() {
            self.validate(inner)?;
        }

        if let Operation::Terminal(inner) = operation {
            match inner.as_operation() {
                Some(Operation::Fork(_)) => {
                    return Err(Error::Validation("terminal forks are forbidden".into()))
                }
                Some(Operation::Defer(_)) => {
                    return Err(Error::Validation("terminal defers are forbidden".into()))
                }
                Some(Operation::Recover) => {
                    return Err(Error::Validation("terminal recovers are forbidden".into()))
                }
                Some(Operation::Terminal(_)) => {
                    return Err(Error::Validation("terminals cannot be nested".into()))
                }
                _ => {}
            }
        }

        match self.registry.validator(operation.kind()) {
            Some(validator) => validator.validate(operation),
            None => Ok(()),
        }
    }

    /// Push the frame servicing `effect`, trying plugin handlers from
    /// `first` on before falling back to the core operations.
    fn dispatch(&mut self, effect: Effect, first: usize) -> Result<()> {
        let operation = match effect {
            Effect::Operation(operation) => operation,
            Effect::Computation(computation) => {
                if !self.registry.has_handlers(kind::EXECUTE) {
                    self.push(Frame::new(computation, None));
                    return Ok(());
                }
                Operation::Execute(computation)
            }
        };

        let registry = Arc::clone(&self.registry);
        let selected = registry
            .handlers(operation.kind())
            .iter()
            .enumerate()
            .skip(first)
            .find(|(_, handler)| handler.filter(&operation, &self.ctx));

        let Some((index, handler)) = selected else {
            return self.core(operation);
        };

        let kind = operation.kind().to_owned();
        trace!(%kind, index, depth = self.frames.len(), "dispatching to handler");
        let computation = handler.handle(operation, &self.ctx);
        self.push(Frame::new(computation, Some(HandlerTag { kind, index })));
        Ok(())
    }

    fn core(&mut self, operation: Operation) -> Result<()> {
        match operation {
            Operation::Call { func, args } => {
                trace!(func = func.name(), "call");
                self.push(Frame::new(func.invoke(args), None));
            }
            Operation::Execute(computation) => self.push(Frame::new(computation, None)),
            Operation::Fork(effect) => {
                let signal = Arc::new(Signal::default());
                let stack = Stack::with_signal(
                    Arc::clone(&self.registry),
                    self.ctx.clone(),
                    Arc::clone(&signal),
                );
                let task = Task::spawn(stack.run(*effect), signal)?;
                debug!(task = %task.id(), "forked");
                self.set_value(Value::Task(task));
            }
            Operation::Start(effect) => return self.dispatch(*effect, 0),
            Operation::Defer(effect) => self.current_mut().defers.push(*effect),
            Operation::Recover => self.recover(),
            Operation::Terminal(effect) => {
                self.terminate_current()?;
                return self.dispatch(*effect, 0);
            }
            Operation::Generator => {
                let info = self.frame_info();
                self.set_value(Value::opaque(info));
            }
            Operation::Next { effect, terminal } => {
                let Some(tag) = &self.current().handler else {
                    return Err(Error::Type("next: should be used only in handlers".into()));
                };
                if tag.kind != effect.kind() {
                    return Err(Error::Type(format!(
                        "next: operation kind mismatch, expected \"{}\", received \"{}\"",
                        tag.kind,
                        effect.kind()
                    )));
                }
                let index = tag.index + 1;
                if terminal {
                    self.terminate_current()?;
                }
                return self.dispatch(*effect, index);
            }
            Operation::Custom(custom) => {
                return Err(Error::UnrecognizedOperation(custom.kind().to_owned()))
            }
        }
        Ok(())
    }

    /// Store `value` as the outcome of the current frame's pending effect.
    /// A finished frame keeps its result.
    fn set_value(&mut self, value: Value) {
        let frame = self.current_mut();
        if !frame.done {
            frame.result = Ok(value);
        }
    }

    fn recover(&mut self) {
        let Some((current, parents)) = self.frames.split_last_mut() else {
            return;
        };
        let Some(parent) = parents.last_mut() else {
            return;
        };
        if !parent.done || parent.result.is_ok() {
            return;
        }
        if let Err(error) = std::mem::replace(&mut parent.result, Ok(Value::Null)) {
            debug!(%error, "error recovered");
            current.result = Ok(Value::Error(error));
        }
    }

    /// Discard the current frame and its continuation.
    fn terminate_current(&mut self) -> Result<()> {
        if self.frames.len() <= 1 {
            return Err(Error::Validation(
                "terminal: no enclosing frame to terminate".into(),
            ));
        }
        if let Some(frame) = self.frames.pop() {
            if !frame.defers.is_empty() {
                warn!(
                    frame = %frame.label(),
                    defers = frame.defers.len(),
                    "terminated frame had pending defers, they will not run"
                );
            }
            trace!(frame = %frame.label(), "frame terminated");
        }
        Ok(())
    }

    fn frame_info(&self) -> FrameInfo {
        let frame = self.current();
        FrameInfo {
            name: frame.name.clone(),
            kind: frame.handler.as_ref().map(|tag| tag.kind.clone()),
            depth: self.frames.len() - 1,
        }
    }

    /// Pop finished frames, running their defers first.
    fn shift(&mut self) {
        while self.frames.len() > 1 {
            let frame = self.current_mut();

            if let Some(effect) = frame.defers.pop() {
                trace!(kind = effect.kind(), "running deferred operation");
                self.handle(effect);
                return;
            }

            let Some(finished) = self.frames.pop() else {
                return;
            };
            let parent = self.current_mut();

            if !parent.done {
                parent.result = finished.result;
                return;
            }

            // The parent is unwinding its defers: a deferred failure only
            // replaces a successful result.
            if let Err(error) = finished.result {
                if parent.result.is_ok() {
                    parent.result = Err(error);
                } else if let Err(existing) = &parent.result {
                    warn!(%error, %existing, "deferred operation failed, keeping the earlier error");
                }
            }
        }
    }
}
