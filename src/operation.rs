// Operations: declarative descriptions of effects
//
// Core operations form a closed enum with fixed semantics; plugin operations
// are `Custom` values identified by a namespaced kind string and carrying a
// type-erased payload that their handlers downcast.

use std::any::{type_name, Any};
use std::fmt;

use crate::computation::{Computation, Function};
use crate::error::{Error, Result};
use crate::value::Value;

/// Prefix every namespace must start with.
pub const NAMESPACE_PREFIX: &str = "@";

/// Namespace of the core operations.
pub const CORE_NAMESPACE: &str = "@cuillere/core";

/// Kinds of the core operations
pub mod kind {
    pub const CALL: &str = "@cuillere/core/call";
    pub const EXECUTE: &str = "@cuillere/core/execute";
    pub const FORK: &str = "@cuillere/core/fork";
    pub const START: &str = "@cuillere/core/start";
    pub const DEFER: &str = "@cuillere/core/defer";
    pub const RECOVER: &str = "@cuillere/core/recover";
    pub const TERMINAL: &str = "@cuillere/core/terminal";
    pub const GENERATOR: &str = "@cuillere/core/generator";
    pub const NEXT: &str = "@cuillere/core/next";
}

/// Anything a computation may yield
pub enum Effect {
    Operation(Operation),
    /// A bare computation, handled as an `execute` operation.
    Computation(Computation),
}

impl Effect {
    /// Kind under which the effect is dispatched.
    pub fn kind(&self) -> &str {
        match self {
            Effect::Operation(operation) => operation.kind(),
            Effect::Computation(_) => kind::EXECUTE,
        }
    }

    pub fn as_operation(&self) -> Option<&Operation> {
        match self {
            Effect::Operation(operation) => Some(operation),
            Effect::Computation(_) => None,
        }
    }
}

impl From<Operation> for Effect {
    fn from(operation: Operation) -> Self {
        Effect::Operation(operation)
    }
}

impl From<Computation> for Effect {
    fn from(computation: Computation) -> Self {
        Effect::Computation(computation)
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Operation(operation) => operation.fmt(f),
            Effect::Computation(computation) => computation.fmt(f),
        }
    }
}

/// A tagged effect description
pub enum Operation {
    /// Invoke `func` with `args` and run the resulting computation.
    Call { func: Function, args: Vec<Value> },
    /// Run a computation as a nested frame.
    Execute(Computation),
    /// Run the effect on an independent stack, yielding a `Task`.
    Fork(Box<Effect>),
    /// Dispatch the effect in place of this operation.
    Start(Box<Effect>),
    /// Run the effect when the current frame finishes.
    Defer(Box<Effect>),
    /// Turn the error of the frame being unwound into a value.
    Recover,
    /// Discard the current frame, then dispatch the effect on its parent.
    Terminal(Box<Effect>),
    /// Describe the current frame.
    Generator,
    /// Delegate to the next handler of the same kind.
    Next { effect: Box<Effect>, terminal: bool },
    /// Plugin-defined operation.
    Custom(CustomOperation),
}

/// A plugin-defined operation: a kind and an opaque payload
pub struct CustomOperation {
    kind: String,
    payload: Box<dyn Any + Send>,
    payload_type: &'static str,
}

impl CustomOperation {
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl Operation {
    /// Build a plugin operation of the given fully qualified kind.
    pub fn new<T: Any + Send>(kind: impl Into<String>, payload: T) -> Self {
        Operation::Custom(CustomOperation {
            kind: kind.into(),
            payload: Box::new(payload),
            payload_type: type_name::<T>(),
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            Operation::Call { .. } => kind::CALL,
            Operation::Execute(_) => kind::EXECUTE,
            Operation::Fork(_) => kind::FORK,
            Operation::Start(_) => kind::START,
            Operation::Defer(_) => kind::DEFER,
            Operation::Recover => kind::RECOVER,
            Operation::Terminal(_) => kind::TERMINAL,
            Operation::Generator => kind::GENERATOR,
            Operation::Next { .. } => kind::NEXT,
            Operation::Custom(custom) => &custom.kind,
        }
    }

    /// The operation wrapped by `fork`, `start`, `defer`, `terminal` or `next`.
    pub fn wrapped(&self) -> Option<&Effect> {
        match self {
            Operation::Fork(effect)
            | Operation::Start(effect)
            | Operation::Defer(effect)
            | Operation::Terminal(effect)
            | Operation::Next { effect, .. } => Some(effect),
            _ => None,
        }
    }

    /// Borrow the payload of a plugin operation.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        match self {
            Operation::Custom(custom) => custom.payload.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Take the payload of a plugin operation.
    pub fn into_payload<T: Any>(self) -> Result<T> {
        let kind = self.kind().to_owned();
        match self {
            Operation::Custom(custom) => {
                let found = custom.payload_type;
                custom.payload.downcast::<T>().map(|payload| *payload).map_err(|_| {
                    Error::Type(format!(
                        "operation \"{kind}\" carries {found}, expected {}",
                        type_name::<T>()
                    ))
                })
            }
            _ => Err(Error::Type(format!(
                "core operation \"{kind}\" has no plugin payload"
            ))),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Call { func, args } => f
                .debug_struct("Call")
                .field("func", func)
                .field("args", args)
                .finish(),
            Operation::Next { effect, terminal } => f
                .debug_struct("Next")
                .field("effect", effect)
                .field("terminal", terminal)
                .finish(),
            Operation::Custom(custom) => f
                .debug_struct("Custom")
                .field("kind", &custom.kind)
                .field("payload", &custom.payload_type)
                .finish(),
            other => match other.wrapped() {
                Some(effect) => f.debug_tuple(other.kind()).field(effect).finish(),
                None => f.write_str(other.kind()),
            },
        }
    }
}

/// Call `func` with `args`.
pub fn call<I, V>(func: &Function, args: I) -> Operation
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    Operation::Call {
        func: func.clone(),
        args: args.into_iter().map(Into::into).collect(),
    }
}

pub fn execute(computation: Computation) -> Operation {
    Operation::Execute(computation)
}

/// Start `effect` on an independent stack; the operation's value is a `Task`.
pub fn fork(effect: impl Into<Effect>) -> Operation {
    Operation::Fork(Box::new(effect.into()))
}

pub fn start(effect: impl Into<Effect>) -> Operation {
    Operation::Start(Box::new(effect.into()))
}

/// Schedule `effect` to run when the current frame finishes, success or not.
pub fn defer(effect: impl Into<Effect>) -> Operation {
    Operation::Defer(Box::new(effect.into()))
}

/// From a deferred computation, catch the error of the frame being unwound.
pub fn recover() -> Operation {
    Operation::Recover
}

/// Discard the rest of the current computation and dispatch `effect` in its
/// place.
pub fn terminal(effect: impl Into<Effect>) -> Operation {
    Operation::Terminal(Box::new(effect.into()))
}

pub fn generator() -> Operation {
    Operation::Generator
}

/// From a handler, delegate `effect` to the next handler of the same kind.
pub fn next(effect: impl Into<Effect>) -> Operation {
    Operation::Next {
        effect: Box::new(effect.into()),
        terminal: false,
    }
}

/// Like [`next`], discarding the current handler frame first.
pub fn next_terminal(effect: impl Into<Effect>) -> Operation {
    Operation::Next {
        effect: Box::new(effect.into()),
        terminal: true,
    }
}
