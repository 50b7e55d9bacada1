//! Structured-concurrency effect-handler runtime
//!
//! Computations are async bodies that describe their effects as operations
//! and hand them to the runtime with `co.perform(..)`. The runtime routes each
//! operation through the handlers registered by plugins, falling back to a
//! fixed set of core operations: `call`, `execute`, `fork`, `start`, `defer`,
//! `recover`, `terminal`, `generator` and `next`.
//!
//! Every run drives an explicit stack of frames, one per suspended
//! computation, so handlers can delegate (`next`), cleanup can be scheduled
//! (`defer`) and caught (`recover`), and forked stacks can be awaited or
//! canceled (`Task`). `all`/`all_settled` and call batching are built on top
//! as plugins that every runtime carries.

pub mod batch;
pub mod computation;
pub mod concurrent;
pub mod config;
pub mod context;
pub mod error;
pub mod middleware;
pub mod operation;
pub mod plugin;
pub mod runtime;
mod stack;
pub mod task;
pub mod value;

// Re-export main APIs
pub use batch::{batched, batched_by, BatchConfig, BatchKey};
pub use computation::{Co, Computation, Function};
pub use concurrent::{all, all_settled, ConcurrentOperation};
pub use config::RuntimeConfig;
pub use context::Context;
pub use error::{Error, Result};
pub use operation::{
    call, defer, execute, fork, generator, kind, next, next_terminal, recover, start, terminal,
    Effect, Operation,
};
pub use plugin::{Handler, Plugin, Validator};
pub use runtime::Runtime;
pub use stack::FrameInfo;
pub use task::Task;
pub use value::{Settled, Value};
