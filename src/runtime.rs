// Runtime facade
//
// A runtime owns the handler table built from its plugins. Each context gets
// its own facade sharing that table; facades are memoized per context in a
// bounded LRU so a given context keeps yielding the same facade while cached.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::batch;
use crate::computation::{Computation, Function};
use crate::concurrent;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::Result;
use crate::operation::{self, kind, Effect};
use crate::plugin::{Plugin, Registry};
use crate::stack::Stack;
use crate::value::Value;

struct Scope {
    ctx: Context,
}

struct Shared {
    registry: Arc<Registry>,
    scopes: Mutex<VecDeque<Arc<Scope>>>,
    capacity: usize,
}

impl Shared {
    fn scope(&self, ctx: Context) -> Arc<Scope> {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(position) = scopes.iter().position(|scope| scope.ctx.ptr_eq(&ctx)) {
            if let Some(scope) = scopes.remove(position) {
                scopes.push_back(Arc::clone(&scope));
                return scope;
            }
        }

        let scope = Arc::new(Scope { ctx });
        if self.capacity == 0 {
            return scope;
        }
        while scopes.len() >= self.capacity {
            scopes.pop_front();
        }
        scopes.push_back(Arc::clone(&scope));
        scope
    }
}

/// Entry point for running computations.
///
/// Cloning a runtime is cheap: clones share the handler table and the
/// context cache.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
    scope: Arc<Scope>,
}

impl Runtime {
    /// Build a runtime from `plugins` with the default configuration.
    ///
    /// The batch and concurrency plugins are appended to the list.
    pub fn new(plugins: impl IntoIterator<Item = Plugin>) -> Result<Self> {
        Self::with_config(RuntimeConfig::default(), plugins)
    }

    pub fn with_config(
        config: RuntimeConfig,
        plugins: impl IntoIterator<Item = Plugin>,
    ) -> Result<Self> {
        let plugins = plugins
            .into_iter()
            .chain([batch::plugin(config.batch), concurrent::plugin()]);
        let registry = Arc::new(Registry::build(plugins)?);
        debug!(?registry, "runtime built");

        let shared = Arc::new(Shared {
            registry,
            scopes: Mutex::new(VecDeque::new()),
            capacity: config.context_cache_capacity,
        });
        let scope = shared.scope(Context::empty());
        Ok(Self { shared, scope })
    }

    /// The facade for `ctx`, sharing this runtime's handlers.
    pub fn ctx(&self, ctx: Context) -> Runtime {
        Self {
            shared: Arc::clone(&self.shared),
            scope: self.shared.scope(ctx),
        }
    }

    pub fn context(&self) -> &Context {
        &self.scope.ctx
    }

    /// Whether both handles are the same facade.
    pub fn same_instance(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.scope, &other.scope)
    }

    /// Run `effect` on a new stack.
    ///
    /// When a plugin handles the core `start` kind, the effect is submitted
    /// wrapped in `start` so that plugin sees every run.
    pub fn start(
        &self,
        effect: impl Into<Effect>,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let registry = Arc::clone(&self.shared.registry);
        let effect = effect.into();
        let effect = if registry.has_handlers(kind::START) {
            operation::start(effect).into()
        } else {
            effect
        };
        Stack::new(registry, self.scope.ctx.clone()).run(effect)
    }

    pub fn call<I, V>(
        &self,
        func: &Function,
        args: I,
    ) -> impl Future<Output = Result<Value>> + Send + 'static
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.start(operation::call(func, args))
    }

    pub fn execute(
        &self,
        computation: Computation,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        self.start(computation)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.shared.registry)
            .field("context", &self.scope.ctx)
            .finish()
    }
}
