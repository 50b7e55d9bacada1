// Plugins and the handler table built from them
//
// A plugin contributes handlers (computation factories keyed by operation
// kind) and validators. The runtime flattens an ordered plugin list into a
// `Registry` once; the registry is then shared read-only by every stack.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::computation::Computation;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::operation::{Operation, NAMESPACE_PREFIX};

/// Services operations of one kind.
///
/// `handle` receives the operation by value and returns the computation run
/// in a new handler frame. `filter` lets a handler decline an operation, in
/// which case the next handler registered for the kind is tried.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, operation: Operation, ctx: &Context) -> Computation;

    fn filter(&self, _operation: &Operation, _ctx: &Context) -> bool {
        true
    }
}

/// Checks an operation before it is dispatched.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, operation: &Operation) -> Result<()>;
}

impl<F> Validator for F
where
    F: Fn(&Operation) -> Result<()> + Send + Sync + 'static,
{
    fn validate(&self, operation: &Operation) -> Result<()> {
        self(operation)
    }
}

struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(Operation, &Context) -> Computation + Send + Sync + 'static,
{
    fn handle(&self, operation: Operation, ctx: &Context) -> Computation {
        (self.0)(operation, ctx)
    }
}

struct Filtered<P, F> {
    filter: P,
    handle: F,
}

impl<P, F> Handler for Filtered<P, F>
where
    P: Fn(&Operation, &Context) -> bool + Send + Sync + 'static,
    F: Fn(Operation, &Context) -> Computation + Send + Sync + 'static,
{
    fn handle(&self, operation: Operation, ctx: &Context) -> Computation {
        (self.handle)(operation, ctx)
    }

    fn filter(&self, operation: &Operation, ctx: &Context) -> bool {
        (self.filter)(operation, ctx)
    }
}

/// A set of handlers and validators, optionally under a namespace
#[derive(Default)]
pub struct Plugin {
    namespace: Option<String>,
    handlers: Vec<(String, Arc<dyn Handler>)>,
    validators: Vec<(String, Arc<dyn Validator>)>,
}

impl Plugin {
    /// A plugin without a namespace: it may only handle qualified kinds.
    pub fn new() -> Self {
        Self::default()
    }

    /// A plugin owning `namespace`. Unqualified handler keys are registered
    /// as `"<namespace>/<key>"`.
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn handler<F>(self, key: impl Into<String>, handle: F) -> Self
    where
        F: Fn(Operation, &Context) -> Computation + Send + Sync + 'static,
    {
        self.handler_with(key, FnHandler(handle))
    }

    /// Register a handler that only accepts operations passing `filter`.
    pub fn filtered_handler<P, F>(self, key: impl Into<String>, filter: P, handle: F) -> Self
    where
        P: Fn(&Operation, &Context) -> bool + Send + Sync + 'static,
        F: Fn(Operation, &Context) -> Computation + Send + Sync + 'static,
    {
        self.handler_with(key, Filtered { filter, handle })
    }

    pub fn handler_with(mut self, key: impl Into<String>, handler: impl Handler) -> Self {
        self.handlers.push((key.into(), Arc::new(handler)));
        self
    }

    /// Register a validator for `"<namespace>/<key>"`; `key` must be
    /// unqualified.
    pub fn validator(mut self, key: impl Into<String>, validator: impl Validator) -> Self {
        self.validators.push((key.into(), Arc::new(validator)));
        self
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("namespace", &self.namespace)
            .field(
                "handlers",
                &self.handlers.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            )
            .field(
                "validators",
                &self.validators.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn is_qualified(key: &str) -> bool {
    key.starts_with(NAMESPACE_PREFIX)
}

/// Handler and validator tables, shared by every stack of a runtime
#[derive(Default)]
pub(crate) struct Registry {
    handlers: HashMap<String, Vec<Arc<dyn Handler>>>,
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl Registry {
    pub(crate) fn build(plugins: impl IntoIterator<Item = Plugin>) -> Result<Self> {
        let mut registry = Self::default();

        for plugin in plugins {
            if let Some(namespace) = &plugin.namespace {
                if !is_qualified(namespace) {
                    return Err(Error::Registration(format!(
                        "plugin namespace \"{namespace}\" should start with \"{NAMESPACE_PREFIX}\""
                    )));
                }
            }

            for (key, handler) in plugin.handlers {
                let kind = match (&plugin.namespace, is_qualified(&key)) {
                    (_, true) => key,
                    (Some(namespace), false) => format!("{namespace}/{key}"),
                    (None, false) => {
                        return Err(Error::Registration(format!(
                            "plugin without namespace must register qualified kinds, got \"{key}\""
                        )))
                    }
                };
                registry.handlers.entry(kind).or_default().push(handler);
            }

            if plugin.validators.is_empty() {
                continue;
            }
            let Some(namespace) = &plugin.namespace else {
                return Err(Error::Registration(
                    "plugin without namespace cannot register validators".into(),
                ));
            };
            for (key, validator) in plugin.validators {
                if is_qualified(&key) {
                    return Err(Error::Registration(format!(
                        "validator \"{key}\" of \"{namespace}\" should not be namespaced"
                    )));
                }
                registry
                    .validators
                    .insert(format!("{namespace}/{key}"), validator);
            }
        }

        Ok(registry)
    }

    /// Handlers registered for `kind`, in registration order.
    pub(crate) fn handlers(&self, kind: &str) -> &[Arc<dyn Handler>] {
        self.handlers.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn has_handlers(&self, kind: &str) -> bool {
        !self.handlers(kind).is_empty()
    }

    pub(crate) fn validator(&self, kind: &str) -> Option<&Arc<dyn Validator>> {
        self.validators.get(kind)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (kind.as_str(), handlers.len()))
            .collect();
        kinds.sort_unstable();
        f.debug_struct("Registry")
            .field("handlers", &kinds)
            .field("validators", &self.validators.len())
            .finish()
    }
}
