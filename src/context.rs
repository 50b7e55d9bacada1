// Caller-supplied context shared by every stack of a runtime facade

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Arbitrary caller-supplied object handed to every handler and filter.
///
/// Identity is the identity of the underlying allocation: clones of a
/// `Context` are the same context, two `Context::new` calls never are.
/// The runtime imposes no locking on what the context holds.
#[derive(Clone)]
pub struct Context(Arc<dyn Any + Send + Sync>);

impl Context {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Share an existing allocation as a context.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    /// A fresh context carrying nothing.
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Context")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}
