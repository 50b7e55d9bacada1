// Runtime configuration

use serde::Deserialize;

use crate::batch::BatchConfig;

/// Default number of per-context facades kept by a runtime.
pub const DEFAULT_CONTEXT_CACHE_CAPACITY: usize = 256;

/// Configuration of a [`Runtime`](crate::Runtime)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of contexts whose facade is memoized.
    pub context_cache_capacity: usize,
    /// Window of the built-in batch plugin.
    pub batch: BatchConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context_cache_capacity: DEFAULT_CONTEXT_CACHE_CAPACITY,
            batch: BatchConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_batch_timeout(mut self, timeout_ms: u64) -> Self {
        self.batch.timeout_ms = timeout_ms;
        self
    }

    pub fn with_context_cache_capacity(mut self, capacity: usize) -> Self {
        self.context_cache_capacity = capacity;
        self
    }
}
