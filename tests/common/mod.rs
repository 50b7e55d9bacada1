// Shared test helpers

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use cuillere::{Computation, Value};
use tracing_subscriber::EnvFilter;

/// Route runtime logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Log::default()
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// A computation appending `entry` to `log` when it runs.
pub fn record(log: &Log, entry: &str) -> Computation {
    let log = Arc::clone(log);
    let entry = entry.to_owned();
    Computation::new(move |_| async move {
        log.lock().unwrap().push(entry);
        Ok(Value::Null)
    })
}
