// Task lifecycle around top-level runs

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cuillere::{Computation, Context, Error, Function, Runtime, Value};
use cuillere_task_manager::{executor_plugin, plugin, ListenerFailure, TaskListener, TaskManager};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    fail_complete: bool,
}

impl Recorder {
    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskListener for Recorder {
    async fn initialize(&self, _ctx: &Context) -> anyhow::Result<()> {
        self.record("initialize");
        Ok(())
    }

    async fn pre_complete(&self, result: &Value) -> anyhow::Result<()> {
        self.record(format!("pre_complete {result:?}"));
        Ok(())
    }

    async fn complete(&self, _result: &Value) -> anyhow::Result<()> {
        self.record("complete");
        if self.fail_complete {
            anyhow::bail!("commit failed");
        }
        Ok(())
    }

    async fn error(&self, error: &Error) -> anyhow::Result<()> {
        self.record(format!("error {error}"));
        Ok(())
    }

    async fn finalize(&self, error: Option<&Error>) -> anyhow::Result<()> {
        self.record(format!("finalize {}", error.is_some()));
        Ok(())
    }
}

struct Shared(Arc<Recorder>);

#[async_trait]
impl TaskListener for Shared {
    async fn initialize(&self, ctx: &Context) -> anyhow::Result<()> {
        self.0.initialize(ctx).await
    }

    async fn pre_complete(&self, result: &Value) -> anyhow::Result<()> {
        self.0.pre_complete(result).await
    }

    async fn complete(&self, result: &Value) -> anyhow::Result<()> {
        self.0.complete(result).await
    }

    async fn error(&self, error: &Error) -> anyhow::Result<()> {
        self.0.error(error).await
    }

    async fn finalize(&self, error: Option<&Error>) -> anyhow::Result<()> {
        self.0.finalize(error).await
    }
}

fn managed(recorder: &Arc<Recorder>) -> Arc<TaskManager> {
    init_tracing();
    Arc::new(TaskManager::default().with_listener(Shared(Arc::clone(recorder))))
}

fn answer() -> Function {
    Function::new("answer", |_| Computation::ready(42))
}

#[tokio::test]
async fn successful_task_runs_every_stage() {
    let recorder = Arc::new(Recorder::default());
    let runtime = Runtime::new([plugin(managed(&recorder))]).unwrap();

    let value = runtime.call(&answer(), Vec::<Value>::new()).await.unwrap();

    assert_eq!(value, Value::from(42));
    assert_eq!(
        recorder.events(),
        vec!["initialize", "pre_complete 42", "complete", "finalize false"]
    );
}

#[tokio::test]
async fn failed_task_runs_error_and_finalize() {
    let recorder = Arc::new(Recorder::default());
    let runtime = Runtime::new([plugin(managed(&recorder))]).unwrap();
    let failing = Function::new("failing", |_| Computation::fail(Error::msg("boom")));

    let error = runtime.call(&failing, Vec::<Value>::new()).await.unwrap_err();

    assert_eq!(error.to_string(), "boom");
    assert_eq!(
        recorder.events(),
        vec!["initialize", "error boom", "finalize true"]
    );
}

#[tokio::test]
async fn completion_failures_are_aggregated() {
    let recorder = Arc::new(Recorder {
        fail_complete: true,
        ..Recorder::default()
    });
    let runtime = Runtime::new([plugin(managed(&recorder))]).unwrap();

    let error = runtime.call(&answer(), Vec::<Value>::new()).await.unwrap_err();

    let failure = error.downcast_ref::<ListenerFailure>().unwrap();
    assert_eq!(failure.stage, "completion");
    assert_eq!(failure.causes.len(), 1);
    assert_eq!(recorder.events().last().map(String::as_str), Some("finalize true"));
}

#[tokio::test]
async fn executor_skips_contexts_without_manager() {
    struct Managed;

    let recorder = Arc::new(Recorder::default());
    let manager = managed(&recorder);
    let runtime = Runtime::new([executor_plugin(move |ctx| {
        ctx.downcast_ref::<Managed>().map(|_| Arc::clone(&manager))
    })])
    .unwrap();

    let value = runtime.call(&answer(), Vec::<Value>::new()).await.unwrap();
    assert_eq!(value, Value::from(42));
    assert!(recorder.events().is_empty());

    let managed_runtime = runtime.ctx(Context::new(Managed));
    managed_runtime.call(&answer(), Vec::<Value>::new()).await.unwrap();
    assert_eq!(recorder.events().first().map(String::as_str), Some("initialize"));
}
