// Frame-stack interpreter: dispatch, core operations and handler chains

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use common::{entries, init_tracing, log, record};
use cuillere::{
    call, defer, fork, generator, next, next_terminal, recover, start, terminal, Computation,
    Context, Error, FrameInfo, Function, Operation, Plugin, Runtime, Value,
};

const GREET: &str = "@test/greet";

fn runtime(plugins: impl IntoIterator<Item = Plugin>) -> Runtime {
    init_tracing();
    Runtime::new(plugins).unwrap()
}

fn no_args() -> Vec<Value> {
    Vec::new()
}

fn answer() -> Function {
    Function::new("answer", |_| Computation::ready(42))
}

fn greet(name: &str) -> Operation {
    Operation::new(GREET, name.to_owned())
}

/// `@test/greet` handler wrapping what the next handler answers.
fn wrapping(tag: &'static str) -> impl Fn(Operation, &Context) -> Computation + Send + Sync {
    move |operation, _ctx| {
        Computation::new(move |co| async move {
            let inner = co.perform(next(operation)).await?;
            Ok(Value::from(format!("{tag}({})", inner.as_str().unwrap_or_default())))
        })
    }
}

/// `@test/greet` handler answering from the payload.
fn answering(operation: Operation, _ctx: &Context) -> Computation {
    Computation::new(move |_| async move {
        let name: String = operation.into_payload()?;
        Ok(Value::from(format!("hello {name}")))
    })
}

#[tokio::test]
async fn call_runs_function_with_args() {
    let rt = runtime([]);
    let add = Function::new("add", |args| {
        Computation::new(move |_| async move {
            let sum: i64 = args.iter().filter_map(Value::as_int).sum();
            Ok(Value::from(sum))
        })
    });

    assert_eq!(rt.call(&add, [1, 2, 3]).await.unwrap(), Value::from(6));
}

#[tokio::test]
async fn errors_are_raised_into_the_caller() {
    let rt = runtime([]);
    let boom = Error::msg("boom");
    let failing = {
        let boom = boom.clone();
        Function::new("failing", move |_| Computation::fail(boom.clone()))
    };

    let catching = {
        let failing = failing.clone();
        Function::new("catching", move |_| {
            let failing = failing.clone();
            Computation::new(move |co| async move {
                match co.perform(call(&failing, no_args())).await {
                    Err(error) => Ok(Value::from(format!("caught {error}"))),
                    Ok(_) => Ok(Value::Null),
                }
            })
        })
    };
    assert_eq!(
        rt.call(&catching, no_args()).await.unwrap(),
        Value::from("caught boom")
    );

    let propagating = Function::new("propagating", move |_| {
        let failing = failing.clone();
        Computation::new(move |co| async move { co.perform(call(&failing, no_args())).await })
    });
    let error = rt.call(&propagating, no_args()).await.unwrap_err();
    assert!(error.same(&boom));
}

#[tokio::test]
async fn defers_run_last_in_first_out() {
    let rt = runtime([]);
    let log = log();

    let body = {
        let log = Arc::clone(&log);
        Computation::new(move |co| async move {
            co.perform(defer(record(&log, "first"))).await?;
            co.perform(defer(record(&log, "second"))).await?;
            log.lock().unwrap().push("body".into());
            Ok(Value::from(1))
        })
    };

    assert_eq!(rt.execute(body).await.unwrap(), Value::from(1));
    assert_eq!(entries(&log), ["body", "second", "first"]);
}

#[tokio::test]
async fn defers_run_when_the_frame_fails() {
    let rt = runtime([]);
    let log = log();
    let boom = Error::msg("boom");

    let body = {
        let (log, boom) = (Arc::clone(&log), boom.clone());
        Computation::new(move |co| async move {
            co.perform(defer(record(&log, "cleanup"))).await?;
            Err(boom)
        })
    };

    let error = rt.execute(body).await.unwrap_err();
    assert!(error.same(&boom));
    assert_eq!(entries(&log), ["cleanup"]);
}

#[tokio::test]
async fn deferred_errors_do_not_override_the_frame_error() {
    let rt = runtime([]);
    let boom = Error::msg("boom");

    let body = {
        let boom = boom.clone();
        Computation::new(move |co| async move {
            co.perform(defer(Computation::fail(Error::msg("cleanup failed"))))
                .await?;
            Err(boom)
        })
    };
    assert!(rt.execute(body).await.unwrap_err().same(&boom));

    let succeeding = Computation::new(|co| async move {
        co.perform(defer(Computation::fail(Error::msg("cleanup failed"))))
            .await?;
        Ok(Value::from(1))
    });
    let error = rt.execute(succeeding).await.unwrap_err();
    assert_eq!(error.to_string(), "cleanup failed");
}

#[tokio::test]
async fn recover_catches_the_error_of_the_deferring_frame() {
    let rt = runtime([]);
    let caught = Arc::new(Mutex::new(None));

    let body = {
        let caught = Arc::clone(&caught);
        Computation::new(move |co| async move {
            co.perform(defer(Computation::new(move |co| async move {
                let recovered = co.perform(recover()).await?;
                *caught.lock().unwrap() = recovered.as_error().map(ToString::to_string);
                Ok(Value::Null)
            })))
            .await?;
            Err(Error::msg("boom"))
        })
    };

    assert_eq!(rt.execute(body).await.unwrap(), Value::Null);
    assert_eq!(caught.lock().unwrap().as_deref(), Some("boom"));
}

#[tokio::test]
async fn recover_only_reaches_one_level() {
    let rt = runtime([]);
    let boom = Error::msg("boom");
    let recovering = Function::new("recovering", |_| {
        Computation::new(|co| async move { co.perform(recover()).await })
    });

    // The recovering function runs one frame below the deferred computation,
    // so the failed frame is its grandparent.
    let body = {
        let boom = boom.clone();
        Computation::new(move |co| async move {
            co.perform(defer(Computation::new(move |co| async move {
                co.perform(call(&recovering, no_args())).await
            })))
            .await?;
            Err(boom)
        })
    };

    assert!(rt.execute(body).await.unwrap_err().same(&boom));
}

#[tokio::test]
async fn terminal_replaces_the_current_frame() {
    let rt = runtime([]);
    let reached = Arc::new(AtomicBool::new(false));

    let inner = {
        let reached = Arc::clone(&reached);
        Function::new("inner", move |_| {
            let reached = Arc::clone(&reached);
            Computation::new(move |co| async move {
                let value = co.perform(terminal(call(&answer(), no_args()))).await?;
                reached.store(true, Ordering::SeqCst);
                Ok(value)
            })
        })
    };
    let outer = Computation::new(move |co| async move {
        let value = co.perform(call(&inner, no_args())).await?;
        Ok(Value::List(vec![value, "after".into()]))
    });

    assert_eq!(
        rt.execute(outer).await.unwrap(),
        Value::List(vec![42.into(), "after".into()])
    );
    assert!(!reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn invalid_terminals_fail_before_any_side_effect() {
    let rt = runtime([]);
    let ran = Arc::new(AtomicBool::new(false));
    let effect = || {
        let ran = Arc::clone(&ran);
        Computation::new(move |_| async move {
            ran.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        })
    };

    let invalid = [
        terminal(fork(effect())),
        terminal(defer(effect())),
        terminal(recover()),
        terminal(terminal(effect())),
    ];
    for operation in invalid {
        let error = rt.start(operation).await.unwrap_err();
        assert!(matches!(error, Error::Validation(_)), "{error}");
    }

    tokio::task::yield_now().await;
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn terminal_needs_an_enclosing_frame() {
    let rt = runtime([]);
    let error = rt.start(terminal(call(&answer(), no_args()))).await.unwrap_err();
    assert!(matches!(error, Error::Validation(_)));
}

#[tokio::test]
async fn start_dispatches_in_place() {
    let rt = runtime([]);
    let body = Computation::new(|co| async move { co.perform(start(call(&answer(), no_args()))).await });
    assert_eq!(rt.execute(body).await.unwrap(), Value::from(42));
}

#[tokio::test]
async fn handlers_delegate_in_registration_order() {
    let rt = runtime([
        Plugin::namespaced("@test").handler("greet", wrapping("a")),
        Plugin::namespaced("@other")
            .handler(GREET, wrapping("b"))
            .handler(GREET, answering),
    ]);

    assert_eq!(
        rt.start(greet("ada")).await.unwrap(),
        Value::from("a(b(hello ada))")
    );
}

#[tokio::test]
async fn next_falls_through_to_unrecognized() {
    let rt = runtime([Plugin::namespaced("@test").handler("greet", wrapping("a"))]);

    let error = rt.start(greet("ada")).await.unwrap_err();
    assert!(matches!(error, Error::UnrecognizedOperation(kind) if kind == GREET));
}

#[tokio::test]
async fn next_terminal_discards_the_delegating_handler() {
    let reached = Arc::new(AtomicBool::new(false));
    let delegating = {
        let reached = Arc::clone(&reached);
        move |operation: Operation, _ctx: &Context| {
            let reached = Arc::clone(&reached);
            Computation::new(move |co| async move {
                let value = co.perform(next_terminal(operation)).await?;
                reached.store(true, Ordering::SeqCst);
                Ok(value)
            })
        }
    };
    let rt = runtime([Plugin::namespaced("@test")
        .handler("greet", delegating)
        .handler("greet", answering)]);

    assert_eq!(rt.start(greet("bob")).await.unwrap(), Value::from("hello bob"));
    assert!(!reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn next_rejects_a_different_kind() {
    let rt = runtime([Plugin::namespaced("@test")
        .handler("greet", |_operation, _ctx| {
            Computation::new(|co| async move {
                co.perform(next(Operation::new("@test/other", ()))).await
            })
        })
        .handler("other", answering)]);

    let error = rt.start(greet("ada")).await.unwrap_err();
    assert!(matches!(error, Error::Type(_)), "{error}");
}

#[tokio::test]
async fn next_is_only_valid_in_handlers() {
    let rt = runtime([]);
    let body = Computation::new(|co| async move { co.perform(next(greet("ada"))).await });

    let error = rt.execute(body).await.unwrap_err();
    assert!(matches!(error, Error::Type(_)), "{error}");
}

#[tokio::test]
async fn unknown_kinds_are_unrecognized() {
    let rt = runtime([]);
    let error = rt.start(Operation::new("@test/unknown", ())).await.unwrap_err();
    assert!(matches!(error, Error::UnrecognizedOperation(kind) if kind == "@test/unknown"));
}

#[tokio::test]
async fn validators_run_before_handlers() {
    let handled = Arc::new(AtomicBool::new(false));
    let handler = {
        let handled = Arc::clone(&handled);
        move |operation: Operation, ctx: &Context| {
            handled.store(true, Ordering::SeqCst);
            answering(operation, ctx)
        }
    };
    let rt = runtime([Plugin::namespaced("@test")
        .handler("greet", handler)
        .validator("greet", |operation: &Operation| {
            match operation.payload::<String>() {
                Some(name) if !name.is_empty() => Ok(()),
                _ => Err(Error::Validation("greet: empty name".into())),
            }
        })]);

    let error = rt.start(greet("")).await.unwrap_err();
    assert!(matches!(error, Error::Validation(_)));
    assert!(!handled.load(Ordering::SeqCst));

    assert_eq!(rt.start(greet("eve")).await.unwrap(), Value::from("hello eve"));
}

#[tokio::test]
async fn validators_see_wrapped_operations() {
    let rt = runtime([Plugin::namespaced("@test")
        .handler("greet", answering)
        .validator("greet", |_: &Operation| -> cuillere::Result<()> {
            Err(Error::Validation("greet: disabled".into()))
        })]);

    let body = Computation::new(|co| async move { co.perform(start(greet("ada"))).await });
    let error = rt.execute(body).await.unwrap_err();
    assert!(matches!(error, Error::Validation(_)));
}

#[tokio::test]
async fn filtered_handlers_decline_operations() {
    let rt = runtime([
        Plugin::namespaced("@test").filtered_handler(
            "greet",
            |operation, _ctx| {
                operation
                    .payload::<String>()
                    .is_some_and(|name| name.starts_with('a'))
            },
            wrapping("filtered"),
        ),
        Plugin::namespaced("@other").handler(GREET, answering),
    ]);

    assert_eq!(
        rt.start(greet("ada")).await.unwrap(),
        Value::from("filtered(hello ada)")
    );
    assert_eq!(rt.start(greet("bob")).await.unwrap(), Value::from("hello bob"));
}

#[tokio::test]
async fn generator_describes_the_current_frame() {
    let rt = runtime([Plugin::namespaced("@test").handler("greet", |_operation, _ctx| {
        Computation::new(|co| async move { co.perform(generator()).await })
    })]);

    let inspect = Function::new("inspect", |_| {
        Computation::new(|co| async move {
            let own = co.perform(generator()).await?;
            let handler = co.perform(greet("ada")).await?;
            Ok(Value::List(vec![own, handler]))
        })
    });

    let infos = rt.call(&inspect, no_args()).await.unwrap().into_list().unwrap();
    let infos: Vec<FrameInfo> = infos
        .iter()
        .map(|info| info.downcast_ref::<FrameInfo>().cloned().unwrap())
        .collect();

    assert_eq!(
        infos,
        vec![
            FrameInfo {
                name: Some("inspect".into()),
                kind: None,
                depth: 1,
            },
            FrameInfo {
                name: None,
                kind: Some(GREET.into()),
                depth: 2,
            },
        ]
    );
}

#[tokio::test]
async fn bare_computations_nest() {
    let rt = runtime([]);
    let body = Computation::new(|co| async move {
        let inner = co.perform(Computation::ready(20)).await?;
        Ok(Value::from(inner.as_int().unwrap_or_default() + 1))
    });
    assert_eq!(rt.execute(body).await.unwrap(), Value::from(21));
}
