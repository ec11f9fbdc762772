//! Integration tests for task dispatch on thread workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{StreamExt, stream};
use serde_json::{Value, json};
use tandem_core::{
    Cause, Dispatcher, Error, ErrorRegistry, Exception, Invocation, Module, ModuleRegistry,
    Payload, PoolConfig, RunOptions, Step, StreamGenerator, WorkerPool,
};

fn modules(calls: Arc<AtomicUsize>) -> ModuleRegistry {
    ModuleRegistry::new()
        .with(
            "math",
            Module::new()
                .function("default", |args| {
                    let sum: i64 = args.iter().filter_map(|a| a.as_value().and_then(Value::as_i64)).sum();
                    Invocation::value(json!(sum))
                })
                .function("slow", move |args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let ms = args.first().and_then(|a| a.as_value()).and_then(Value::as_u64).unwrap_or(100);
                    Invocation::deferred(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok(Payload::Value(json!(ms)))
                    })
                }),
        )
        .with(
            "gen",
            Module::new()
                .function("count", |_| {
                    let items = (1..=3).map(|i| Ok(Payload::Value(json!(i))));
                    Invocation::stream(StreamGenerator::new(stream::iter(items)).returning(json!("done")))
                })
                .function("forever", |_| {
                    let ticks = stream::unfold(0u64, |tick| async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Some((Ok(Payload::Value(json!(tick))), tick + 1))
                    });
                    Invocation::stream(StreamGenerator::new(ticks))
                }),
        )
        .with(
            "fail",
            Module::new()
                .function("custom", |_| {
                    Invocation::error(
                        Exception::of_kind("QuotaError", "over quota")
                            .with_field("code", 429)
                            .with_cause(Exception::type_error("limit reached")),
                    )
                })
                .function("hang", |_| {
                    Invocation::deferred(std::future::pending::<Result<Payload, Exception>>())
                }),
        )
}

fn dispatcher(max_workers: usize) -> (Dispatcher, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut errors = ErrorRegistry::with_builtins();
    errors.register("QuotaError", |exception| exception);
    let pool = WorkerPool::with_errors(
        PoolConfig::default().with_max_workers(max_workers).unwrap(),
        modules(Arc::clone(&calls)),
        errors,
    );
    (Dispatcher::new(pool), calls)
}

#[tokio::test]
async fn test_run_returns_result() {
    let (dispatcher, _) = dispatcher(2);
    let mut task = dispatcher
        .run("math", vec![json!(20).into(), json!(22).into()], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(task.result().await.unwrap().into_json(), json!(42));
}

/// With N workers, N+1 concurrent calls take about two rounds.
#[tokio::test]
async fn test_saturated_pool_waits_for_a_worker() {
    let (dispatcher, calls) = dispatcher(2);
    let start = Instant::now();

    let runs = (0..3).map(|_| {
        let dispatcher = dispatcher.clone();
        async move {
            let mut task = dispatcher
                .run("math", vec![json!(200).into()], RunOptions::call("slow").with_keep_alive(true))
                .await?;
            task.result().await
        }
    });
    let results = futures::future::join_all(runs).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(400));
    assert!(dispatcher.pool().live_count() <= 2);
    assert_eq!(dispatcher.pool().spawned_total(), 2);
}

#[tokio::test]
async fn test_iterate_yields_values_and_return() {
    let (dispatcher, _) = dispatcher(1);
    let mut task = dispatcher.run("gen", vec![], RunOptions::call("count")).await.unwrap();

    let mut stream = task.iterate().unwrap();
    let mut seen = Vec::new();
    while let Some(item) = stream.next().await {
        seen.push(item.unwrap().into_json());
    }
    assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(stream.return_value().cloned().map(Payload::into_json), Some(json!("done")));
    assert!(stream.is_finished());
}

#[tokio::test]
async fn test_result_and_iterate_are_exclusive() {
    let (dispatcher, _) = dispatcher(1);
    let mut task = dispatcher.run("math", vec![json!(1).into()], RunOptions::default()).await.unwrap();
    task.result().await.unwrap();
    assert!(matches!(task.iterate(), Err(Error::Protocol(_))));

    let mut task = dispatcher.run("gen", vec![], RunOptions::call("count")).await.unwrap();
    assert!(matches!(task.result().await, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn test_timeout_terminates_worker() {
    let (dispatcher, _) = dispatcher(1);
    let mut task = dispatcher
        .run(
            "fail",
            vec![],
            RunOptions::call("hang")
                .with_timeout(Duration::from_millis(100))
                .with_keep_alive(true),
        )
        .await
        .unwrap();

    match task.result().await {
        Err(Error::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(100)),
        other => panic!("expected a timeout, got {:?}", other),
    }
    // Timed-out workers are discarded even with keep_alive.
    assert_eq!(dispatcher.pool().live_count(), 0);
}

#[tokio::test]
async fn test_abort_fails_pending_result() {
    let (dispatcher, _) = dispatcher(1);
    let mut task = dispatcher.run("fail", vec![], RunOptions::call("hang")).await.unwrap();
    task.abort();
    assert!(matches!(task.result().await, Err(Error::Aborted)));
    assert_eq!(dispatcher.pool().live_count(), 0);
}

#[tokio::test]
async fn test_abort_ends_endless_stream() {
    let (dispatcher, _) = dispatcher(1);
    let mut task = dispatcher.run("gen", vec![], RunOptions::call("forever")).await.unwrap();
    let mut stream = task.iterate().unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap().into_json(), json!(0));
    task.abort();
    // Values already in flight may still arrive; the stream then ends cleanly.
    let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .unwrap();
    assert!(rest.iter().all(Result::is_ok));
}

#[tokio::test]
async fn test_custom_error_keeps_kind_fields_and_cause() {
    let (dispatcher, _) = dispatcher(1);
    let mut task = dispatcher.run("fail", vec![], RunOptions::call("custom")).await.unwrap();

    let Err(Error::Remote(exception)) = task.result().await else {
        panic!("expected a remote error");
    };
    assert_eq!(exception.kind(), "QuotaError");
    assert_eq!(exception.message(), "over quota");
    assert_eq!(exception.field("code"), Some(&json!(429)));
    let Some(Cause::Exception(cause)) = exception.cause() else {
        panic!("expected an error cause");
    };
    assert_eq!(cause.kind(), "TypeError");
}

#[tokio::test]
async fn test_missing_module_and_function() {
    let (dispatcher, _) = dispatcher(1);

    let mut task = dispatcher.run("nowhere", vec![], RunOptions::default()).await.unwrap();
    let Err(Error::Remote(missing)) = task.result().await else {
        panic!("expected a remote error");
    };
    assert_eq!(missing.field("code"), Some(&json!("ERR_MODULE_NOT_FOUND")));

    let mut task = dispatcher.run("math", vec![], RunOptions::call("nope")).await.unwrap();
    let Err(Error::Remote(not_a_function)) = task.result().await else {
        panic!("expected a remote error");
    };
    assert_eq!(not_a_function.kind(), "TypeError");
}

#[tokio::test]
async fn test_generator_session_steps() {
    let (dispatcher, _) = dispatcher(1);
    let mut session = dispatcher
        .start("gen", vec![], RunOptions::call("count").with_keep_alive(true))
        .await
        .unwrap();

    let first = session.next(Payload::null()).await.unwrap();
    assert!(matches!(first, Step::Yielded(ref v) if v.as_value() == Some(&json!(1))));

    let finished = session.return_value(json!("early").into()).await.unwrap();
    assert!(finished.is_complete());
    assert_eq!(finished.into_payload().into_json(), json!("early"));
    assert!(session.is_finished());

    // Completed sessions keep answering with null.
    let after = session.next(Payload::null()).await.unwrap();
    assert!(after.is_complete());
    assert_eq!(dispatcher.pool().idle_count(), 1);
}

#[tokio::test]
async fn test_generator_session_on_plain_function() {
    let (dispatcher, _) = dispatcher(1);
    let mut session = dispatcher
        .start("math", vec![json!(2).into(), json!(2).into()], RunOptions::default())
        .await
        .unwrap();
    assert!(session.is_finished());
    let step = session.next(Payload::null()).await.unwrap();
    assert_eq!(step.into_payload().into_json(), json!(4));
}

#[tokio::test]
async fn test_throw_into_session() {
    let (dispatcher, _) = dispatcher(1);
    let mut session = dispatcher.start("gen", vec![], RunOptions::call("count")).await.unwrap();
    session.next(Payload::null()).await.unwrap();

    let Err(Error::Remote(thrown)) = session.throw(Exception::of_kind("RangeError", "stop")).await else {
        panic!("expected the thrown error back");
    };
    assert_eq!(thrown.kind(), "RangeError");
    assert_eq!(thrown.message(), "stop");
    assert!(session.is_finished());
}

/// Dropping a handle frees its worker for the next caller.
#[tokio::test]
async fn test_dropped_handle_releases_worker() {
    let (dispatcher, _) = dispatcher(1);
    let task = dispatcher.run("gen", vec![], RunOptions::call("forever")).await.unwrap();
    drop(task);

    let mut next = tokio::time::timeout(
        Duration::from_secs(2),
        dispatcher.run("math", vec![json!(3).into(), json!(4).into()], RunOptions::default()),
    )
    .await
    .expect("worker was never released")
    .unwrap();
    assert_eq!(next.result().await.unwrap().into_json(), json!(7));
}

#[tokio::test]
async fn test_cancelled_result_releases_worker() {
    let (dispatcher, _) = dispatcher(1);
    let mut task = dispatcher.run("fail", vec![], RunOptions::call("hang")).await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(50), task.result()).await.is_err());

    let mut next = tokio::time::timeout(
        Duration::from_secs(2),
        dispatcher.run("math", vec![json!(1).into()], RunOptions::default()),
    )
    .await
    .expect("worker was never released")
    .unwrap();
    assert_eq!(next.result().await.unwrap().into_json(), json!(1));
}

/// The timeout also bounds the wait for a worker.
#[tokio::test]
async fn test_timeout_covers_waiting_for_a_worker() {
    let (dispatcher, _) = dispatcher(1);
    let _busy = dispatcher.run("gen", vec![], RunOptions::call("forever")).await.unwrap();

    let waited = tokio::time::timeout(
        Duration::from_secs(2),
        dispatcher.run(
            "math",
            vec![json!(1).into()],
            RunOptions::default().with_timeout(Duration::from_millis(100)),
        ),
    )
    .await
    .expect("acquisition ignored the timeout");
    match waited {
        Err(Error::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(100)),
        other => panic!("expected a timeout, got {:?}", other.map(|_| ())),
    }
    assert_eq!(dispatcher.pool().waiting_count(), 0);
    assert_eq!(dispatcher.pool().live_count(), 1);
}

#[tokio::test]
async fn test_timeout_ends_iteration_with_error() {
    let (dispatcher, _) = dispatcher(1);
    let mut task = dispatcher
        .run("gen", vec![], RunOptions::call("forever").with_timeout(Duration::from_millis(100)))
        .await
        .unwrap();
    let stream = task.iterate().unwrap();

    let items: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .unwrap();
    let (last, values) = items.split_last().unwrap();
    assert!(!values.is_empty());
    assert!(values.iter().all(Result::is_ok));
    assert!(matches!(last, Err(Error::Timeout(_))));
    assert_eq!(dispatcher.pool().live_count(), 0);
}
