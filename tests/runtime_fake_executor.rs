// tests/runtime_fake_executor.rs

mod common;
use crate::common::{
    drain, events_channel, graph_for, id_of, init_tracing, runtime_channel, scheduler,
    task_states, with_timeout, BuildFileBuilder, FakeExecutor, FakeServices, ManualWatch, Script,
    ServiceConfigBuilder, TaskConfigBuilder,
};

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use taskrig::dag::{Selection, WorkGraph};
use taskrig::engine::{CancelSignal, RunSummary, Runtime, RuntimeEvent, ServiceState, TaskState};
use taskrig::watch::NoopWatch;

type TestResult = Result<(), Box<dyn Error>>;

fn chain() -> Arc<WorkGraph> {
    let file = BuildFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("echo A").build())
        .with_task("B", TaskConfigBuilder::new("echo B").dep("A").build())
        .with_task("C", TaskConfigBuilder::new("echo C").dep("B").build())
        .build();
    graph_for(Path::new("/p"), file, &Selection::Names(vec!["C".into()]))
}

#[tokio::test]
async fn chain_runs_to_completion_in_order() -> TestResult {
    init_tracing();
    let graph = chain();
    let (rt_tx, rt_rx) = runtime_channel();
    let (ev_tx, mut ev_rx) = events_channel();

    let executor = FakeExecutor::new(rt_tx.clone());
    let dispatched = executor.dispatched();
    let services = FakeServices::new(rt_tx.clone());

    let runtime = Runtime::new(
        scheduler(&graph, 4, false),
        rt_rx,
        executor,
        services,
        NoopWatch,
        ev_tx,
        CancelSignal::new(),
    );
    let summary = with_timeout(runtime.run()).await?;

    assert!(summary.success());
    assert_eq!(*dispatched.lock().unwrap(), ["A", "B", "C"]);

    let events = drain(&mut ev_rx);
    let states = task_states(&events, "A");
    assert_eq!(states.len(), 4);
    assert_eq!(states[..3], [TaskState::Starting, TaskState::Ready, TaskState::Running]);
    assert!(states[3].is_completed());
    Ok(())
}

#[tokio::test]
async fn crashed_dependency_never_runs_dependent() -> TestResult {
    init_tracing();
    let file = BuildFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("exit 1").build())
        .with_task("B", TaskConfigBuilder::new("echo B").dep("A").build())
        .build();
    let graph = graph_for(Path::new("/p"), file, &Selection::Names(vec!["B".into()]));

    let (rt_tx, rt_rx) = runtime_channel();
    let (ev_tx, mut ev_rx) = events_channel();
    let executor = FakeExecutor::new(rt_tx.clone()).script("A", Script::Crash(1));
    let dispatched = executor.dispatched();

    let runtime = Runtime::new(
        scheduler(&graph, 2, false),
        rt_rx,
        executor,
        FakeServices::new(rt_tx.clone()),
        NoopWatch,
        ev_tx,
        CancelSignal::new(),
    );
    let summary = with_timeout(runtime.run()).await?;

    assert!(!summary.success());
    assert_eq!(summary.tasks["A"], TaskState::Crashed { exit_code: 1 });
    assert_eq!(*dispatched.lock().unwrap(), ["A"]);

    let events = drain(&mut ev_rx);
    assert_eq!(task_states(&events, "B"), [TaskState::Canceled]);
    Ok(())
}

#[tokio::test]
async fn concurrency_is_bounded() -> TestResult {
    init_tracing();
    let mut builder = BuildFileBuilder::new();
    for name in ["t1", "t2", "t3", "t4", "t5"] {
        builder = builder.with_task(name, TaskConfigBuilder::new(&format!("echo {name}")).build());
    }
    let graph = graph_for(Path::new("/p"), builder.build(), &Selection::All);

    let (rt_tx, rt_rx) = runtime_channel();
    let (ev_tx, _ev_rx) = events_channel();
    let mut executor = FakeExecutor::new(rt_tx.clone());
    for name in ["t1", "t2", "t3", "t4", "t5"] {
        executor = executor.script(name, Script::Complete(Duration::from_millis(40)));
    }
    let max_running = executor.max_running();

    let runtime = Runtime::new(
        scheduler(&graph, 2, false),
        rt_rx,
        executor,
        FakeServices::new(rt_tx.clone()),
        NoopWatch,
        ev_tx,
        CancelSignal::new(),
    );
    let summary = with_timeout(runtime.run()).await?;

    assert!(summary.success());
    assert_eq!(max_running.load(Ordering::SeqCst), 2);
    Ok(())
}

async fn run_cancelled(script: Script, grace: Duration) -> RunSummary {
    let graph = chain();
    let (rt_tx, rt_rx) = runtime_channel();
    let (ev_tx, _ev_rx) = events_channel();
    let cancel = CancelSignal::new();

    let runtime = Runtime::new(
        scheduler(&graph, 1, false),
        rt_rx,
        FakeExecutor::new(rt_tx.clone()).script("A", script),
        FakeServices::new(rt_tx.clone()),
        NoopWatch,
        ev_tx,
        cancel.clone(),
    )
    .with_grace(grace);
    let handle = tokio::spawn(runtime.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    with_timeout(handle).await.unwrap().unwrap()
}

#[tokio::test]
async fn cancellation_stops_in_flight_tasks() {
    init_tracing();
    let summary = run_cancelled(Script::Hang, Duration::from_secs(5)).await;

    assert!(!summary.success());
    assert_eq!(summary.canceled().collect::<Vec<_>>(), ["A", "B", "C"]);
}

#[tokio::test]
async fn unresponsive_tasks_are_settled_after_grace() {
    init_tracing();
    let summary = run_cancelled(Script::Unresponsive, Duration::from_millis(100)).await;

    assert_eq!(summary.tasks["A"], TaskState::Canceled);
    assert!(!summary.success());
}

#[tokio::test]
async fn run_waits_for_cancelled_executions_to_unwind() {
    init_tracing();
    let graph = chain();
    let (rt_tx, rt_rx) = runtime_channel();
    let (ev_tx, _ev_rx) = events_channel();
    let cancel = CancelSignal::new();

    let executor = FakeExecutor::new(rt_tx.clone())
        .script("A", Script::SlowCleanup(Duration::from_millis(300)));
    let exited = executor.exited();

    let runtime = Runtime::new(
        scheduler(&graph, 1, false),
        rt_rx,
        executor,
        FakeServices::new(rt_tx.clone()),
        NoopWatch,
        ev_tx,
        cancel.clone(),
    )
    .with_grace(Duration::from_millis(50));
    let handle = tokio::spawn(runtime.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let summary = with_timeout(handle).await.unwrap().unwrap();

    // Settled after the grace period, but not returned before A unwound.
    assert_eq!(summary.tasks["A"], TaskState::Canceled);
    assert_eq!(exited.load(Ordering::SeqCst), 1);
}

fn with_service() -> Arc<WorkGraph> {
    let file = BuildFileBuilder::new()
        .with_service("db", ServiceConfigBuilder::image("postgres:16").build())
        .with_task("migrate", TaskConfigBuilder::new("migrate up").need("db").build())
        .build();
    graph_for(Path::new("/p"), file, &Selection::All)
}

#[tokio::test]
async fn services_start_before_and_stop_after_their_needers() -> TestResult {
    init_tracing();
    let graph = with_service();
    let (rt_tx, rt_rx) = runtime_channel();
    let (ev_tx, _ev_rx) = events_channel();

    let services = FakeServices::new(rt_tx.clone());
    let (started, stopped) = (services.started(), services.stopped());

    let runtime = Runtime::new(
        scheduler(&graph, 1, false),
        rt_rx,
        FakeExecutor::new(rt_tx.clone()),
        services,
        NoopWatch,
        ev_tx,
        CancelSignal::new(),
    );
    let summary = with_timeout(runtime.run()).await?;

    assert!(summary.success());
    assert_eq!(*started.lock().unwrap(), ["db"]);
    assert_eq!(*stopped.lock().unwrap(), [id_of(&graph, "db")]);
    assert_eq!(summary.services["db"], ServiceState::End { failure: None });
    Ok(())
}

#[tokio::test]
async fn failed_service_cancels_needers() -> TestResult {
    init_tracing();
    let graph = with_service();
    let (rt_tx, rt_rx) = runtime_channel();
    let (ev_tx, _ev_rx) = events_channel();

    let executor = FakeExecutor::new(rt_tx.clone());
    let dispatched = executor.dispatched();

    let runtime = Runtime::new(
        scheduler(&graph, 1, false),
        rt_rx,
        executor,
        FakeServices::new(rt_tx.clone()).fail("db", "health check failed after 3 attempts"),
        NoopWatch,
        ev_tx,
        CancelSignal::new(),
    );
    let summary = with_timeout(runtime.run()).await?;

    assert!(dispatched.lock().unwrap().is_empty());
    assert_eq!(summary.tasks["migrate"], TaskState::Canceled);
    assert_eq!(
        summary.services["db"],
        ServiceState::End {
            failure: Some("health check failed after 3 attempts".into())
        }
    );
    Ok(())
}

#[tokio::test]
async fn source_change_reruns_only_the_changed_task() -> TestResult {
    init_tracing();
    let file = BuildFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("node index.js").src("index.js").build())
        .with_task("sibling", TaskConfigBuilder::new("node other.js").src("other.js").build())
        .build();
    let graph = graph_for(Path::new("/p"), file, &Selection::All);

    let (rt_tx, rt_rx) = runtime_channel();
    let (ev_tx, _ev_rx) = events_channel();
    let cancel = CancelSignal::new();

    let executor = FakeExecutor::new(rt_tx.clone());
    let dispatched = executor.dispatched();
    let watch = ManualWatch::new();
    let subscribed = watch.subscribed();

    let runtime = Runtime::new(
        scheduler(&graph, 2, true),
        rt_rx,
        executor,
        FakeServices::new(rt_tx.clone()),
        watch,
        ev_tx,
        cancel.clone(),
    );
    let handle = tokio::spawn(runtime.run());

    with_timeout(async {
        while subscribed.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    rt_tx
        .send(RuntimeEvent::SourceChanged {
            node: id_of(&graph, "A"),
            path: PathBuf::from("/p/index.js"),
        })
        .await?;

    let count = |key: &str| dispatched.lock().unwrap().iter().filter(|k| *k == key).count();
    with_timeout(async {
        while count("A") < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    // Give a spurious re-run of the sibling a chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    let summary = with_timeout(handle).await??;

    assert_eq!(count("A"), 2);
    assert_eq!(count("sibling"), 1);
    assert!(summary.success());
    Ok(())
}
