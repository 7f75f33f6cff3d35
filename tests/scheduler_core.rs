// tests/scheduler_core.rs
//
// Drives the pure scheduling core by hand, one event at a time.

mod common;
use crate::common::{graph_for, id_of, scheduler, BuildFileBuilder, ServiceConfigBuilder, TaskConfigBuilder};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use taskrig::dag::{Selection, WorkGraph};
use taskrig::engine::{
    CoreCommand, RunEvent, RuntimeEvent, Scheduler, SchedulerStep, ServiceState, TaskOutcome,
    TaskPhase, TaskState,
};
use taskrig::errors::SchedulerError;
use taskrig::types::NodeId;

fn done() -> TaskOutcome {
    TaskOutcome::Completed {
        duration: Duration::from_millis(5),
        cached: false,
    }
}

fn progress(s: &mut Scheduler, id: &str, phase: TaskPhase) -> SchedulerStep {
    s.handle(RuntimeEvent::TaskProgress {
        node: id.to_string(),
        phase,
    })
    .unwrap()
}

fn finish(s: &mut Scheduler, id: &str, outcome: TaskOutcome) -> Result<SchedulerStep, SchedulerError> {
    s.handle(RuntimeEvent::TaskFinished {
        node: id.to_string(),
        outcome,
    })
}

/// Report a dispatched task as ready, running and finished with `outcome`.
fn run_to(s: &mut Scheduler, id: &str, outcome: TaskOutcome) -> SchedulerStep {
    progress(s, id, TaskPhase::Ready);
    progress(s, id, TaskPhase::Running);
    finish(s, id, outcome).unwrap()
}

fn dispatched(step: &SchedulerStep) -> Vec<NodeId> {
    step.commands
        .iter()
        .filter_map(|c| match c {
            CoreCommand::Dispatch(id) => Some(id.clone()),
            _ => None,
        })
        .collect()
}

fn finished(step: &SchedulerStep) -> bool {
    step.commands.contains(&CoreCommand::Finish)
}

fn states_of(step: &SchedulerStep, id: &str) -> Vec<TaskState> {
    step.events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskState { node, state, .. } if node == id => Some(state.clone()),
            _ => None,
        })
        .collect()
}

fn chain() -> Arc<WorkGraph> {
    let file = BuildFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("echo a").build())
        .with_task("b", TaskConfigBuilder::new("echo b").dep("a").build())
        .with_task("c", TaskConfigBuilder::new("echo c").dep("b").build())
        .build();
    graph_for(Path::new("/p"), file, &Selection::Names(vec!["c".into()]))
}

#[test]
fn chain_dispatches_in_dependency_order() {
    let graph = chain();
    let (a, b, c) = (id_of(&graph, "a"), id_of(&graph, "b"), id_of(&graph, "c"));
    let mut s = scheduler(&graph, 4, false);

    let step = s.start();
    assert_eq!(dispatched(&step), [a.clone()]);
    assert_eq!(s.task_state(&a), Some(&TaskState::Starting));
    assert_eq!(s.task_state(&b), Some(&TaskState::Pending));

    let step = run_to(&mut s, &a, done());
    assert_eq!(dispatched(&step), [b.clone()]);

    let step = run_to(&mut s, &b, done());
    assert_eq!(dispatched(&step), [c.clone()]);
    assert!(!finished(&step));

    let step = run_to(&mut s, &c, done());
    assert!(finished(&step));
    assert!(s.is_finished());
    assert!(s.summary().success());
}

#[test]
fn crashed_dependency_cancels_dependent_without_running_it() {
    let file = BuildFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("exit 1").build())
        .with_task("B", TaskConfigBuilder::new("echo B").dep("A").build())
        .build();
    let graph = graph_for(Path::new("/p"), file, &Selection::Names(vec!["B".into()]));
    let (a, b) = (id_of(&graph, "A"), id_of(&graph, "B"));
    let mut s = scheduler(&graph, 2, false);

    s.start();
    let step = run_to(&mut s, &a, TaskOutcome::Crashed(1));

    assert_eq!(s.task_state(&a), Some(&TaskState::Crashed { exit_code: 1 }));
    assert_eq!(states_of(&step, &b), [TaskState::Canceled]);
    assert!(dispatched(&step).is_empty());
    assert!(finished(&step));

    let summary = s.summary();
    assert!(!summary.success());
    let failed: Vec<&str> = summary.failed().map(|(k, _)| k.as_str()).collect();
    assert_eq!(failed, ["A"]);
    assert_eq!(summary.canceled().collect::<Vec<_>>(), ["B"]);
}

#[test]
fn cancellation_is_transitive() {
    let graph = chain();
    let (a, b, c) = (id_of(&graph, "a"), id_of(&graph, "b"), id_of(&graph, "c"));
    let mut s = scheduler(&graph, 1, false);

    s.start();
    let step = run_to(&mut s, &a, TaskOutcome::Error("boom".into()));
    assert_eq!(states_of(&step, &b), [TaskState::Canceled]);
    assert_eq!(states_of(&step, &c), [TaskState::Canceled]);
}

#[test]
fn concurrency_limit_is_respected() {
    let file = BuildFileBuilder::new()
        .with_task("w", TaskConfigBuilder::new("echo w").build())
        .with_task("x", TaskConfigBuilder::new("echo x").build())
        .with_task("y", TaskConfigBuilder::new("echo y").build())
        .with_task("z", TaskConfigBuilder::new("echo z").build())
        .build();
    let graph = graph_for(Path::new("/p"), file, &Selection::All);
    let mut s = scheduler(&graph, 2, false);

    let first = dispatched(&s.start());
    assert_eq!(first.len(), 2);
    assert_eq!(s.in_flight(), 2);

    let second = dispatched(&run_to(&mut s, &first[0], done()));
    assert_eq!(second.len(), 1);
    assert_eq!(s.in_flight(), 2);
}

#[test]
fn eligible_tasks_dispatch_first_in_first_out() {
    // `late` only becomes eligible once `early` completes, so the task that
    // was waiting from the start must run before it.
    let file = BuildFileBuilder::new()
        .with_task("early", TaskConfigBuilder::new("echo early").build())
        .with_task("other", TaskConfigBuilder::new("echo other").build())
        .with_task("late", TaskConfigBuilder::new("echo late").dep("early").build())
        .build();
    let graph = graph_for(Path::new("/p"), file, &Selection::All);
    let mut s = scheduler(&graph, 1, false);

    let mut order = dispatched(&s.start());
    while let Some(id) = order.last().cloned() {
        let next = dispatched(&run_to(&mut s, &id, done()));
        if next.is_empty() {
            break;
        }
        order.extend(next);
    }

    let keys: Vec<String> = order
        .iter()
        .map(|id| graph.node(id).unwrap().key.clone())
        .collect();
    assert_eq!(keys.len(), 3);
    assert_eq!(keys.last().map(String::as_str), Some("late"), "{keys:?}");
}

#[test]
fn cached_result_skips_running() {
    let graph = chain();
    let a = id_of(&graph, "a");
    let mut s = scheduler(&graph, 1, false);

    s.start();
    progress(&mut s, &a, TaskPhase::Ready);
    let step = finish(
        &mut s,
        &a,
        TaskOutcome::Completed {
            duration: Duration::ZERO,
            cached: true,
        },
    )
    .unwrap();
    assert!(matches!(
        s.task_state(&a),
        Some(TaskState::Completed { cached: true, .. })
    ));
    assert_eq!(dispatched(&step), [id_of(&graph, "b")]);
}

#[test]
fn double_resolution_fails_fast() {
    let graph = chain();
    let (a, b) = (id_of(&graph, "a"), id_of(&graph, "b"));
    let mut s = scheduler(&graph, 1, false);

    s.start();
    run_to(&mut s, &a, done());
    let err = finish(&mut s, &a, done()).unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyResolved { .. }), "{err}");

    // `c` was never dispatched.
    let c = id_of(&graph, "c");
    let err = finish(&mut s, &c, done()).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTransition { .. }), "{err}");

    // Rejected reports leave the run untouched.
    assert_eq!(s.task_state(&b), Some(&TaskState::Starting));
}

#[test]
fn cancel_all_settles_pending_and_stops_in_flight() {
    let graph = chain();
    let (a, b, c) = (id_of(&graph, "a"), id_of(&graph, "b"), id_of(&graph, "c"));
    let mut s = scheduler(&graph, 1, false);

    s.start();
    progress(&mut s, &a, TaskPhase::Ready);
    progress(&mut s, &a, TaskPhase::Running);

    let step = s.cancel_all();
    assert!(step.commands.contains(&CoreCommand::CancelTask(a.clone())));
    assert_eq!(s.task_state(&b), Some(&TaskState::Canceled));
    assert_eq!(s.task_state(&c), Some(&TaskState::Canceled));
    assert!(!finished(&step));

    let step = finish(&mut s, &a, TaskOutcome::Canceled).unwrap();
    assert!(finished(&step));
    assert_eq!(s.summary().canceled().count(), 3);
}

#[test]
fn force_settle_drops_late_results() {
    let graph = chain();
    let a = id_of(&graph, "a");
    let mut s = scheduler(&graph, 1, false);

    s.start();
    progress(&mut s, &a, TaskPhase::Ready);
    s.cancel_all();
    let step = s.force_settle();

    assert_eq!(s.task_state(&a), Some(&TaskState::Canceled));
    assert!(finished(&step));
    assert!(finish(&mut s, &a, done()).is_ok());
    assert_eq!(s.task_state(&a), Some(&TaskState::Canceled));
}

fn with_service() -> Arc<WorkGraph> {
    let file = BuildFileBuilder::new()
        .with_service("db", ServiceConfigBuilder::image("postgres:16").build())
        .with_task("migrate", TaskConfigBuilder::new("migrate up").need("db").build())
        .build();
    graph_for(Path::new("/p"), file, &Selection::All)
}

#[test]
fn needed_service_gates_dispatch_and_stops_when_unused() {
    let graph = with_service();
    let (db, migrate) = (id_of(&graph, "db"), id_of(&graph, "migrate"));
    let mut s = scheduler(&graph, 1, false);

    let step = s.start();
    assert_eq!(step.commands, [CoreCommand::StartService(db.clone())]);
    assert_eq!(s.service_state(&db), Some(&ServiceState::Starting));

    let step = s
        .handle(RuntimeEvent::ServiceReady {
            service: db.clone(),
        })
        .unwrap();
    assert_eq!(dispatched(&step), [migrate.clone()]);

    let step = run_to(&mut s, &migrate, done());
    assert!(step.commands.contains(&CoreCommand::StopService(db.clone())));
    assert!(finished(&step));
    assert_eq!(s.service_state(&db), Some(&ServiceState::End { failure: None }));
}

#[test]
fn failed_service_cancels_its_needers() {
    let graph = with_service();
    let (db, migrate) = (id_of(&graph, "db"), id_of(&graph, "migrate"));
    let mut s = scheduler(&graph, 1, false);

    s.start();
    let step = s
        .handle(RuntimeEvent::ServiceEnded {
            service: db.clone(),
            failure: Some("health check failed after 3 attempts".into()),
        })
        .unwrap();

    assert_eq!(s.task_state(&migrate), Some(&TaskState::Canceled));
    assert!(finished(&step));
    assert!(!s.summary().success());
}

#[test]
fn service_crash_cancels_in_flight_needers() {
    let graph = with_service();
    let (db, migrate) = (id_of(&graph, "db"), id_of(&graph, "migrate"));
    let mut s = scheduler(&graph, 1, false);

    s.start();
    s.handle(RuntimeEvent::ServiceReady {
        service: db.clone(),
    })
    .unwrap();
    progress(&mut s, &migrate, TaskPhase::Ready);

    let step = s
        .handle(RuntimeEvent::ServiceEnded {
            service: db.clone(),
            failure: Some("exited with code 137".into()),
        })
        .unwrap();
    assert!(step.commands.contains(&CoreCommand::CancelTask(migrate.clone())));
}

fn watched() -> Arc<WorkGraph> {
    let file = BuildFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("node index.js").src("index.js").build())
        .with_task("sibling", TaskConfigBuilder::new("node other.js").src("other.js").build())
        .with_task("after", TaskConfigBuilder::new("echo after").dep("A").build())
        .build();
    graph_for(Path::new("/p"), file, &Selection::All)
}

fn settle_all(s: &mut Scheduler, mut pending: Vec<NodeId>) {
    while let Some(id) = pending.pop() {
        let step = run_to(s, &id, done());
        pending.extend(dispatched(&step));
    }
}

#[test]
fn watch_mode_reruns_changed_task_and_dependents_only() {
    let graph = watched();
    let (a, sibling, after) = (
        id_of(&graph, "A"),
        id_of(&graph, "sibling"),
        id_of(&graph, "after"),
    );
    let mut s = scheduler(&graph, 4, true);

    let first = dispatched(&s.start());
    settle_all(&mut s, first);
    assert!(!s.is_finished(), "watch mode keeps running");
    assert!(s.task_state(&sibling).is_some_and(TaskState::is_completed));

    let step = s
        .handle(RuntimeEvent::SourceChanged {
            node: a.clone(),
            path: PathBuf::from("/p/index.js"),
        })
        .unwrap();
    assert_eq!(dispatched(&step), [a.clone()]);
    assert_eq!(s.task_state(&after), Some(&TaskState::Pending));
    assert!(s.task_state(&sibling).is_some_and(TaskState::is_completed));

    let step = run_to(&mut s, &a, done());
    assert_eq!(dispatched(&step), [after.clone()]);
}

#[test]
fn watch_subscribes_settled_tasks_with_sources() {
    let graph = watched();
    let a = id_of(&graph, "A");
    let mut s = scheduler(&graph, 4, true);
    s.start();

    let step = run_to(&mut s, &a, done());
    assert!(step.commands.contains(&CoreCommand::Watch(a.clone())));

    // `after` has no sources: nothing to watch.
    let after = id_of(&graph, "after");
    let step = run_to(&mut s, &after, done());
    assert!(!step.commands.iter().any(|c| matches!(c, CoreCommand::Watch(_))));
}

#[test]
fn change_while_running_reruns_after_completion() {
    let graph = watched();
    let a = id_of(&graph, "A");
    let mut s = scheduler(&graph, 4, true);
    s.start();

    progress(&mut s, &a, TaskPhase::Ready);
    progress(&mut s, &a, TaskPhase::Running);
    let step = s
        .handle(RuntimeEvent::SourceChanged {
            node: a.clone(),
            path: PathBuf::from("/p/index.js"),
        })
        .unwrap();
    assert!(dispatched(&step).is_empty());

    let step = finish(&mut s, &a, done()).unwrap();
    assert_eq!(dispatched(&step), [a.clone()]);
}

#[test]
fn cancel_in_watch_mode_unwatches_and_finishes() {
    let graph = watched();
    let mut s = scheduler(&graph, 4, true);
    let first = dispatched(&s.start());
    settle_all(&mut s, first);

    let step = s.cancel_all();
    let unwatched = step
        .commands
        .iter()
        .filter(|c| matches!(c, CoreCommand::Unwatch(_)))
        .count();
    assert_eq!(unwatched, 2);
    assert!(finished(&step));
    assert!(s.summary().success());
}
