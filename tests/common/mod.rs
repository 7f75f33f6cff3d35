#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

pub use taskrig_test_utils::{
    graph_for, id_of, init_tracing, resolve_single, with_timeout, BuildFileBuilder,
    FakeContainerRuntime, FakeExecutor, FakeServices, ManualWatch, Script, ServiceConfigBuilder,
    TaskConfigBuilder,
};

use taskrig::dag::WorkGraph;
use taskrig::engine::{RunEvent, RuntimeEvent, Scheduler, SchedulerOptions, TaskState};

pub const CHANNEL_CAPACITY: usize = 256;

/// A scheduler over every selected task of `graph`.
pub fn scheduler(graph: &Arc<WorkGraph>, concurrency: usize, watch: bool) -> Scheduler {
    Scheduler::new(
        Arc::clone(graph),
        graph.selected.clone(),
        SchedulerOptions { concurrency, watch },
    )
}

pub fn runtime_channel() -> (mpsc::Sender<RuntimeEvent>, mpsc::Receiver<RuntimeEvent>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

pub fn events_channel() -> (mpsc::Sender<RunEvent>, mpsc::Receiver<RunEvent>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Every state a task went through, in order, from a drained event stream.
pub fn task_states(events: &[RunEvent], key: &str) -> Vec<TaskState> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskState { key: k, state, .. } if k == key => Some(state.clone()),
            _ => None,
        })
        .collect()
}

/// Log lines of one node.
pub fn log_lines(events: &[RunEvent], key: &str) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Log { key: k, line, .. } if k == key => Some(line.clone()),
            _ => None,
        })
        .collect()
}

pub fn drain(rx: &mut mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
