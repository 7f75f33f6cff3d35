// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of spawning work
//! itself. Production uses [`RealExecutorBackend`]; tests provide a fake that
//! reports scripted outcomes without running anything.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dag::WorkNode;
use crate::engine::{CancelSignal, RunEvent, RuntimeEvent, StatusSink};
use crate::errors::Result;
use crate::exec::task_runner::{run_task, ExecContext};
use crate::types::NodeId;

pub trait ExecutorBackend: Send {
    /// Start executing `node`. Progress and the outcome are reported back as
    /// [`RuntimeEvent`]s; this only has to hand the work off.
    fn dispatch(
        &mut self,
        node: Arc<WorkNode>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Ask an in-flight execution to stop. It still reports an outcome.
    fn cancel(&mut self, id: &NodeId);

    /// Cancel whatever is still running and wait for it to return, so no
    /// execution (or the container it is removing) outlives the run.
    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// Handle of a running execution.
struct ActiveTask {
    cancel: CancelSignal,
    handle: JoinHandle<()>,
}

/// Executes nodes as Tokio tasks, locally or in containers.
pub struct RealExecutorBackend {
    ctx: ExecContext,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    events_tx: mpsc::Sender<RunEvent>,
    /// Parent of every per-task signal.
    cancel: CancelSignal,
    active: HashMap<NodeId, ActiveTask>,
}

impl RealExecutorBackend {
    pub fn new(
        ctx: ExecContext,
        runtime_tx: mpsc::Sender<RuntimeEvent>,
        events_tx: mpsc::Sender<RunEvent>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            ctx,
            runtime_tx,
            events_tx,
            cancel,
            active: HashMap::new(),
        }
    }
}

impl ExecutorBackend for RealExecutorBackend {
    fn dispatch(
        &mut self,
        node: Arc<WorkNode>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.active.retain(|_, task| !task.handle.is_finished());

            let cancel = self.cancel.child();
            let sink = StatusSink::new(node.id.clone(), node.key.clone(), self.events_tx.clone());
            let id = node.id.clone();
            let handle = tokio::spawn(run_task(
                node,
                self.ctx.clone(),
                sink,
                cancel.clone(),
                self.runtime_tx.clone(),
            ));

            self.active.insert(id, ActiveTask { cancel, handle });
            Ok(())
        })
    }

    fn cancel(&mut self, id: &NodeId) {
        match self.active.get(id) {
            Some(task) if !task.handle.is_finished() => {
                debug!(task = %id, "cancelling execution");
                task.cancel.cancel();
            }
            _ => debug!(task = %id, "no running execution to cancel"),
        }
    }

    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let active: Vec<(NodeId, ActiveTask)> = self.active.drain().collect();
            for (_, task) in &active {
                task.cancel.cancel();
            }
            for (id, task) in active {
                if !task.handle.is_finished() {
                    debug!(task = %id, "waiting for execution to unwind");
                }
                if let Err(err) = task.handle.await {
                    warn!(task = %id, error = %err, "execution task panicked or was aborted");
                }
            }
        })
    }
}
