// src/engine/events.rs

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::state::{ServiceState, TaskState};
use crate::types::{LogStream, NodeId, TaskKey};

/// Intermediate progress reported by an executor before the final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Ready,
    Running,
}

/// Final result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { duration: Duration, cached: bool },
    Error(String),
    Crashed(i64),
    Canceled,
}

impl TaskOutcome {
    pub fn into_state(self) -> TaskState {
        match self {
            TaskOutcome::Completed { duration, cached } => TaskState::Completed { duration, cached },
            TaskOutcome::Error(message) => TaskState::Error { message },
            TaskOutcome::Crashed(exit_code) => TaskState::Crashed { exit_code },
            TaskOutcome::Canceled => TaskState::Canceled,
        }
    }
}

/// Events flowing into the scheduler from executors, services and watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    TaskProgress { node: NodeId, phase: TaskPhase },
    TaskFinished { node: NodeId, outcome: TaskOutcome },
    ServiceReady { service: NodeId },
    /// Service stopped on its own: failed health check, crash or exit.
    ServiceEnded {
        service: NodeId,
        failure: Option<String>,
    },
    /// A watched source of `node` changed on disk.
    SourceChanged { node: NodeId, path: PathBuf },
}

/// Events published to the caller of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    TaskState {
        node: NodeId,
        key: TaskKey,
        state: TaskState,
    },
    ServiceState {
        service: NodeId,
        key: TaskKey,
        state: ServiceState,
    },
    Log {
        node: NodeId,
        key: TaskKey,
        stream: LogStream,
        line: String,
    },
}

/// Per-node output sink. Cheap to clone; every clone writes to the same
/// run event stream tagged with this node.
#[derive(Debug, Clone)]
pub struct StatusSink {
    node: NodeId,
    key: TaskKey,
    tx: mpsc::Sender<RunEvent>,
}

impl StatusSink {
    pub fn new(node: NodeId, key: TaskKey, tx: mpsc::Sender<RunEvent>) -> Self {
        Self { node, key, tx }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn line(&self, stream: LogStream, line: impl Into<String>) {
        let line = line.into();
        debug!(task = %self.key, ?stream, "{line}");
        // Nobody listening is not an error for the producer.
        let _ = self
            .tx
            .send(RunEvent::Log {
                node: self.node.clone(),
                key: self.key.clone(),
                stream,
                line,
            })
            .await;
    }

    pub async fn system(&self, line: impl Into<String>) {
        self.line(LogStream::System, line).await;
    }

    /// Forward every line of `reader` until EOF. Await the handle to make
    /// sure the last lines were published.
    pub fn forward<R>(&self, reader: R, stream: LogStream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.line(stream, line).await;
            }
        })
    }
}
