// src/engine/state.rs

use std::fmt;
use std::time::Duration;

/// Lifecycle of a task within one run.
///
/// `Pending -> Starting -> Ready -> Running -> Completed | Error | Crashed`,
/// with `Canceled` reachable from any non-terminal state. A cache hit skips
/// `Running` and completes straight from `Ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    /// Dispatched to an executor.
    Starting,
    /// Prepared (cache checked, image present); about to execute.
    Ready,
    Running,
    Completed { duration: Duration, cached: bool },
    Error { message: String },
    Crashed { exit_code: i64 },
    Canceled,
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Starting => "starting",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Completed { .. } => "completed",
            TaskState::Error { .. } => "error",
            TaskState::Crashed { .. } => "crashed",
            TaskState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. }
                | TaskState::Error { .. }
                | TaskState::Crashed { .. }
                | TaskState::Canceled
        )
    }

    /// Owned by an executor right now.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskState::Starting | TaskState::Ready | TaskState::Running
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskState::Completed { .. })
    }

    /// `Error` or `Crashed`: the states that cancel dependents.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Error { .. } | TaskState::Crashed { .. })
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Starting) => true,
            (Starting, Ready) => true,
            (Ready, Running) => true,
            (Ready, Completed { cached: true, .. }) => true,
            (Running, Completed { cached: false, .. }) => true,
            (s, Error { .. } | Crashed { .. }) => s.is_in_flight(),
            (s, Canceled) => !s.is_terminal(),
            // Watch mode re-queues finished tasks.
            (s, Pending) => s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Completed { duration, cached } => {
                if *cached {
                    write!(f, "completed (cached)")
                } else {
                    write!(f, "completed in {:.2}s", duration.as_secs_f64())
                }
            }
            TaskState::Error { message } => write!(f, "error: {message}"),
            TaskState::Crashed { exit_code } => write!(f, "crashed with code {exit_code}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Lifecycle of a service within one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Pending,
    Starting,
    Ready,
    /// Stopped. `failure` is set when it never became ready or died early.
    End { failure: Option<String> },
}

impl ServiceState {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceState::Pending => "pending",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::End { .. } => "end",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Ready)
    }

    pub fn is_end(&self) -> bool {
        matches!(self, ServiceState::End { .. })
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::End {
                failure: Some(reason),
            } => write!(f, "end: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}
