// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::cancel::CancelSignal;
use crate::engine::events::{RunEvent, RuntimeEvent};
use crate::engine::scheduler::{CoreCommand, RunSummary, Scheduler, SchedulerStep};
use crate::errors::Result;
use crate::exec::ExecutorBackend;
use crate::service::ServiceBackend;
use crate::watch::WatchBackend;

/// How long in-flight executions get to unwind after cancellation before
/// they are settled without waiting for them.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// How long executor and service teardown may each take at the end of a
/// run.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Async shell around [`Scheduler`].
///
/// Reads [`RuntimeEvent`]s, feeds them to the core, publishes the resulting
/// state changes and carries out its commands through the executor, service
/// and watch backends. All run semantics live in the core.
pub struct Runtime<E: ExecutorBackend, S: ServiceBackend, W: WatchBackend> {
    core: Scheduler,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    executor: E,
    services: S,
    watcher: W,
    events_tx: mpsc::Sender<RunEvent>,
    cancel: CancelSignal,
    grace: Duration,
}

impl<E: ExecutorBackend, S: ServiceBackend, W: WatchBackend> fmt::Debug for Runtime<E, S, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend, S: ServiceBackend, W: WatchBackend> Runtime<E, S, W> {
    pub fn new(
        core: Scheduler,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        executor: E,
        services: S,
        watcher: W,
        events_tx: mpsc::Sender<RunEvent>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            core,
            event_rx,
            executor,
            services,
            watcher,
            events_tx,
            cancel,
            grace: CANCEL_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Main event loop. Returns once every task is settled and no service
    /// is left running.
    pub async fn run(mut self) -> Result<RunSummary> {
        info!("taskrig runtime started");

        let step = self.core.start();
        self.apply(step).await?;

        let cancel = self.cancel.clone();
        let mut deadline: Option<Instant> = None;

        while !self.core.is_finished() {
            tokio::select! {
                _ = cancel.cancelled(), if !self.core.is_canceled() => {
                    let step = self.core.cancel_all();
                    deadline = Some(Instant::now() + self.grace);
                    self.apply(step).await?;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(grace = ?self.grace, "executions did not stop in time; settling them as canceled");
                    deadline = None;
                    let step = self.core.force_settle();
                    self.apply(step).await?;
                }
                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        warn!("runtime event channel closed; settling remaining work");
                        let mut step = self.core.cancel_all();
                        let forced = self.core.force_settle();
                        step.commands.extend(forced.commands);
                        step.events.extend(forced.events);
                        self.apply(step).await?;
                        break;
                    };
                    debug!(?event, "runtime received event");
                    let step = self.core.handle(event)?;
                    self.apply(step).await?;
                }
            }
        }

        // Late outcomes are no longer read; senders must not block on them.
        self.event_rx.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.executor.shutdown())
            .await
            .is_err()
        {
            warn!("executions did not unwind in time");
        }

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.services.shutdown())
            .await
            .is_err()
        {
            warn!("service teardown timed out");
        }

        let summary = self.core.summary();
        info!(success = summary.success(), "runtime exiting");
        Ok(summary)
    }

    /// Publish state changes, then execute the core's commands.
    async fn apply(&mut self, step: SchedulerStep) -> Result<()> {
        for event in step.events {
            // A caller that stopped listening does not stop the run.
            let _ = self.events_tx.send(event).await;
        }

        for command in step.commands {
            self.execute_command(command).await?;
        }
        Ok(())
    }

    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        let graph = Arc::clone(self.core.graph());
        match command {
            CoreCommand::Dispatch(id) => {
                if let Some(node) = graph.node(&id) {
                    debug!(task = %node.key, id = %node.short_id(), "dispatching");
                    self.executor.dispatch(Arc::clone(node)).await?;
                }
            }
            CoreCommand::CancelTask(id) => self.executor.cancel(&id),
            CoreCommand::StartService(id) => {
                if let Some(service) = graph.service(&id) {
                    self.services.start(Arc::clone(service)).await?;
                }
            }
            CoreCommand::StopService(id) => self.services.stop(&id),
            CoreCommand::Watch(id) => {
                if let Some(node) = graph.node(&id) {
                    if let Err(err) = self.watcher.subscribe(node) {
                        warn!(task = %node.key, error = %err, "failed to watch sources");
                    }
                }
            }
            CoreCommand::Unwatch(id) => self.watcher.unsubscribe(&id),
            CoreCommand::Finish => debug!("core reported the run finished"),
        }
        Ok(())
    }
}
