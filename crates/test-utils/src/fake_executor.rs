use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result as AnyResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use taskrig::dag::{WorkNode, WorkService};
use taskrig::engine::{CancelSignal, RuntimeEvent, TaskOutcome, TaskPhase};
use taskrig::errors::Result;
use taskrig::exec::ExecutorBackend;
use taskrig::service::ServiceBackend;
use taskrig::types::{NodeId, TaskKey};
use taskrig::watch::WatchBackend;

/// What the fake executor does with one task key.
#[derive(Debug, Clone)]
pub enum Script {
    /// Run for `delay`, then complete (executed, not cached).
    Complete(Duration),
    /// Report a cache hit.
    Cached,
    Fail(String),
    Crash(i64),
    /// Run until canceled.
    Hang,
    /// Run until canceled, then never report back.
    Unresponsive,
    /// Run until canceled, then spend `delay` cleaning up without
    /// reporting back.
    SlowCleanup(Duration),
}

/// An executor that runs nothing and reports scripted outcomes.
///
/// Unscripted tasks complete immediately. Every dispatch is recorded in
/// order; the highest number of simultaneously running tasks is tracked.
pub struct FakeExecutor {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    scripts: HashMap<TaskKey, Script>,
    dispatched: Arc<Mutex<Vec<TaskKey>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    signals: HashMap<NodeId, CancelSignal>,
    handles: Vec<JoinHandle<()>>,
    exited: Arc<AtomicUsize>,
}

impl FakeExecutor {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runtime_tx,
            scripts: HashMap::new(),
            dispatched: Arc::default(),
            running: Arc::default(),
            max_running: Arc::default(),
            signals: HashMap::new(),
            handles: Vec::new(),
            exited: Arc::default(),
        }
    }

    pub fn script(mut self, key: &str, script: Script) -> Self {
        self.scripts.insert(key.to_string(), script);
        self
    }

    /// Shared log of dispatched task keys.
    pub fn dispatched(&self) -> Arc<Mutex<Vec<TaskKey>>> {
        Arc::clone(&self.dispatched)
    }

    /// Shared count of executions that have returned.
    pub fn exited(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.exited)
    }

    /// Shared high-water mark of concurrently running tasks.
    pub fn max_running(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_running)
    }
}

impl ExecutorBackend for FakeExecutor {
    fn dispatch(
        &mut self,
        node: Arc<WorkNode>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.dispatched.lock().unwrap().push(node.key.clone());
            let script = self
                .scripts
                .get(&node.key)
                .cloned()
                .unwrap_or(Script::Complete(Duration::ZERO));

            let cancel = CancelSignal::new();
            self.signals.insert(node.id.clone(), cancel.clone());

            let tx = self.runtime_tx.clone();
            let running = Arc::clone(&self.running);
            let max_running = Arc::clone(&self.max_running);
            let exited = Arc::clone(&self.exited);
            let id = node.id.clone();

            let handle = tokio::spawn(async move {
                let progress = |phase| RuntimeEvent::TaskProgress {
                    node: id.clone(),
                    phase,
                };
                let _ = tx.send(progress(TaskPhase::Ready)).await;

                if let Script::Cached = script {
                    let _ = tx
                        .send(RuntimeEvent::TaskFinished {
                            node: id.clone(),
                            outcome: TaskOutcome::Completed {
                                duration: Duration::ZERO,
                                cached: true,
                            },
                        })
                        .await;
                    exited.fetch_add(1, Ordering::SeqCst);
                    return;
                }

                let _ = tx.send(progress(TaskPhase::Running)).await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);

                let outcome = match script {
                    Script::Complete(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => Some(TaskOutcome::Completed {
                                duration: delay,
                                cached: false,
                            }),
                            _ = cancel.cancelled() => Some(TaskOutcome::Canceled),
                        }
                    }
                    Script::Fail(message) => Some(TaskOutcome::Error(message)),
                    Script::Crash(code) => Some(TaskOutcome::Crashed(code)),
                    Script::Hang => {
                        cancel.cancelled().await;
                        Some(TaskOutcome::Canceled)
                    }
                    Script::Unresponsive => {
                        cancel.cancelled().await;
                        None
                    }
                    Script::SlowCleanup(delay) => {
                        cancel.cancelled().await;
                        tokio::time::sleep(delay).await;
                        None
                    }
                    Script::Cached => None,
                };

                running.fetch_sub(1, Ordering::SeqCst);
                if let Some(outcome) = outcome {
                    let _ = tx
                        .send(RuntimeEvent::TaskFinished { node: id, outcome })
                        .await;
                }
                exited.fetch_add(1, Ordering::SeqCst);
            });
            self.handles.push(handle);
            Ok(())
        })
    }

    fn cancel(&mut self, id: &NodeId) {
        if let Some(signal) = self.signals.get(id) {
            signal.cancel();
        }
    }

    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            for signal in self.signals.values() {
                signal.cancel();
            }
            for handle in self.handles.drain(..) {
                let _ = handle.await;
            }
        })
    }
}

/// Service backend that reports every started service ready right away,
/// unless it was scripted to fail.
pub struct FakeServices {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    failing: HashMap<TaskKey, String>,
    started: Arc<Mutex<Vec<TaskKey>>>,
    stopped: Arc<Mutex<Vec<NodeId>>>,
}

impl FakeServices {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runtime_tx,
            failing: HashMap::new(),
            started: Arc::default(),
            stopped: Arc::default(),
        }
    }

    pub fn fail(mut self, key: &str, reason: &str) -> Self {
        self.failing.insert(key.to_string(), reason.to_string());
        self
    }

    pub fn started(&self) -> Arc<Mutex<Vec<TaskKey>>> {
        Arc::clone(&self.started)
    }

    pub fn stopped(&self) -> Arc<Mutex<Vec<NodeId>>> {
        Arc::clone(&self.stopped)
    }
}

impl ServiceBackend for FakeServices {
    fn start(
        &mut self,
        service: Arc<WorkService>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.started.lock().unwrap().push(service.key.clone());
            let event = match self.failing.get(&service.key) {
                Some(reason) => RuntimeEvent::ServiceEnded {
                    service: service.id.clone(),
                    failure: Some(reason.clone()),
                },
                None => RuntimeEvent::ServiceReady {
                    service: service.id.clone(),
                },
            };
            let tx = self.runtime_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
            Ok(())
        })
    }

    fn stop(&mut self, id: &NodeId) {
        self.stopped.lock().unwrap().push(id.clone());
    }

    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// Watch backend that only records subscriptions. Tests inject
/// `SourceChanged` events themselves.
#[derive(Default)]
pub struct ManualWatch {
    subscribed: Arc<Mutex<Vec<TaskKey>>>,
    unsubscribed: Arc<Mutex<Vec<NodeId>>>,
}

impl ManualWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribed(&self) -> Arc<Mutex<Vec<TaskKey>>> {
        Arc::clone(&self.subscribed)
    }

    pub fn unsubscribed(&self) -> Arc<Mutex<Vec<NodeId>>> {
        Arc::clone(&self.unsubscribed)
    }
}

impl WatchBackend for ManualWatch {
    fn subscribe(&mut self, node: &WorkNode) -> AnyResult<()> {
        self.subscribed.lock().unwrap().push(node.key.clone());
        Ok(())
    }

    fn unsubscribe(&mut self, id: &str) {
        self.unsubscribed.lock().unwrap().push(id.to_string());
    }
}
