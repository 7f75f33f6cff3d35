// src/service/mod.rs

//! Service lifecycle manager.
//!
//! A service is started at most once per run, reported ready once its health
//! check passes (or right away without one), watched for unexpected exits
//! and torn down when the scheduler stops it or the run is cancelled.

pub mod container;
pub mod kubernetes;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::container::ContainerRuntime;
use crate::dag::{ServiceMode, WorkService};
use crate::engine::{CancelSignal, RunEvent, RuntimeEvent, StatusSink};
use crate::errors::Result;
use crate::fs::FileSystem;
use crate::types::NodeId;

pub trait ServiceBackend: Send {
    /// Bring `service` up. Readiness or failure is reported back as a
    /// [`RuntimeEvent`].
    fn start(
        &mut self,
        service: Arc<WorkService>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Tear a service down. It does not report back.
    fn stop(&mut self, id: &NodeId);

    /// Stop everything still running and wait for teardown.
    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Where service processes get their collaborators.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub containers: Arc<dyn ContainerRuntime>,
    /// Checks which inherited file outputs exist before binding them.
    pub fs: Arc<dyn FileSystem>,
    pub home: Option<PathBuf>,
    /// Binary used for kubernetes port forwards.
    pub kubectl: String,
    pub runtime_tx: mpsc::Sender<RuntimeEvent>,
}

struct ActiveService {
    cancel: CancelSignal,
    handle: JoinHandle<()>,
}

/// Production [`ServiceBackend`].
pub struct ServiceManager {
    ctx: ServiceContext,
    events_tx: mpsc::Sender<RunEvent>,
    cancel: CancelSignal,
    active: HashMap<NodeId, ActiveService>,
}

impl ServiceManager {
    pub fn new(ctx: ServiceContext, events_tx: mpsc::Sender<RunEvent>, cancel: CancelSignal) -> Self {
        Self {
            ctx,
            events_tx,
            cancel,
            active: HashMap::new(),
        }
    }
}

impl ServiceBackend for ServiceManager {
    fn start(
        &mut self,
        service: Arc<WorkService>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.active.contains_key(&service.id) {
                debug!(service = %service.key, "service already started; reusing it");
                return Ok(());
            }

            let cancel = self.cancel.child();
            let sink = StatusSink::new(service.id.clone(), service.key.clone(), self.events_tx.clone());
            let ctx = self.ctx.clone();
            let id = service.id.clone();
            let task_cancel = cancel.clone();

            let is_container = matches!(service.mode, ServiceMode::Container { .. });
            let handle = tokio::spawn(async move {
                if is_container {
                    container::run_container_service(service, ctx, sink, task_cancel).await
                } else {
                    kubernetes::run_port_forward(service, ctx, sink, task_cancel).await
                }
            });

            self.active.insert(id, ActiveService { cancel, handle });
            Ok(())
        })
    }

    fn stop(&mut self, id: &NodeId) {
        match self.active.get(id) {
            Some(service) => service.cancel.cancel(),
            None => debug!(service = %id, "stop for a service that never started"),
        }
    }

    fn shutdown(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            for service in self.active.values() {
                service.cancel.cancel();
            }
            for (id, service) in self.active.drain() {
                if let Err(err) = service.handle.await {
                    warn!(service = %id, error = %err, "service task panicked");
                }
            }
        })
    }
}

/// Report the end of a service that stopped on its own.
async fn report_end(ctx: &ServiceContext, id: &NodeId, failure: Option<String>) {
    let _ = ctx
        .runtime_tx
        .send(RuntimeEvent::ServiceEnded {
            service: id.clone(),
            failure,
        })
        .await;
}

async fn report_ready(ctx: &ServiceContext, id: &NodeId) {
    let _ = ctx
        .runtime_tx
        .send(RuntimeEvent::ServiceReady {
            service: id.clone(),
        })
        .await;
}
