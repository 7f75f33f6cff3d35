// src/engine/cancel.rs

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

/// Run-scoped cancellation flag.
///
/// Cloning shares the flag. [`CancelSignal::child`] creates a signal that is
/// raised either directly or when any ancestor is, which is how a single
/// node's execution can be stopped without cancelling the whole run.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    flag: Arc<watch::Sender<bool>>,
    parent: Option<Box<CancelSignal>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            flag: Arc::new(tx),
            parent: None,
        }
    }

    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            flag: Arc::new(tx),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Raise the signal. Idempotent.
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves once this signal or one of its ancestors is raised.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.flag.subscribe();
            match &self.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = rx.wait_for(|raised| *raised) => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => {
                    let _ = rx.wait_for(|raised| *raised).await;
                }
            }
        })
    }
}
