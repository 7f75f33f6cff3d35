// src/watch/mod.rs

//! Path-scoped change subscriptions.
//!
//! In watch mode the scheduler subscribes a task once it has settled; a
//! matching change to one of its sources comes back as
//! `RuntimeEvent::SourceChanged`. This module knows nothing about the
//! graph: it only turns filesystem changes into per-node notifications.

pub mod watcher;

use anyhow::Result;

use crate::dag::WorkNode;

pub use watcher::NotifyWatchBackend;

pub trait WatchBackend: Send {
    /// Start reporting changes to the sources of `node`. Subscribing twice
    /// replaces the previous subscription.
    fn subscribe(&mut self, node: &WorkNode) -> Result<()>;

    fn unsubscribe(&mut self, id: &str);
}

/// Backend for runs without watch mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatch;

impl WatchBackend for NoopWatch {
    fn subscribe(&mut self, _node: &WorkNode) -> Result<()> {
        Ok(())
    }

    fn unsubscribe(&mut self, _id: &str) {}
}
