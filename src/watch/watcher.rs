// src/watch/watcher.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dag::{SourceMatcher, WorkNode};
use crate::engine::RuntimeEvent;
use crate::types::NodeId;
use crate::watch::WatchBackend;

/// Quiet period before a burst of changes is reported as one.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

type Subscriptions = Arc<Mutex<HashMap<NodeId, Vec<SourceMatcher>>>>;

/// [`WatchBackend`] over a `notify` watcher.
///
/// Directory sources are watched recursively, file sources through their
/// parent directory. Changes are debounced per node.
pub struct NotifyWatchBackend {
    watcher: RecommendedWatcher,
    subscriptions: Subscriptions,
    /// Watched path -> (mode, nodes using it).
    watched: HashMap<PathBuf, (RecursiveMode, usize)>,
    /// Node -> watched paths it holds.
    held: HashMap<NodeId, Vec<PathBuf>>,
}

impl std::fmt::Debug for NotifyWatchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyWatchBackend")
            .field("watched", &self.watched.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl NotifyWatchBackend {
    /// Create the watcher and the task forwarding its events to
    /// `runtime_tx`. Changes below any of `ignored` are dropped. Must be
    /// called inside a Tokio runtime.
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>, ignored: Vec<PathBuf>) -> Result<Self> {
        // Channel from the blocking notify callback into the async world.
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    // The receiver only goes away at shutdown.
                    let _ = event_tx.send(event);
                }
                Err(err) => warn!(error = %err, "file watch error"),
            },
            Config::default(),
        )
        .context("creating file watcher")?;

        // Events carry resolved paths; keep both spellings of each root.
        let mut ignored_roots = Vec::new();
        for dir in ignored {
            if let Ok(canonical) = std::fs::canonicalize(&dir) {
                if canonical != dir {
                    ignored_roots.push(canonical);
                }
            }
            ignored_roots.push(dir);
        }

        let subscriptions: Subscriptions = Arc::default();
        tokio::spawn(forward_changes(
            event_rx,
            Arc::clone(&subscriptions),
            ignored_roots,
            runtime_tx,
        ));

        Ok(Self {
            watcher,
            subscriptions,
            watched: HashMap::new(),
            held: HashMap::new(),
        })
    }

    fn hold(&mut self, path: PathBuf, mode: RecursiveMode) -> Result<()> {
        if let Some((current, count)) = self.watched.get_mut(&path) {
            if *current == mode || *current == RecursiveMode::Recursive {
                *count += 1;
                return Ok(());
            }
            // Upgrade a parent-of-file watch to a recursive one.
            self.watcher.unwatch(&path).ok();
            self.watcher
                .watch(&path, RecursiveMode::Recursive)
                .with_context(|| format!("watching {}", path.display()))?;
            *current = RecursiveMode::Recursive;
            *count += 1;
            return Ok(());
        }

        self.watcher
            .watch(&path, mode)
            .with_context(|| format!("watching {}", path.display()))?;
        debug!(path = %path.display(), ?mode, "watching");
        self.watched.insert(path, (mode, 1));
        Ok(())
    }

    fn release(&mut self, path: &Path) {
        let Some((_, count)) = self.watched.get_mut(path) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.watched.remove(path);
            if let Err(err) = self.watcher.unwatch(path) {
                debug!(path = %path.display(), error = %err, "unwatch failed");
            }
        }
    }
}

impl WatchBackend for NotifyWatchBackend {
    fn subscribe(&mut self, node: &WorkNode) -> Result<()> {
        self.unsubscribe(&node.id);

        let mut held = Vec::new();
        for matcher in &node.src {
            let Some((path, mode)) = watch_target(matcher.base()) else {
                warn!(task = %node.key, path = %matcher.base().display(), "nothing to watch for source");
                continue;
            };
            self.hold(path.clone(), mode)?;
            held.push(path);
        }

        info!(task = %node.key, paths = held.len(), "watching sources");
        self.held.insert(node.id.clone(), held);
        lock(&self.subscriptions).insert(node.id.clone(), node.src.clone());
        Ok(())
    }

    fn unsubscribe(&mut self, id: &str) {
        lock(&self.subscriptions).remove(id);
        if let Some(paths) = self.held.remove(id) {
            for path in paths {
                self.release(&path);
            }
        }
    }
}

/// What to hand to notify for a source base: a directory recursively, a
/// file (or a not yet existing path) through its parent.
fn watch_target(base: &Path) -> Option<(PathBuf, RecursiveMode)> {
    if base.is_dir() {
        return Some((base.to_path_buf(), RecursiveMode::Recursive));
    }
    let parent = base.parent()?;
    parent
        .is_dir()
        .then(|| (parent.to_path_buf(), RecursiveMode::NonRecursive))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_relevant(kind: &EventKind) -> bool {
    !matches!(
        kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
    )
}

/// Nodes whose sources contain `path`.
fn matching_nodes(subscriptions: &Subscriptions, ignored: &[PathBuf], path: &Path) -> Vec<NodeId> {
    if ignored.iter().any(|dir| path.starts_with(dir)) {
        return Vec::new();
    }
    lock(subscriptions)
        .iter()
        .filter(|(_, matchers)| matchers.iter().any(|m| m.matches(path)))
        .map(|(id, _)| id.clone())
        .collect()
}

async fn forward_changes(
    mut event_rx: mpsc::UnboundedReceiver<Event>,
    subscriptions: Subscriptions,
    ignored: Vec<PathBuf>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) {
    // Node -> (last changed path, report deadline).
    let mut pending: HashMap<NodeId, (PathBuf, Instant)> = HashMap::new();

    loop {
        let next = pending.values().map(|(_, at)| *at).min();

        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                if !is_relevant(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    for id in matching_nodes(&subscriptions, &ignored, path) {
                        debug!(task = %id, path = %path.display(), "source change");
                        pending.insert(id, (path.clone(), Instant::now() + DEBOUNCE));
                    }
                }
            }
            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let now = Instant::now();
                let due: Vec<NodeId> = pending
                    .iter()
                    .filter(|(_, (_, at))| *at <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in due {
                    let Some((path, _)) = pending.remove(&id) else {
                        continue;
                    };
                    // Dropped if unsubscribed during the quiet period.
                    if !lock(&subscriptions).contains_key(&id) {
                        continue;
                    }
                    if runtime_tx
                        .send(RuntimeEvent::SourceChanged { node: id, path })
                        .await
                        .is_err()
                    {
                        debug!("runtime gone; stopping watcher loop");
                        return;
                    }
                }
            }
        }
    }
    debug!("watcher event loop finished");
}
