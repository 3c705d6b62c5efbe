//! File watching that reloads the registry.
//!
//! A [`ReloadSession`] owns one watcher and the task that debounces its
//! events. Stopping the session ends the task, which drops the watcher.

use crate::registry::MockRegistry;
use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A running watcher that reloads mocks after a quiet period.
pub struct ReloadSession {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    roots: Vec<PathBuf>,
}

impl ReloadSession {
    /// Watch every pattern root of the registry's loader.
    ///
    /// A root that does not exist yet is picked up once it is created.
    pub fn start(registry: Arc<MockRegistry>, debounce: Duration) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.send(res);
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;

        let roots = registry.loader().watch_roots();
        let mut watched = WatchedRoots::new(watcher);
        for root in &roots {
            watched.add(root.clone())?;
        }
        watched.rearm();

        let ignored = registry.config().cache_dir(registry.cwd());
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(registry, watched, event_rx, stop_rx, debounce, ignored));

        info!(roots = roots.len(), debounce_ms = debounce.as_millis() as u64, "Watching mock files");
        Ok(Self {
            stop_tx: Some(stop_tx),
            task,
            roots,
        })
    }

    /// Directories this session reloads for, whether they exist yet or not.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Stop watching; a reload already in progress still completes.
    pub fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        debug!(roots = self.roots.len(), "Reload session stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Active sessions of one process.
#[derive(Default)]
pub struct ReloadSessions {
    sessions: Vec<ReloadSession>,
}

impl ReloadSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, session: ReloadSession) {
        self.sessions.push(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stop_all(&mut self) {
        for session in self.sessions.drain(..) {
            session.stop();
        }
    }
}

/// A root that does not exist yet, and the closest existing directory above
/// it that is watched in its place.
struct PendingRoot {
    root: PathBuf,
    anchor: Option<PathBuf>,
}

/// Roots watched recursively plus roots waiting to be created.
struct WatchedRoots {
    watcher: RecommendedWatcher,
    armed: Vec<PathBuf>,
    pending: Vec<PendingRoot>,
}

impl WatchedRoots {
    fn new(watcher: RecommendedWatcher) -> Self {
        Self {
            watcher,
            armed: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn add(&mut self, root: PathBuf) -> Result<()> {
        if root.is_dir() {
            self.watcher
                .watch(&root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch path: {}", root.display()))?;
            self.armed.push(root);
        } else {
            self.pending.push(PendingRoot { root, anchor: None });
        }
        Ok(())
    }

    /// Arm pending roots that now exist and move the others' anchors closer.
    fn rearm(&mut self) {
        for mut pending in std::mem::take(&mut self.pending) {
            if pending.root.is_dir() {
                match self.watcher.watch(&pending.root, RecursiveMode::Recursive) {
                    Ok(()) => {
                        info!(path = %pending.root.display(), "Mock directory created, watching it");
                        self.armed.push(pending.root);
                        continue;
                    }
                    Err(e) => warn!(path = %pending.root.display(), error = %e, "Failed to watch mock directory"),
                }
            }

            let anchor = nearest_existing_ancestor(&pending.root);
            if anchor != pending.anchor {
                match &anchor {
                    Some(dir) => {
                        if let Err(e) = self.watcher.watch(dir, RecursiveMode::NonRecursive) {
                            warn!(path = %dir.display(), error = %e, "Failed to watch parent directory");
                        }
                        debug!(
                            root = %pending.root.display(),
                            anchor = %dir.display(),
                            "Mock directory does not exist yet, waiting for it"
                        );
                    }
                    None => warn!(path = %pending.root.display(), "No existing parent to watch"),
                }
                pending.anchor = anchor;
            }
            self.pending.push(pending);
        }
    }

    /// Inside an armed root, or on the way to a pending one.
    fn is_relevant(&self, path: &Path) -> bool {
        self.armed.iter().any(|root| path.starts_with(root))
            || self.pending.iter().any(|pending| pending.root.starts_with(path))
    }
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors().skip(1).find(|dir| dir.is_dir()).map(Path::to_path_buf)
}

async fn run(
    registry: Arc<MockRegistry>,
    mut watched: WatchedRoots,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    mut stop_rx: oneshot::Receiver<()>,
    debounce: Duration,
    ignored: PathBuf,
) {
    let mut deadline: Option<Instant> = None;
    let mut pending = 0usize;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    // Judge relevance against the roots as they were before this event
                    let relevant = should_process_event(&event, &ignored)
                        && event.paths.iter().any(|path| watched.is_relevant(path));
                    if !watched.pending.is_empty() {
                        watched.rearm();
                    }
                    if relevant {
                        pending += 1;
                        deadline = Some(Instant::now() + debounce);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "File watcher error"),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                debug!(events = pending, "Mock files changed");
                pending = 0;
                match registry.reload().await {
                    Ok(_) => info!("[Mock] file update successful"),
                    Err(e) => error!(error = %e, "Mock reload failed, keeping previous mocks"),
                }
            }
        }
    }
}

/// Changes to files, ignoring the registry's own cache writes.
fn should_process_event(event: &Event, ignored: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|path| !path.starts_with(ignored))
}
