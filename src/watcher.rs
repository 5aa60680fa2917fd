//! Trace discovery and lifecycle
//!
//! Filesystem notifications on the trace root are normalized into
//! [`TraceEvent`]s on a channel, and a single consumer loop turns them into
//! registry mutations: appeared → derive, start, register; disappeared →
//! unregister, stop, remove. One consumer means events for a path are
//! handled in delivery order. Failures are confined to the directory that
//! caused them; the loop itself only exits on shutdown.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ident::{self, TraceId};
use crate::registry::{TraceEntry, TraceRegistry};
use crate::runtime::{ContainerRuntime, LaunchOptions};

/// A filesystem change in the trace root, reduced to what the manager
/// cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Appeared(PathBuf),
    Disappeared(PathBuf),
}

/// Non-recursive watch on the trace root directory.
///
/// The notify backend delivers events on its own thread; they are pushed
/// onto an unbounded channel and consumed by [`TraceManager::run`].
pub struct TraceWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<TraceEvent>,
}

impl TraceWatcher {
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for ev in map_event(&event) {
                        let _ = tx.send(ev);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Filesystem watcher error");
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(root, RecursiveMode::NonRecursive)?;
        info!(root = %root.display(), "Watching trace root");

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    pub async fn recv(&mut self) -> Option<TraceEvent> {
        self.rx.recv().await
    }
}

/// Reduce a notify event to trace events. Renames count as removal at the
/// old path and arrival at the new one; everything else (metadata, data
/// writes inside entries) is noise here.
fn map_event(event: &Event) -> Vec<TraceEvent> {
    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .cloned()
            .map(TraceEvent::Appeared)
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .cloned()
            .map(TraceEvent::Disappeared)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .cloned()
            .map(TraceEvent::Appeared)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .cloned()
            .map(TraceEvent::Disappeared)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths = [from, to]
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push(TraceEvent::Disappeared(from.clone()));
            }
            if let Some(to) = event.paths.get(1) {
                out.push(TraceEvent::Appeared(to.clone()));
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Owns the appeared/disappeared handling and the shutdown teardown of
/// trace containers.
pub struct TraceManager {
    registry: Arc<TraceRegistry>,
    runtime: Arc<ContainerRuntime>,
    inspector: String,
    image: String,
    storage_root: Option<PathBuf>,
    notify_topic: Option<String>,
    notify_on_new: bool,
    public_url: String,
}

impl TraceManager {
    pub fn new(
        registry: Arc<TraceRegistry>,
        runtime: Arc<ContainerRuntime>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            runtime,
            inspector: config.runtime.inspector.clone(),
            image: config.runtime.image.clone(),
            storage_root: config.traces.storage_dir.clone(),
            notify_topic: config.traces.notify_topic.clone(),
            notify_on_new: config.traces.notify_on_new,
            public_url: config.server.public_url.clone(),
        }
    }

    /// Enumerate the trace root once at startup, adopting every existing
    /// entry as if it had just been created but without "newly added" side
    /// effects. Runs to completion before the lobby starts serving.
    pub async fn scan_existing(&self, root: &Path) -> anyhow::Result<usize> {
        let entries = std::fs::read_dir(root).map_err(|e| {
            anyhow::anyhow!("Failed to enumerate trace root '{}': {}", root.display(), e)
        })?;

        let mut adopted = 0;
        for entry in entries.flatten() {
            if self.adopt(&entry.path(), false).await {
                adopted += 1;
            }
        }
        info!(count = adopted, "Adopted existing traces");
        Ok(adopted)
    }

    /// Consume watcher events until shutdown is signalled or the watcher
    /// goes away.
    pub async fn run(&self, mut watcher: TraceWatcher, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = watcher.recv() => {
                    match event {
                        Some(TraceEvent::Appeared(path)) => {
                            self.adopt(&path, true).await;
                        }
                        Some(TraceEvent::Disappeared(path)) => {
                            self.drop_trace(&path).await;
                        }
                        None => {
                            warn!("Watcher channel closed, stopping trace discovery");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Trace discovery shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Derive, launch, register. Returns whether a trace was registered.
    ///
    /// Symlinks and stray files fall out naturally: derivation classifies
    /// them as not-a-trace. Every failure is isolated to this directory.
    pub async fn adopt(&self, dir: &Path, newly_added: bool) -> bool {
        let id = match ident::derive(&self.inspector, dir).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(dir = %dir.display(), "Not a trace, skipping");
                return false;
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Trace inspection failed, skipping");
                return false;
            }
        };

        let options = self.launch_options(&id, newly_added);
        let container = match self.runtime.start_trace(&id, dir, &options).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(trace = %id, dir = %dir.display(), error = %e, "Failed to start trace container");
                return false;
            }
        };

        let entry = TraceEntry {
            id: id.clone(),
            dir: dir.to_path_buf(),
            container: container.clone(),
        };
        if let Err(e) = self.registry.register(entry) {
            // Duplicate id or directory: the existing entry stays
            // authoritative; the container we just started must not leak.
            error!(trace = %id, dir = %dir.display(), error = %e, "Registration rejected, discarding container");
            self.discard(&container).await;
            return false;
        }

        info!(trace = %id, dir = %dir.display(), container = %container.id, newly_added, "Trace registered");
        true
    }

    /// Unregister and tear down the container for a deleted directory.
    /// Unknown directories are a no-op (duplicate deletion events).
    pub async fn drop_trace(&self, dir: &Path) {
        let Some(entry) = self.registry.unregister(dir) else {
            debug!(dir = %dir.display(), "Deletion for unknown directory, ignoring");
            return;
        };

        self.discard(&entry.container).await;
        info!(trace = %entry.id, dir = %dir.display(), "Trace unregistered");
    }

    /// Stop then force-remove every registered container. Each teardown is
    /// independent; one failure never stops the rest.
    pub async fn stop_all(&self) {
        let entries = self.registry.drain();
        info!(count = entries.len(), "Stopping all trace containers");
        for entry in entries {
            self.discard(&entry.container).await;
        }
    }

    /// Graceful stop, then authoritative removal. Stop failures are
    /// expected (the container may have died); removal failures mean a
    /// possible resource leak and are logged at warn.
    async fn discard(&self, container: &crate::runtime::ContainerHandle) {
        if let Err(e) = self.runtime.stop(container).await {
            debug!(container = %container.id, error = %e, "Container stop failed, forcing removal");
        }
        if let Err(e) = self.runtime.remove(container).await {
            warn!(container = %container.id, error = %e, "Container removal failed, resource may leak");
        }
    }

    fn launch_options(&self, id: &TraceId, newly_added: bool) -> LaunchOptions {
        let storage_dir = self.storage_root.as_ref().and_then(|root| {
            let dir = root.join(id.as_str());
            match std::fs::create_dir_all(&dir) {
                Ok(()) => Some(dir),
                Err(e) => {
                    warn!(trace = %id, error = %e, "Cannot create storage directory, trace will not persist state");
                    None
                }
            }
        });

        let mut env = vec![(
            "TRACE_PUBLIC_URL".to_string(),
            format!("{}/debug/{}", self.public_url.trim_end_matches('/'), id),
        )];
        if let Some(topic) = &self.notify_topic {
            env.push(("TRACE_NOTIFY_TOPIC".to_string(), topic.clone()));
        }
        // Suppressed for traces found by the startup scan: they are not new.
        if newly_added && self.notify_on_new {
            env.push(("TRACE_NOTIFY_NEW".to_string(), "1".to_string()));
        }

        LaunchOptions {
            image: self.image.clone(),
            storage_dir,
            env,
        }
    }
}
