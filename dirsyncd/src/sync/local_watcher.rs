use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;

use super::lock;
use super::paths::is_ignored;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEventKind {
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvent {
    pub kind: LocalEventKind,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watch root {} does not exist", .0.display())]
    MissingRoot(PathBuf),
    #[error("file system watcher failed: {0}")]
    Notify(#[from] notify::Error),
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<LocalEvent>>>>;

#[derive(Default)]
struct WatcherState {
    watcher: Option<RecommendedWatcher>,
    roots: Arc<Mutex<Vec<PathBuf>>>,
}

#[derive(Default)]
pub struct DirectoryWatcher {
    state: Mutex<WatcherState>,
    subscribers: Subscribers,
}

impl DirectoryWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) -> Result<(), WatcherError> {
        let mut state = lock(&self.state);
        if state.watcher.is_some() {
            return Ok(());
        }
        let subscribers = Arc::clone(&self.subscribers);
        let roots = Arc::clone(&state.roots);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event.need_rescan() {
                    tracing::warn!("watcher queue overflowed, dropping rescan notification");
                    return;
                }
                let roots = lock(&roots).clone();
                for local in map_event(&roots, event) {
                    lock(&subscribers).retain(|tx| tx.send(local.clone()).is_ok());
                }
            }
            Err(err) => tracing::warn!(error = %err, "watcher reported an error"),
        })?;
        for root in lock(&state.roots).iter() {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }
        state.watcher = Some(watcher);
        tracing::debug!("directory watcher started");
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = lock(&self.state);
        if state.watcher.take().is_some() {
            tracing::debug!("directory watcher stopped");
        }
        lock(&self.subscribers).clear();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).watcher.is_some()
    }

    pub fn watch(&self, root: &Path) -> Result<PathBuf, WatcherError> {
        if !root.is_dir() {
            return Err(WatcherError::MissingRoot(root.to_path_buf()));
        }
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let mut state = lock(&self.state);
        {
            let mut roots = lock(&state.roots);
            if roots.contains(&root) {
                return Ok(root);
            }
            roots.push(root.clone());
        }
        if let Some(watcher) = state.watcher.as_mut() {
            watcher.watch(&root, RecursiveMode::Recursive)?;
        }
        tracing::info!(root = %root.display(), "watching directory");
        Ok(root)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LocalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }
}

fn map_event(roots: &[PathBuf], event: Event) -> Vec<LocalEvent> {
    let kinds: Vec<LocalEventKind> = match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(notify::event::RenameMode::Both)) => {
            vec![LocalEventKind::Removed, LocalEventKind::Changed]
        }
        EventKind::Modify(notify::event::ModifyKind::Name(notify::event::RenameMode::From)) => {
            vec![LocalEventKind::Removed]
        }
        EventKind::Create(_) | EventKind::Modify(_) => vec![LocalEventKind::Changed],
        EventKind::Remove(_) => vec![LocalEventKind::Removed],
        _ => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .enumerate()
        .filter(|(_, path)| is_tracked(roots, path))
        .filter_map(|(idx, path)| {
            let kind = kinds.get(idx).or(kinds.last()).copied()?;
            Some(LocalEvent { kind, path })
        })
        .collect()
}

fn is_tracked(roots: &[PathBuf], path: &Path) -> bool {
    roots
        .iter()
        .find(|root| path.starts_with(root))
        .is_some_and(|root| path != root && !is_ignored(root, path))
}
