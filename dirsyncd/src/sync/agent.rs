use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::hasher::{ContentHasher, DigestMap, HashError};
use super::local_watcher::{DirectoryWatcher, LocalEvent, WatcherError};
use super::lock;
use super::paths::{is_ignored, relative_key};
use super::queue::{DeliveryQueue, SyncOperation, SyncStatus, SyncTask, Uploader};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);
const STATUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Unknown,
    Hashed,
    PendingSync,
    InFlight,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error("{} is outside the sync root", .0.display())]
    OutsideRoot(PathBuf),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub sync_root: PathBuf,
    pub debounce: Duration,
    pub pacing: Duration,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct AgentInner {
    root: PathBuf,
    debounce: Duration,
    hasher: ContentHasher,
    known: Mutex<DigestMap>,
    states: Mutex<HashMap<String, PathState>>,
    timers: Mutex<HashMap<String, Timer>>,
    next_generation: AtomicU64,
    queue: DeliveryQueue,
}

pub struct SyncAgent {
    inner: Arc<AgentInner>,
    watcher: DirectoryWatcher,
    status: broadcast::Sender<SyncStatus>,
    background: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SyncAgent {
    pub async fn start<U: Uploader>(config: AgentConfig, uploader: Arc<U>) -> Result<Self, AgentError> {
        let watcher = DirectoryWatcher::new();
        let root = watcher.watch(&config.sync_root)?;
        let events = watcher.subscribe();
        watcher.start()?;

        let hasher = ContentHasher::new();
        let baseline = hasher.hash_directory(&root).await?;
        let states = baseline
            .keys()
            .map(|key| (key.clone(), PathState::Hashed))
            .collect();
        tracing::info!(root = %root.display(), files = baseline.len(), "baseline hashed");

        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        let queue = DeliveryQueue::start(uploader, config.pacing, status.clone());
        let inner = Arc::new(AgentInner {
            root,
            debounce: config.debounce,
            hasher,
            known: Mutex::new(baseline),
            states: Mutex::new(states),
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            queue,
        });

        let background = vec![
            tokio::spawn(track_status(Arc::clone(&inner), status.subscribe())),
            tokio::spawn(event_loop(Arc::clone(&inner), events)),
        ];
        Ok(Self {
            inner,
            watcher,
            status,
            background: Mutex::new(background),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn path_state(&self, relative: &str) -> PathState {
        self.inner.state(relative)
    }

    pub fn known_digest(&self, relative: &str) -> Option<String> {
        lock(&self.inner.known).get(relative).cloned()
    }

    pub fn pending_timers(&self) -> usize {
        lock(&self.inner.timers).len()
    }

    pub async fn sync_file(&self, path: &Path) -> Result<usize, AgentError> {
        let absolute = if path.is_relative() {
            self.inner.root.join(path)
        } else {
            path.to_path_buf()
        };
        let key = relative_key(&self.inner.root, &absolute)
            .or_else(|| {
                let canonical = std::fs::canonicalize(&absolute).ok()?;
                relative_key(&self.inner.root, &canonical)
            })
            .ok_or_else(|| AgentError::OutsideRoot(absolute.clone()))?;
        if is_ignored(&self.inner.root, &absolute) {
            return Ok(0);
        }
        self.inner.cancel_timer(&key);
        Ok(self.inner.check(&key, &absolute).await)
    }

    // An upload already in flight runs to completion.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let timers: Vec<Timer> = lock(&self.inner.timers).drain().map(|(_, timer)| timer).collect();
        for timer in &timers {
            timer.handle.abort();
        }
        self.watcher.stop();
        self.inner.queue.stop().await;
        for handle in lock(&self.background).drain(..) {
            handle.abort();
        }
        tracing::info!(cancelled_timers = timers.len(), "sync agent stopped");
    }
}

impl AgentInner {
    fn state(&self, key: &str) -> PathState {
        lock(&self.states).get(key).copied().unwrap_or(PathState::Unknown)
    }

    fn set_state(&self, key: &str, state: PathState) {
        let mut states = lock(&self.states);
        if state == PathState::Unknown {
            states.remove(key);
        } else {
            states.insert(key.to_string(), state);
        }
    }

    // Moves `key` to `to` only while it is still in `from`.
    fn advance(&self, key: &str, from: PathState, to: PathState) -> bool {
        let mut states = lock(&self.states);
        match states.get_mut(key) {
            Some(state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    fn schedule(self: &Arc<Self>, key: String, path: PathBuf) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let timer_key = key.clone();
        let mut timers = lock(&self.timers);
        if let Some(previous) = timers.remove(&key) {
            previous.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            // Once fired the check is no longer cancellable by newer events.
            {
                let mut timers = lock(&inner.timers);
                if timers.get(&timer_key).is_some_and(|t| t.generation == generation) {
                    timers.remove(&timer_key);
                }
            }
            inner.check(&timer_key, &path).await;
        });
        timers.insert(key, Timer { generation, handle });
    }

    fn cancel_timer(&self, key: &str) {
        if let Some(timer) = lock(&self.timers).remove(key) {
            timer.handle.abort();
        }
    }

    async fn check(&self, key: &str, path: &Path) -> usize {
        match self.hasher.hash(path).await {
            Ok(digest) => {
                let previous = lock(&self.known).insert(key.to_string(), digest.clone());
                if previous.as_deref() == Some(digest.as_str()) {
                    tracing::debug!(path = %key, "content unchanged");
                    if self.state(key) == PathState::Unknown {
                        self.set_state(key, PathState::Hashed);
                    }
                    return 0;
                }
                self.enqueue(key, path, SyncOperation::Upload)
            }
            Err(err) if err.is_not_found() => self.check_removed(key, path),
            Err(HashError::NotAFile(_)) if path.is_dir() => self.check_directory(key, path).await,
            Err(HashError::NotAFile(_)) => 0,
            Err(err) => {
                tracing::warn!(path = %key, error = %err, "failed to hash file");
                0
            }
        }
    }

    fn check_removed(&self, key: &str, path: &Path) -> usize {
        self.hasher.forget(path);
        let prefix = format!("{key}/");
        let removed: Vec<String> = {
            let mut known = lock(&self.known);
            let keys: Vec<String> = known
                .keys()
                .filter(|known_key| known_key.as_str() == key || known_key.starts_with(&prefix))
                .cloned()
                .collect();
            for removed_key in &keys {
                known.remove(removed_key);
            }
            keys
        };
        removed
            .iter()
            .map(|removed_key| {
                let file = self.root.join(removed_key);
                self.hasher.forget(&file);
                self.enqueue(removed_key, &file, SyncOperation::Delete)
            })
            .sum()
    }

    // Directories moved into the tree produce a single event; sweep their contents.
    async fn check_directory(&self, key: &str, path: &Path) -> usize {
        let digests = match self.hasher.hash_directory(path).await {
            Ok(digests) => digests,
            Err(err) => {
                tracing::warn!(path = %key, error = %err, "failed to hash directory");
                return 0;
            }
        };
        let mut queued = 0;
        for (sub, digest) in digests {
            let full_key = format!("{key}/{sub}");
            let previous = lock(&self.known).insert(full_key.clone(), digest.clone());
            if previous.as_deref() != Some(digest.as_str()) {
                queued += self.enqueue(&full_key, &path.join(&sub), SyncOperation::Upload);
            }
        }
        queued
    }

    fn enqueue(&self, key: &str, path: &Path, operation: SyncOperation) -> usize {
        match self.queue.enqueue(SyncTask::new(key, path.to_path_buf(), operation)) {
            Ok(()) => {
                let state = match operation {
                    SyncOperation::Delete => PathState::Unknown,
                    _ => PathState::PendingSync,
                };
                self.set_state(key, state);
                tracing::debug!(path = %key, ?operation, "task queued");
                1
            }
            Err(err) => {
                tracing::warn!(path = %key, error = %err, "task not queued");
                0
            }
        }
    }
}

async fn event_loop(inner: Arc<AgentInner>, mut events: mpsc::UnboundedReceiver<LocalEvent>) {
    while let Some(event) = events.recv().await {
        let Some(key) = relative_key(&inner.root, &event.path) else {
            continue;
        };
        tracing::trace!(path = %key, kind = ?event.kind, "file system event");
        inner.schedule(key, event.path);
    }
}

async fn track_status(inner: Arc<AgentInner>, mut status: broadcast::Receiver<SyncStatus>) {
    loop {
        match status.recv().await {
            Ok(SyncStatus::InFlight { path }) => inner.set_state(&path, PathState::InFlight),
            Ok(SyncStatus::Synced { path }) => {
                // A newer change queued meanwhile keeps the path pending.
                if !inner.advance(&path, PathState::InFlight, PathState::Hashed) {
                    tracing::debug!(path = %path, state = ?inner.state(&path), "late confirmation ignored");
                }
            }
            Ok(SyncStatus::Failed { path, .. }) => {
                // Forget the digest so the next event for this path uploads again.
                lock(&inner.known).remove(&path);
                inner.set_state(&path, PathState::Unknown);
            }
            Ok(SyncStatus::Queued { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "status tracker lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
