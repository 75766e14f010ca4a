use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dirsync_core::protocol::UploadedFile;
use dirsync_core::{ClientError, ProtocolClient, RetryPolicy};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::lock;

pub const DEFAULT_PACING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Upload,
    Delete,
    Download,
}

#[derive(Debug, Clone)]
pub struct SyncTask {
    pub relative_path: String,
    pub file: PathBuf,
    pub operation: SyncOperation,
    pub enqueued_at: OffsetDateTime,
}

impl SyncTask {
    pub fn new(relative_path: impl Into<String>, file: PathBuf, operation: SyncOperation) -> Self {
        Self {
            relative_path: relative_path.into(),
            file,
            operation,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    Queued { path: String, operation: SyncOperation },
    InFlight { path: String },
    Synced { path: String },
    Failed { path: String, error: String },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("delivery queue is closed")]
    Closed,
}

pub trait Uploader: Send + Sync + 'static {
    fn upload(&self, task: &SyncTask) -> impl Future<Output = Result<(), ClientError>> + Send;
}

pub struct RemoteUploader {
    client: ProtocolClient,
    folder_id: i64,
    retry: RetryPolicy,
    // Remote file name to the relative path last uploaded under it.
    remote_names: Mutex<HashMap<String, String>>,
}

impl RemoteUploader {
    pub fn new(client: ProtocolClient, folder_id: i64) -> Self {
        Self {
            client,
            folder_id,
            retry: RetryPolicy::default(),
            remote_names: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // Every file lands in one remote folder by base name, so distinct local
    // paths can replace each other there. Returns the path being replaced.
    fn claim_remote_name(&self, task: &SyncTask) -> Option<String> {
        let name = task.file.file_name()?.to_string_lossy().into_owned();
        let previous = lock(&self.remote_names).insert(name, task.relative_path.clone())?;
        (previous != task.relative_path).then_some(previous)
    }
}

impl Uploader for RemoteUploader {
    async fn upload(&self, task: &SyncTask) -> Result<(), ClientError> {
        if let Some(replaced) = self.claim_remote_name(task) {
            tracing::warn!(
                path = %task.relative_path,
                replaced = %replaced,
                folder_id = self.folder_id,
                "upload shares a remote file name with another local path and overwrites it"
            );
        }
        let uploaded: UploadedFile = self
            .retry
            .run(&task.relative_path, || self.client.upload(&task.file, self.folder_id))
            .await?;
        tracing::debug!(
            path = %task.relative_path,
            file_id = uploaded.file_id,
            file_hash = %uploaded.file_hash,
            "upload confirmed"
        );
        Ok(())
    }
}

pub struct DeliveryQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<SyncTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    status: broadcast::Sender<SyncStatus>,
}

impl DeliveryQueue {
    pub fn start<U: Uploader>(
        uploader: Arc<U>,
        pacing: Duration,
        status: broadcast::Sender<SyncStatus>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(run_worker(
            rx,
            uploader,
            pacing,
            status.clone(),
            Arc::clone(&closing),
        ));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            closing,
            status,
        }
    }

    pub fn enqueue(&self, task: SyncTask) -> Result<(), QueueError> {
        let guard = lock(&self.tx);
        let tx = guard.as_ref().ok_or(QueueError::Closed)?;
        let queued = SyncStatus::Queued {
            path: task.relative_path.clone(),
            operation: task.operation,
        };
        tx.send(task).map_err(|_| QueueError::Closed)?;
        let _ = self.status.send(queued);
        Ok(())
    }

    // The task in flight finishes; queued ones are dropped.
    pub async fn stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
        lock(&self.tx).take();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker
            && let Err(err) = worker.await
        {
            tracing::error!(error = %err, "delivery worker panicked");
        }
    }
}

async fn run_worker<U: Uploader>(
    mut rx: mpsc::UnboundedReceiver<SyncTask>,
    uploader: Arc<U>,
    pacing: Duration,
    status: broadcast::Sender<SyncStatus>,
    closing: Arc<AtomicBool>,
) {
    while let Some(task) = rx.recv().await {
        if closing.load(Ordering::SeqCst) {
            break;
        }
        deliver(uploader.as_ref(), &task, &status).await;
        tokio::time::sleep(pacing).await;
    }
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::info!(dropped, "delivery queue stopped with pending tasks");
    }
}

async fn deliver<U: Uploader>(uploader: &U, task: &SyncTask, status: &broadcast::Sender<SyncStatus>) {
    let path = task.relative_path.clone();
    match task.operation {
        SyncOperation::Upload => {
            let _ = status.send(SyncStatus::InFlight { path: path.clone() });
            match uploader.upload(task).await {
                Ok(()) => {
                    tracing::info!(path = %path, "file synced");
                    let _ = status.send(SyncStatus::Synced { path });
                }
                Err(err) => {
                    tracing::error!(path = %path, error = %err, "upload failed, task dropped");
                    let _ = status.send(SyncStatus::Failed {
                        path,
                        error: err.to_string(),
                    });
                }
            }
        }
        SyncOperation::Delete => {
            tracing::info!(path = %path, "local delete observed, remote copy kept");
        }
        SyncOperation::Download => {
            tracing::info!(path = %path, "download tasks are not delivered by the agent");
        }
    }
}
