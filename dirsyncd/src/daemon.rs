use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dirsync_core::protocol::{FileEntry, FolderNode};
use dirsync_core::{ConnectionManager, DEFAULT_MAX_UPLOAD_BYTES, ProtocolClient, ServerAddress};
use tokio::sync::broadcast;

use crate::sync::agent::{AgentConfig, DEFAULT_DEBOUNCE, SyncAgent};
use crate::sync::queue::{DEFAULT_PACING, RemoteUploader, SyncStatus};

const DEFAULT_SYNC_DIR_NAME: &str = "DirSync";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u64 = 9090;
const DEFAULT_FOLDER_ID: u64 = 1;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub address: ServerAddress,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sync_root: PathBuf,
    pub folder_id: i64,
    pub debounce: Duration,
    pub pacing: Duration,
    pub max_upload_bytes: u64,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let sync_root = std::env::var("DIRSYNC_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let host = std::env::var("DIRSYNC_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = u16::try_from(read_u64_env("DIRSYNC_PORT", DEFAULT_PORT))
            .context("DIRSYNC_PORT is out of range")?;
        let folder_id = i64::try_from(read_u64_env("DIRSYNC_FOLDER_ID", DEFAULT_FOLDER_ID))
            .context("DIRSYNC_FOLDER_ID is out of range")?;

        Ok(Self {
            address: ServerAddress::new(host, port),
            username: read_string_env("DIRSYNC_USERNAME"),
            password: read_string_env("DIRSYNC_PASSWORD"),
            sync_root,
            folder_id,
            debounce: Duration::from_millis(read_u64_env(
                "DIRSYNC_DEBOUNCE_MS",
                DEFAULT_DEBOUNCE.as_millis() as u64,
            )),
            pacing: Duration::from_millis(read_u64_env(
                "DIRSYNC_PACING_MS",
                DEFAULT_PACING.as_millis() as u64,
            )),
            max_upload_bytes: read_u64_env("DIRSYNC_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: ProtocolClient,
}

impl DaemonRuntime {
    /// Connects and logs in. Both must succeed before anything is synced.
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = ProtocolClient::new(Arc::new(ConnectionManager::new()))
            .with_address(config.address.clone())
            .with_max_upload_bytes(config.max_upload_bytes);
        client
            .connect()
            .await
            .with_context(|| format!("failed to connect to {}", config.address))?;

        match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                client
                    .login(username, password)
                    .await
                    .context("login failed")?;
                tracing::info!(username = %username, server = %config.address, "logged in");
            }
            _ => anyhow::bail!("DIRSYNC_USERNAME and DIRSYNC_PASSWORD must be set"),
        }

        Ok(Self { config, client })
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", self.config.sync_root))?;

        let uploader = Arc::new(RemoteUploader::new(self.client.clone(), self.config.folder_id));
        let agent = SyncAgent::start(
            AgentConfig {
                sync_root: self.config.sync_root.clone(),
                debounce: self.config.debounce,
                pacing: self.config.pacing,
            },
            uploader,
        )
        .await
        .context("failed to start sync agent")?;
        tracing::info!(
            sync_root = %agent.root().display(),
            folder_id = self.config.folder_id,
            server = %self.config.address,
            "dirsyncd started"
        );

        let status_log = tokio::spawn(log_status(agent.subscribe_status()));
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutdown requested");

        agent.stop().await;
        status_log.abort();
        self.client.connection().disconnect().await;
        Ok(())
    }
}

async fn log_status(mut rx: broadcast::Receiver<SyncStatus>) {
    loop {
        match rx.recv().await {
            Ok(status) => tracing::debug!(status = %describe_status(&status), "sync status"),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
