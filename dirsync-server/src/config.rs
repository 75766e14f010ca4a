use std::path::PathBuf;

use anyhow::Context;

const DEFAULT_BIND: &str = "0.0.0.0:9090";
const DEFAULT_DATABASE_URL: &str = "sqlite://dirsync.db";
const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 50 * 1024 * 1024;
// Room for the JSON envelope around base64 content: action, file name, hash.
const REQUEST_ENVELOPE_BYTES: u64 = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_upload_bytes: u64,
    pub max_download_bytes: u64,
}

impl Limits {
    /// Longest request line accepted: the largest permitted upload after
    /// base64 encoding, plus the envelope around it.
    pub fn max_request_line(&self) -> usize {
        let encoded = self.max_upload_bytes.div_ceil(3).saturating_mul(4);
        usize::try_from(encoded.saturating_add(REQUEST_ENVELOPE_BYTES)).unwrap_or(usize::MAX)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub database_url: String,
    pub storage_root: PathBuf,
    pub limits: Limits,
    pub credentials: Credentials,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let storage_root = std::env::var("DIRSYNC_STORAGE_ROOT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .context("DIRSYNC_STORAGE_ROOT is not set")?;
        let password =
            std::env::var("DIRSYNC_ADMIN_PASSWORD").context("DIRSYNC_ADMIN_PASSWORD is not set")?;
        let username = std::env::var("DIRSYNC_ADMIN_USERNAME")
            .unwrap_or_else(|_| DEFAULT_USERNAME.to_string());

        Ok(Self {
            bind: std::env::var("DIRSYNC_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string()),
            database_url: std::env::var("DIRSYNC_DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            storage_root,
            limits: Limits {
                max_upload_bytes: read_u64_env("DIRSYNC_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
                max_download_bytes: read_u64_env(
                    "DIRSYNC_MAX_DOWNLOAD_BYTES",
                    DEFAULT_MAX_DOWNLOAD_BYTES,
                ),
            },
            credentials: Credentials { username, password },
        })
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
