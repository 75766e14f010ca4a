use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

use super::lock;
use super::paths::{is_ignored_name, relative_key};

const READ_CHUNK: usize = 64 * 1024;

pub type DigestMap = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is not a regular file", .0.display())]
    NotAFile(PathBuf),
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("hashing task failed: {0}")]
    Join(String),
}

impl HashError {
    fn io(path: &Path, source: io::Error) -> Self {
        HashError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HashError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Clone)]
struct HashRecord {
    digest: String,
    modified: SystemTime,
    len: u64,
}

#[derive(Debug, Default)]
pub struct ContentHasher {
    cache: Mutex<HashMap<PathBuf, HashRecord>>,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn hash(&self, file: &Path) -> Result<String, HashError> {
        let metadata = tokio::fs::metadata(file)
            .await
            .map_err(|err| HashError::io(file, err))?;
        if !metadata.is_file() {
            return Err(HashError::NotAFile(file.to_path_buf()));
        }
        let modified = metadata.modified().map_err(|err| HashError::io(file, err))?;
        let len = metadata.len();

        if let Some(record) = self.cached(file)
            && record.modified == modified
            && record.len == len
        {
            return Ok(record.digest);
        }

        let digest = stream_digest(file).await?;
        self.lock_cache().insert(
            file.to_path_buf(),
            HashRecord {
                digest: digest.clone(),
                modified,
                len,
            },
        );
        Ok(digest)
    }

    pub fn forget(&self, file: &Path) {
        self.lock_cache().remove(file);
    }

    pub async fn hash_directory(&self, root: &Path) -> Result<DigestMap, HashError> {
        let walk_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&walk_root))
            .await
            .map_err(|err| HashError::Join(err.to_string()))??;

        let mut digests = DigestMap::new();
        for (key, path) in files {
            match self.hash(&path).await {
                Ok(digest) => {
                    digests.insert(key, digest);
                }
                Err(err) if err.is_not_found() => {
                    tracing::debug!(path = %path.display(), "file vanished while hashing");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(digests)
    }

    fn cached(&self, file: &Path) -> Option<HashRecord> {
        self.lock_cache().get(file).cloned()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, HashRecord>> {
        lock(&self.cache)
    }
}

pub fn diff(old: &DigestMap, new: &DigestMap) -> BTreeSet<String> {
    let changed = new
        .iter()
        .filter(|(key, digest)| old.get(*key) != Some(*digest))
        .map(|(key, _)| key.clone());
    let removed = old.keys().filter(|key| !new.contains_key(*key)).cloned();
    changed.chain(removed).collect()
}

async fn stream_digest(file: &Path) -> Result<String, HashError> {
    let mut reader = tokio::fs::File::open(file)
        .await
        .map_err(|err| HashError::io(file, err))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = reader
            .read(&mut buf)
            .await
            .map_err(|err| HashError::io(file, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_files(root: &Path) -> Result<Vec<(String, PathBuf)>, HashError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored_name(&entry.file_name().to_string_lossy()));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(key) = relative_key(root, entry.path()) {
            files.push((key, entry.into_path()));
        }
    }
    Ok(files)
}
