use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::store::{MetadataStore, StoreError};

pub const FOLDER_ICON: &str = "📁";
pub const MAX_NAME_CHARS: usize = 180;

const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage root is not configured")]
    MissingRoot,
    #[error("folder not found: {0}")]
    FolderNotFound(i64),
    #[error("folder hierarchy contains a cycle at folder {0}")]
    Cycle(i64),
    // The attempted location is only logged, never returned to clients.
    #[error("access denied")]
    Security,
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Maps logical folders onto directories below one storage root.
#[derive(Debug, Clone)]
pub struct StorageManager {
    root: PathBuf,
}

impl StorageManager {
    /// Creates the root directory if needed and pins its canonical form.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(StorageError::MissingRoot);
        }
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;
        tracing::info!(root = %root.display(), "storage root ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walks from `folder_id` up to the root record, joining sanitized names.
    ///
    /// The root record maps to the storage root itself and adds no segment.
    pub async fn resolve_folder_path(
        &self,
        store: &MetadataStore,
        folder_id: i64,
    ) -> Result<PathBuf, StorageError> {
        let mut segments = Vec::new();
        let mut visited = HashSet::new();
        let mut current = store
            .get_folder(folder_id)
            .await?
            .ok_or(StorageError::FolderNotFound(folder_id))?;

        while let Some(parent_id) = current.parent_id {
            if !visited.insert(current.id) {
                return Err(StorageError::Cycle(current.id));
            }
            segments.push(sanitize_name(&current.name));
            current = store
                .get_folder(parent_id)
                .await?
                .ok_or(StorageError::FolderNotFound(parent_id))?;
        }

        let mut path = self.root.clone();
        for segment in segments.iter().rev() {
            path.push(segment);
        }
        self.assert_within_root(&path)
    }

    /// Physical location of file `name` inside an already resolved folder.
    pub fn file_path(&self, folder_path: &Path, name: &str) -> Result<PathBuf, StorageError> {
        self.assert_within_root(&folder_path.join(sanitize_name(name)))
    }

    /// Returns the canonical form of `path`, or a security fault when it is
    /// not a descendant of the storage root.
    pub fn assert_within_root(&self, path: &Path) -> Result<PathBuf, StorageError> {
        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(self.violation(path));
        }
        let candidate = canonicalize_lenient(path)?;
        if candidate.starts_with(&self.root) {
            Ok(candidate)
        } else {
            Err(self.violation(path))
        }
    }

    /// Removes a directory tree, files before their directories.
    pub async fn remove_tree(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.assert_within_root(path)?;
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.remove_tree_blocking(&path))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err)))?
    }

    fn remove_tree_blocking(&self, dir: &Path) -> Result<(), StorageError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let path = self.assert_within_root(&path)?;
                self.remove_tree_blocking(&path)?;
            } else {
                // Symlinks are unlinked, never followed.
                remove_file_if_exists(&path)?;
            }
        }
        match std::fs::remove_dir(dir) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn violation(&self, path: &Path) -> StorageError {
        tracing::error!(
            attempted = %path.display(),
            root = %self.root.display(),
            "path escapes storage root"
        );
        StorageError::Security
    }
}

/// Makes an arbitrary display name safe to use as one path segment.
pub fn sanitize_name(name: &str) -> String {
    let name = name
        .strip_prefix(FOLDER_ICON)
        .map(str::trim_start)
        .unwrap_or(name);
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_control() || ILLEGAL_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return "_".to_string();
    }
    replaced.chars().take(MAX_NAME_CHARS).collect()
}

pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Canonicalizes the longest existing prefix of `path` and re-appends the rest.
fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();
    loop {
        match std::fs::canonicalize(&existing) {
            Ok(mut canonical) => {
                for part in tail.iter().rev() {
                    canonical.push(part);
                }
                return Ok(canonical);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name() else {
                    return Err(err);
                };
                tail.push(name.to_os_string());
                if !existing.pop() {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;
    use tempfile::tempdir;

    async fn make_store() -> MetadataStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = MetadataStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    #[test]
    fn sanitize_replaces_illegal_and_control_chars() {
        assert_eq!(sanitize_name("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_name("tab\there"), "tab_here");
        assert_eq!(sanitize_name("Reports"), "Reports");
    }

    #[test]
    fn sanitize_rewrites_dot_names_and_blank() {
        assert_eq!(sanitize_name("."), "_");
        assert_eq!(sanitize_name(".."), "_");
        assert_eq!(sanitize_name("   "), "_");
        assert_eq!(sanitize_name(""), "_");
        assert_eq!(sanitize_name("../../etc"), ".._.._etc");
    }

    #[test]
    fn sanitize_strips_folder_icon_and_truncates() {
        assert_eq!(sanitize_name("📁 Photos"), "Photos");
        let long = "x".repeat(400);
        assert_eq!(sanitize_name(&long).chars().count(), MAX_NAME_CHARS);
        assert_eq!(sanitize_name("ü".repeat(200).as_str()).chars().count(), MAX_NAME_CHARS);
    }

    #[test]
    fn sanitize_is_deterministic() {
        let name = "📁 ../weird\u{0007}name";
        assert_eq!(sanitize_name(name), sanitize_name(name));
    }

    #[test]
    fn assert_within_root_rejects_escape() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::new(dir.path().join("store")).unwrap();
        let inside = manager
            .assert_within_root(&manager.root().join("a/b/c.txt"))
            .unwrap();
        assert!(inside.starts_with(manager.root()));

        let err = manager
            .assert_within_root(&manager.root().join("../outside"))
            .unwrap_err();
        assert!(matches!(err, StorageError::Security));
        assert_eq!(err.to_string(), "access denied");

        assert!(matches!(
            manager.assert_within_root(dir.path()),
            Err(StorageError::Security)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn assert_within_root_rejects_symlink_escape() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        let manager = StorageManager::new(dir.path().join("store")).unwrap();
        std::os::unix::fs::symlink(&outside, manager.root().join("link")).unwrap();

        assert!(matches!(
            manager.assert_within_root(&manager.root().join("link/file.txt")),
            Err(StorageError::Security)
        ));
    }

    #[tokio::test]
    async fn root_record_maps_to_storage_root() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::new(dir.path()).unwrap();
        let store = make_store().await;
        let root = store.ensure_root().await.unwrap();

        let path = manager.resolve_folder_path(&store, root.id).await.unwrap();
        assert_eq!(path, manager.root());
    }

    #[tokio::test]
    async fn resolves_nested_folders_child_to_root() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::new(dir.path()).unwrap();
        let store = make_store().await;
        let root = store.ensure_root().await.unwrap();
        let docs = store.insert_folder("📁 Docs", root.id).await.unwrap();
        let year = store.insert_folder("2024/Q1", docs.id).await.unwrap();

        let path = manager.resolve_folder_path(&store, year.id).await.unwrap();
        assert_eq!(path, manager.root().join("Docs").join("2024_Q1"));
    }

    #[tokio::test]
    async fn crafted_names_never_escape_root() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::new(dir.path().join("store")).unwrap();
        let store = make_store().await;
        let root = store.ensure_root().await.unwrap();
        let mut parent = root.id;
        for name in ["..", "../..", "..\\..", "/etc", "\u{0000}..", " .. "] {
            let folder = store.insert_folder(name, parent).await.unwrap();
            let path = manager.resolve_folder_path(&store, folder.id).await.unwrap();
            assert!(path.starts_with(manager.root()), "{name:?} -> {path:?}");
            let file = manager.file_path(&path, "../../passwd").unwrap();
            assert!(file.starts_with(manager.root()));
            parent = folder.id;
        }
    }

    #[tokio::test]
    async fn missing_folder_is_reported() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::new(dir.path()).unwrap();
        let store = make_store().await;
        assert!(matches!(
            manager.resolve_folder_path(&store, 999).await,
            Err(StorageError::FolderNotFound(999))
        ));
    }

    #[tokio::test]
    async fn remove_tree_deletes_files_then_directories() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::new(dir.path()).unwrap();
        let target = manager.root().join("Docs");
        std::fs::create_dir_all(target.join("a/b")).unwrap();
        std::fs::write(target.join("a/b/x.txt"), b"x").unwrap();
        std::fs::write(target.join("y.txt"), b"y").unwrap();

        manager.remove_tree(&target).await.unwrap();
        assert!(!target.exists());
        assert!(manager.root().exists());
        // already gone is fine
        manager.remove_tree(&target).await.unwrap();
    }
}
