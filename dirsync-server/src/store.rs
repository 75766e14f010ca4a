use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const ROOT_FOLDER_NAME: &str = "root";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("row not found after write")]
    MissingRow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub created: i64,
    pub modified: i64,
}

impl FolderRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub folder_id: i64,
    pub name: String,
    pub size: i64,
    pub hash: String,
    pub created: i64,
    pub modified: i64,
}

#[derive(Debug, Clone)]
pub struct FileInput {
    pub folder_id: i64,
    pub name: String,
    pub size: i64,
    pub hash: String,
    pub modified: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChildCounts {
    pub folders: i64,
    pub files: i64,
}

impl ChildCounts {
    pub fn is_empty(&self) -> bool {
        self.folders == 0 && self.files == 0
    }
}

/// Folder hierarchy and file metadata.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

const FOLDER_COLUMNS: &str = "id, name, parent_id, created, modified";
const FILE_COLUMNS: &str = "id, folder_id, name, size, hash, created, modified";

impl MetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        self.ensure_root().await?;
        Ok(())
    }

    pub async fn ensure_root(&self) -> Result<FolderRecord, StoreError> {
        if let Some(root) = self.root_folder().await? {
            return Ok(root);
        }
        let now = now_unix();
        sqlx::query(
            "INSERT INTO folders (name, parent_id, created, modified) VALUES (?1, NULL, ?2, ?2)",
        )
        .bind(ROOT_FOLDER_NAME)
        .bind(now)
        .execute(&self.pool)
        .await?;
        tracing::info!("created root folder record");
        self.root_folder().await?.ok_or(StoreError::MissingRow)
    }

    pub async fn root_folder(&self) -> Result<Option<FolderRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE parent_id IS NULL"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    pub async fn get_folder(&self, id: i64) -> Result<Option<FolderRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    pub async fn find_child_folder(
        &self,
        parent_id: i64,
        name: &str,
    ) -> Result<Option<FolderRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE parent_id = ?1 AND name = ?2"
        ))
        .bind(parent_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    pub async fn list_child_folders(&self, parent_id: i64) -> Result<Vec<FolderRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE parent_id = ?1 ORDER BY id ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(folder_from_row).collect()
    }

    pub async fn insert_folder(
        &self,
        name: &str,
        parent_id: i64,
    ) -> Result<FolderRecord, StoreError> {
        let now = now_unix();
        let result = sqlx::query(
            "INSERT INTO folders (name, parent_id, created, modified) VALUES (?1, ?2, ?3, ?3)",
        )
        .bind(name)
        .bind(parent_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_folder(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn list_folders(&self) -> Result<Vec<FolderRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders ORDER BY name COLLATE NOCASE ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(folder_from_row).collect()
    }

    pub async fn count_children(&self, folder_id: i64) -> Result<ChildCounts, StoreError> {
        let folders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folders WHERE parent_id = ?1")
            .bind(folder_id)
            .fetch_one(&self.pool)
            .await?;
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE folder_id = ?1")
            .bind(folder_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(ChildCounts { folders, files })
    }

    /// Deletes a folder row; descendant folders and files go with it.
    pub async fn delete_folder(&self, id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM folders WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_file(&self, id: i64) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn find_file(
        &self,
        folder_id: i64,
        name: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE folder_id = ?1 AND name = ?2"
        ))
        .bind(folder_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn upsert_file(&self, file: &FileInput) -> Result<FileRecord, StoreError> {
        let now = now_unix();
        sqlx::query(
            "
            INSERT INTO files (folder_id, name, size, hash, created, modified)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(folder_id, name) DO UPDATE SET
                size = excluded.size,
                hash = excluded.hash,
                modified = excluded.modified;
            ",
        )
        .bind(file.folder_id)
        .bind(&file.name)
        .bind(file.size)
        .bind(&file.hash)
        .bind(now)
        .bind(file.modified.unwrap_or(now))
        .execute(&self.pool)
        .await?;

        self.find_file(file.folder_id, &file.name)
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn list_files(&self, folder_id: i64) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE folder_id = ?1 ORDER BY name COLLATE NOCASE ASC"
        ))
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn delete_file(&self, id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_file_by_name(&self, folder_id: i64, name: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM files WHERE folder_id = ?1 AND name = ?2")
            .bind(folder_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn folder_from_row(row: &SqliteRow) -> Result<FolderRecord, StoreError> {
    Ok(FolderRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        created: row.try_get("created")?,
        modified: row.try_get("modified")?,
    })
}

fn file_from_row(row: &SqliteRow) -> Result<FileRecord, StoreError> {
    Ok(FileRecord {
        id: row.try_get("id")?,
        folder_id: row.try_get("folder_id")?,
        name: row.try_get("name")?,
        size: row.try_get("size")?,
        hash: row.try_get("hash")?,
        created: row.try_get("created")?,
        modified: row.try_get("modified")?,
    })
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
