use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dirsync_core::protocol::{
    DownloadedFile, FileEntry, FileListData, FileSelector, Response, UploadFileData, UploadedFile,
    content_digest,
};
use serde_json::{Value, json};

use super::display::{file_icon, format_size, format_timestamp};
use super::{HandlerError, HandlerFuture, HandlerResult, parse_payload};
use crate::context::ServerContext;
use crate::storage::{remove_file_if_exists, sanitize_name};
use crate::store::{FileInput, FileRecord};

const COMPENSATION_ATTEMPTS: u32 = 5;
const COMPENSATION_BASE_DELAY: Duration = Duration::from_millis(50);

pub fn upload_route(ctx: Arc<ServerContext>, data: Value) -> HandlerFuture {
    Box::pin(async move { upload_file(&ctx, data).await })
}

pub fn download_route(ctx: Arc<ServerContext>, data: Value) -> HandlerFuture {
    Box::pin(async move { download_file(&ctx, data).await })
}

pub fn delete_route(ctx: Arc<ServerContext>, data: Value) -> HandlerFuture {
    Box::pin(async move { delete_file(&ctx, data).await })
}

pub fn list_route(ctx: Arc<ServerContext>, data: Value) -> HandlerFuture {
    Box::pin(async move { file_list(&ctx, data).await })
}

pub async fn upload_file(ctx: &ServerContext, data: Value) -> HandlerResult {
    let data: UploadFileData = parse_payload(data)?;
    if data.file_name.trim().is_empty() {
        return Err(HandlerError::Validation("File name cannot be empty".into()));
    }
    if ctx.store.get_folder(data.folder_id).await?.is_none() {
        return Err(HandlerError::NotFound(format!(
            "Folder not found: {}",
            data.folder_id
        )));
    }

    let limit = ctx.limits.max_upload_bytes;
    // Reject obviously oversized payloads before decoding them.
    let estimated = (data.file_content.len() as u64 / 4).saturating_mul(3);
    if estimated > limit.saturating_add(3) {
        return Err(too_large(estimated, limit));
    }
    let bytes = BASE64
        .decode(data.file_content.as_bytes())
        .map_err(|err| HandlerError::Validation(format!("Invalid file content: {err}")))?;
    let size = bytes.len() as u64;
    if size > limit {
        return Err(too_large(size, limit));
    }
    if data.file_size != 0 && data.file_size != size {
        tracing::warn!(
            name = %data.file_name,
            declared = data.file_size,
            actual = size,
            "declared upload size differs from content"
        );
    }

    // Re-uploading the same name overwrites; a different name must not land on its bytes.
    let disk_name = sanitize_name(&data.file_name);
    if let Some(clash) = ctx
        .store
        .list_files(data.folder_id)
        .await?
        .into_iter()
        .find(|file| file.name != data.file_name && sanitize_name(&file.name) == disk_name)
    {
        return Err(HandlerError::Validation(format!(
            "File '{}' conflicts with existing file '{}'",
            data.file_name, clash.name
        )));
    }

    let folder_path = ctx
        .storage
        .resolve_folder_path(&ctx.store, data.folder_id)
        .await?;
    let file_path = ctx.storage.file_path(&folder_path, &data.file_name)?;
    tokio::fs::create_dir_all(&folder_path).await?;
    tokio::fs::write(&file_path, &bytes).await?;

    // The client-declared hash is not consulted; the stored digest is always ours.
    let hash = content_digest(&bytes);
    let input = FileInput {
        folder_id: data.folder_id,
        name: data.file_name.clone(),
        size: size as i64,
        hash: hash.clone(),
        modified: (data.last_modified > 0).then_some(data.last_modified / 1000),
    };
    let record = match ctx.store.upsert_file(&input).await {
        Ok(record) => record,
        Err(err) => {
            tracing::error!(path = %file_path.display(), error = %err, "metadata write failed after file write");
            if let Err(cleanup) = remove_with_retry(&file_path).await {
                tracing::error!(path = %file_path.display(), error = %cleanup, "compensating delete failed");
                return Err(HandlerError::Inconsistent(format!(
                    "file '{}' stored without metadata",
                    data.file_name
                )));
            }
            return Err(err.into());
        }
    };

    tracing::info!(file_id = record.id, folder_id = data.folder_id, size, "file uploaded");
    let uploaded = UploadedFile {
        file_id: record.id,
        file_size: size,
        file_hash: hash,
    };
    Ok(Response::success(
        "File uploaded",
        serde_json::to_value(uploaded).unwrap_or(Value::Null),
    ))
}

pub async fn download_file(ctx: &ServerContext, data: Value) -> HandlerResult {
    let selector: FileSelector = parse_payload(data)?;
    let record = find_record(ctx, &selector).await?;
    let folder_path = ctx
        .storage
        .resolve_folder_path(&ctx.store, record.folder_id)
        .await?;
    let file_path = ctx.storage.file_path(&folder_path, &record.name)?;

    let metadata = match tokio::fs::metadata(&file_path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(HandlerError::Inconsistent(format!(
                "content of '{}' is missing on disk",
                record.name
            )));
        }
        Err(err) => return Err(err.into()),
    };
    let limit = ctx.limits.max_download_bytes;
    if metadata.len() > limit {
        return Err(too_large(metadata.len(), limit));
    }
    let bytes = tokio::fs::read(&file_path).await?;

    let downloaded = DownloadedFile {
        file_id: record.id,
        file_name: record.name,
        file_size: bytes.len() as u64,
        file_hash: content_digest(&bytes),
        file_content: BASE64.encode(&bytes),
    };
    Ok(Response::success(
        "File downloaded",
        serde_json::to_value(downloaded).unwrap_or(Value::Null),
    ))
}

pub async fn delete_file(ctx: &ServerContext, data: Value) -> HandlerResult {
    let selector: FileSelector = parse_payload(data)?;
    let (folder_id, name) = match selector.file_id {
        Some(_) => {
            let record = find_record(ctx, &selector).await?;
            (record.folder_id, record.name)
        }
        None => selector_by_name(&selector)?,
    };

    let folder_path = ctx.storage.resolve_folder_path(&ctx.store, folder_id).await?;
    let file_path = ctx.storage.file_path(&folder_path, &name)?;
    remove_file_if_exists(&file_path)?;

    let affected = match selector.file_id {
        Some(id) => ctx.store.delete_file(id).await?,
        None => ctx.store.delete_file_by_name(folder_id, &name).await?,
    };
    if affected == 0 {
        // The disk copy is already gone at this point; nothing restores it.
        return Err(HandlerError::NotFound(format!(
            "File record not found: {name}"
        )));
    }
    tracing::info!(folder_id, name = %name, "file deleted");
    Ok(Response::success(
        "File deleted",
        json!({ "folderId": folder_id, "fileName": name }),
    ))
}

pub async fn file_list(ctx: &ServerContext, data: Value) -> HandlerResult {
    let data: FileListData = parse_payload(data)?;
    if ctx.store.get_folder(data.folder_id).await?.is_none() {
        return Err(HandlerError::NotFound(format!(
            "Folder not found: {}",
            data.folder_id
        )));
    }
    let entries: Vec<FileEntry> = ctx
        .store
        .list_files(data.folder_id)
        .await?
        .into_iter()
        .map(file_entry)
        .collect();
    Ok(Response::success(
        format!("{} files", entries.len()),
        serde_json::to_value(entries).unwrap_or(Value::Null),
    ))
}

fn file_entry(record: FileRecord) -> FileEntry {
    let size = record.size.max(0) as u64;
    FileEntry {
        id: record.id,
        icon: file_icon(&record.name).to_string(),
        size,
        size_display: format_size(size),
        hash: record.hash,
        created: format_timestamp(record.created),
        modified: format_timestamp(record.modified),
        name: record.name,
    }
}

async fn find_record(ctx: &ServerContext, selector: &FileSelector) -> Result<FileRecord, HandlerError> {
    if let Some(id) = selector.file_id {
        return ctx
            .store
            .get_file(id)
            .await?
            .ok_or_else(|| HandlerError::NotFound(format!("File not found: {id}")));
    }
    let (folder_id, name) = selector_by_name(selector)?;
    ctx.store
        .find_file(folder_id, &name)
        .await?
        .ok_or_else(|| HandlerError::NotFound(format!("File not found: {name}")))
}

fn selector_by_name(selector: &FileSelector) -> Result<(i64, String), HandlerError> {
    match (selector.folder_id, selector.file_name.as_deref()) {
        (Some(folder_id), Some(name)) if !name.trim().is_empty() => Ok((folder_id, name.to_string())),
        _ => Err(HandlerError::InvalidPayload(
            "either fileId or folderId with fileName is required".into(),
        )),
    }
}

fn too_large(size: u64, limit: u64) -> HandlerError {
    HandlerError::Validation(format!(
        "File too large: {size} bytes exceeds limit of {limit}"
    ))
}

/// Deletes `path` until it is gone; a missing file counts as done.
async fn remove_with_retry(path: &Path) -> io::Result<()> {
    let mut attempt = 0;
    loop {
        match remove_file_if_exists(path) {
            Ok(()) => return Ok(()),
            Err(err) if attempt + 1 >= COMPENSATION_ATTEMPTS => return Err(err),
            Err(err) => {
                tracing::warn!(path = %path.display(), attempt, error = %err, "retrying compensating delete");
                tokio::time::sleep(COMPENSATION_BASE_DELAY * 2u32.pow(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::handlers::test_support::{make_context, make_context_with_limits};
    use tempfile::tempdir;

    async fn upload(ctx: &ServerContext, folder_id: i64, name: &str, bytes: &[u8]) -> HandlerResult {
        upload_file(
            ctx,
            json!({
                "fileName": name,
                "fileContent": BASE64.encode(bytes),
                "folderId": folder_id,
                "fileSize": bytes.len(),
                "lastModified": 1_700_000_000_000i64,
            }),
        )
        .await
    }

    #[tokio::test]
    async fn upload_hello_stores_five_bytes_with_sha256() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();

        let uploaded: UploadedFile = upload(&ctx, root.id, "hello.txt", b"hello")
            .await
            .unwrap()
            .payload()
            .unwrap();
        assert_eq!(uploaded.file_size, 5);
        assert_eq!(
            uploaded.file_hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            std::fs::read(ctx.storage.root().join("hello.txt")).unwrap(),
            b"hello"
        );
        let record = ctx.store.find_file(root.id, "hello.txt").await.unwrap().unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(record.hash, uploaded.file_hash);
        assert_eq!(record.modified, 1_700_000_000);
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();
        let bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

        let uploaded: UploadedFile = upload(&ctx, root.id, "blob.bin", &bytes)
            .await
            .unwrap()
            .payload()
            .unwrap();
        let downloaded: DownloadedFile = download_file(
            &ctx,
            json!({"fileName": "blob.bin", "folderId": root.id}),
        )
        .await
        .unwrap()
        .payload()
        .unwrap();

        assert_eq!(BASE64.decode(downloaded.file_content).unwrap(), bytes);
        assert_eq!(downloaded.file_hash, uploaded.file_hash);

        let by_id: DownloadedFile = download_file(&ctx, json!({"fileId": uploaded.file_id}))
            .await
            .unwrap()
            .payload()
            .unwrap();
        assert_eq!(by_id.file_name, "blob.bin");
    }

    #[tokio::test]
    async fn upload_overwrites_existing_file() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();
        let first: UploadedFile = upload(&ctx, root.id, "a.txt", b"one").await.unwrap().payload().unwrap();
        let second: UploadedFile = upload(&ctx, root.id, "a.txt", b"second").await.unwrap().payload().unwrap();

        assert_eq!(first.file_id, second.file_id);
        assert_eq!(std::fs::read(ctx.storage.root().join("a.txt")).unwrap(), b"second");
        assert_eq!(ctx.store.list_files(root.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upload_rejects_missing_folder_and_bad_content() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let err = upload(&ctx, 999, "a.txt", b"x").await.unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(_)));

        let root = ctx.store.ensure_root().await.unwrap();
        let err = upload_file(
            &ctx,
            json!({"fileName": "a.txt", "fileContent": "***", "folderId": root.id}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
    }

    #[tokio::test]
    async fn size_ceilings_apply_to_upload_and_download() {
        let dir = tempdir().unwrap();
        let ctx = make_context_with_limits(
            &dir,
            Limits {
                max_upload_bytes: 16,
                max_download_bytes: 8,
            },
        )
        .await;
        let root = ctx.store.ensure_root().await.unwrap();

        let err = upload(&ctx, root.id, "big.bin", &[1u8; 17]).await.unwrap_err();
        assert!(err.to_string().contains("too large"));

        upload(&ctx, root.id, "mid.bin", &[1u8; 12]).await.unwrap();
        let err = download_file(&ctx, json!({"fileName": "mid.bin", "folderId": root.id}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn traversal_file_names_stay_inside_root() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();
        upload(&ctx, root.id, "../../escape.txt", b"x").await.unwrap();

        assert!(!dir.path().join("escape.txt").exists());
        assert!(ctx.storage.root().join(".._.._escape.txt").exists());
    }

    #[tokio::test]
    async fn delete_file_removes_disk_and_row() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();
        let uploaded: UploadedFile = upload(&ctx, root.id, "a.txt", b"a").await.unwrap().payload().unwrap();

        delete_file(&ctx, json!({"fileId": uploaded.file_id})).await.unwrap();
        assert!(!ctx.storage.root().join("a.txt").exists());
        assert!(ctx.store.get_file(uploaded.file_id).await.unwrap().is_none());

        let err = delete_file(&ctx, json!({"fileId": uploaded.file_id}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_by_name_without_row_still_removes_disk_file() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();
        std::fs::write(ctx.storage.root().join("stray.txt"), b"s").unwrap();

        let err = delete_file(&ctx, json!({"folderId": root.id, "fileName": "stray.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(_)));
        assert!(!ctx.storage.root().join("stray.txt").exists());
    }

    #[tokio::test]
    async fn file_list_renders_display_fields() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();
        upload(&ctx, root.id, "b.pdf", &[0u8; 2048]).await.unwrap();
        upload(&ctx, root.id, "a.txt", b"hello").await.unwrap();

        let entries: Vec<FileEntry> = file_list(&ctx, json!({"folderId": root.id}))
            .await
            .unwrap()
            .payload()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size_display, "5 B");
        assert_eq!(entries[1].size_display, "2.0 KB");
        assert_eq!(entries[1].icon, "📕");
        assert!(!entries[0].modified.is_empty());
    }

    #[tokio::test]
    async fn names_sharing_a_file_on_disk_are_rejected() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();
        let first: UploadedFile = upload(&ctx, root.id, "x?.txt", b"first")
            .await
            .unwrap()
            .payload()
            .unwrap();

        let err = upload(&ctx, root.id, "x_.txt", b"SECOND").await.unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
        assert!(ctx.store.find_file(root.id, "x_.txt").await.unwrap().is_none());

        let downloaded: DownloadedFile = download_file(&ctx, json!({"fileId": first.file_id}))
            .await
            .unwrap()
            .payload()
            .unwrap();
        assert_eq!(BASE64.decode(downloaded.file_content).unwrap(), b"first");
        assert_eq!(downloaded.file_hash, first.file_hash);

        // the original name still overwrites in place
        upload(&ctx, root.id, "x?.txt", b"third").await.unwrap();
        assert_eq!(std::fs::read(ctx.storage.root().join("x_.txt")).unwrap(), b"third");
    }

    #[tokio::test]
    async fn written_file_is_removed_when_metadata_write_fails() {
        let dir = tempdir().unwrap();
        let ctx = make_context(&dir).await;
        let root = ctx.store.ensure_root().await.unwrap();
        upload(&ctx, root.id, "kept.txt", b"kept").await.unwrap();
        // file listing still works, the row insert does not
        sqlx::query(
            "CREATE TRIGGER refuse_file_rows BEFORE INSERT ON files \
             BEGIN SELECT RAISE(ABORT, 'metadata unavailable'); END",
        )
        .execute(ctx.store.pool())
        .await
        .unwrap();

        let err = upload(&ctx, root.id, "orphan.txt", b"orphan").await.unwrap_err();
        assert!(matches!(err, HandlerError::Store(_)));
        assert!(!ctx.storage.root().join("orphan.txt").exists());
        assert!(ctx.store.find_file(root.id, "orphan.txt").await.unwrap().is_none());
        assert_eq!(std::fs::read(ctx.storage.root().join("kept.txt")).unwrap(), b"kept");
    }

    #[tokio::test]
    async fn remove_with_retry_treats_missing_as_done() {
        let dir = tempdir().unwrap();
        remove_with_retry(&dir.path().join("never-existed")).await.unwrap();
    }
}
