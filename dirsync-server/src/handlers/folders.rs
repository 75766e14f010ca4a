use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use dirsync_core::protocol::{
    CreateFolderData, CreatedFolder, DeleteFolderData, FolderNode, FolderTreeData, Response,
};
use serde_json::{Value, json};

use super::display::{FOLDER_ICON, format_timestamp};
use super::{HandlerError, HandlerFuture, HandlerResult, parse_payload};
use crate::context::ServerContext;
use crate::storage::sanitize_name;
use crate::store::FolderRecord;

pub fn create_route(ctx: Arc<ServerContext>, data: Value) -> HandlerFuture {
    Box::pin(async move { create_folder(&ctx, data).await })
}

pub fn delete_route(ctx: Arc<ServerContext>, data: Value) -> HandlerFuture {
    Box::pin(async move { delete_folder(&ctx, data).await })
}

pub fn tree_route(ctx: Arc<ServerContext>, data: Value) -> HandlerFuture {
    Box::pin(async move { folder_tree(&ctx, data).await })
}

pub async fn create_folder(ctx: &ServerContext, data: Value) -> HandlerResult {
    let data: CreateFolderData = parse_payload(data)?;
    let name = data.folder_name.trim();
    if name.is_empty() {
        return Err(HandlerError::Validation("Folder name cannot be empty".into()));
    }

    let parent = match data.parent_folder_id {
        Some(id) => ctx
            .store
            .get_folder(id)
            .await?
            .ok_or_else(|| HandlerError::NotFound(format!("Parent folder not found: {id}")))?,
        None => ctx.store.ensure_root().await?,
    };
    if ctx.store.find_child_folder(parent.id, name).await?.is_some() {
        return Err(HandlerError::Validation(format!(
            "Folder '{name}' already exists in this location"
        )));
    }
    // Siblings must not share a directory on disk either.
    let disk_name = sanitize_name(name);
    if let Some(clash) = ctx
        .store
        .list_child_folders(parent.id)
        .await?
        .into_iter()
        .find(|sibling| sanitize_name(&sibling.name) == disk_name)
    {
        return Err(HandlerError::Validation(format!(
            "Folder '{name}' conflicts with existing folder '{}'",
            clash.name
        )));
    }

    let folder = ctx.store.insert_folder(name, parent.id).await?;
    if let Err(err) = materialize_folder(ctx, &folder).await {
        // Keep DB and disk in step: a folder row without a directory is dropped again.
        if let Err(rollback) = ctx.store.delete_folder(folder.id).await {
            tracing::error!(folder_id = folder.id, error = %rollback, "failed to roll back folder row");
        }
        return Err(err);
    }

    tracing::info!(folder_id = folder.id, parent_id = parent.id, name = %folder.name, "folder created");
    let created = CreatedFolder {
        folder_id: folder.id,
        folder_name: folder.name,
    };
    Ok(Response::success(
        "Folder created",
        serde_json::to_value(created).unwrap_or(Value::Null),
    ))
}

async fn materialize_folder(ctx: &ServerContext, folder: &FolderRecord) -> Result<(), HandlerError> {
    let path = ctx.storage.resolve_folder_path(&ctx.store, folder.id).await?;
    tokio::fs::create_dir_all(&path).await?;
    Ok(())
}

pub async fn delete_folder(ctx: &ServerContext, data: Value) -> HandlerResult {
    let data: DeleteFolderData = parse_payload(data)?;
    let folder = ctx
        .store
        .get_folder(data.folder_id)
        .await?
        .ok_or_else(|| HandlerError::NotFound(format!("Folder not found: {}", data.folder_id)))?;
    if folder.is_root() {
        return Err(HandlerError::Validation("Cannot delete the root folder".into()));
    }

    let path = ctx.storage.resolve_folder_path(&ctx.store, folder.id).await?;
    if data.recursive {
        ctx.storage.remove_tree(&path).await?;
    } else {
        let counts = ctx.store.count_children(folder.id).await?;
        if !counts.is_empty() {
            return Err(HandlerError::NotEmpty(counts));
        }
        match tokio::fs::remove_dir(&path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
    }

    if ctx.store.delete_folder(folder.id).await? == 0 {
        return Err(HandlerError::Inconsistent(format!(
            "folder {} removed from disk but its record was already gone",
            folder.id
        )));
    }
    tracing::info!(folder_id = folder.id, recursive = data.recursive, "folder deleted");
    Ok(Response::success(
        "Folder deleted",
        json!({ "folderId": folder.id }),
    ))
}

pub async fn folder_tree(ctx: &ServerContext, data: Value) -> HandlerResult {
    let data: FolderTreeData = if data.is_null() {
        FolderTreeData::default()
    } else {
        parse_payload(data)?
    };
    let folders = ctx.store.list_folders().await?;
    let mut children: HashMap<Option<i64>, Vec<&FolderRecord>> = HashMap::new();
    for folder in &folders {
        children.entry(folder.parent_id).or_default().push(folder);
    }

    let nodes: Vec<FolderNode> = match data.parent_id {
        None => children
            .get(&None)
            .map(|roots| roots.iter().map(|f| build_node(f, &children)).collect())
            .unwrap_or_default(),
        Some(parent_id) => {
            if !folders.iter().any(|f| f.id == parent_id) {
                return Err(HandlerError::NotFound(format!("Folder not found: {parent_id}")));
            }
            children
                .get(&Some(parent_id))
                .map(|list| list.iter().map(|f| build_node(f, &children)).collect())
                .unwrap_or_default()
        }
    };
    Ok(Response::success(
        "Folder tree loaded",
        serde_json::to_value(nodes).unwrap_or(Value::Null),
    ))
}

fn build_node(folder: &FolderRecord, children: &HashMap<Option<i64>, Vec<&FolderRecord>>) -> FolderNode {
    FolderNode {
        id: folder.id,
        name: folder.name.clone(),
        icon: FOLDER_ICON.to_string(),
        parent_id: folder.parent_id,
        created: format_timestamp(folder.created),
        modified: format_timestamp(folder.modified),
        children: children
            .get(&Some(folder.id))
            .map(|list| list.iter().map(|child| build_node(child, children)).collect())
            .unwrap_or_default(),
    }
}
