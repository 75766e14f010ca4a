use std::io;

use dirsync_core::protocol::{FolderNotEmpty, Response};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::storage::StorageError;
use crate::store::{ChildCounts, StoreError};

pub mod display;
pub mod files;
pub mod folders;
pub mod login;

pub type HandlerResult = Result<Response, HandlerError>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid request payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Folder is not empty: {} subfolders, {} files", .0.folders, .0.files)]
    NotEmpty(ChildCounts),
    #[error("Access denied: invalid username or password")]
    Unauthorized,
    #[error("Storage inconsistency: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Storage(StorageError),
    #[error("Database error: {0}")]
    Store(#[from] StoreError),
    #[error("Storage error: {0}")]
    Io(#[from] io::Error),
}

impl From<StorageError> for HandlerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FolderNotFound(id) => HandlerError::NotFound(format!("Folder not found: {id}")),
            StorageError::Store(err) => HandlerError::Store(err),
            other => HandlerError::Storage(other),
        }
    }
}

impl HandlerError {
    pub fn into_response(self) -> Response {
        match self {
            HandlerError::NotEmpty(counts) => {
                let message = self.to_string();
                let data = serde_json::to_value(FolderNotEmpty {
                    child_folders: counts.folders,
                    child_files: counts.files,
                })
                .unwrap_or(Value::Null);
                Response::error_with_data(message, data)
            }
            other => Response::error(other.to_string()),
        }
    }

    /// Whether the failure points at the server rather than at the request.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            HandlerError::Store(_)
                | HandlerError::Io(_)
                | HandlerError::Inconsistent(_)
                | HandlerError::Storage(_)
        )
    }
}

pub(crate) fn parse_payload<T: DeserializeOwned>(data: Value) -> Result<T, HandlerError> {
    serde_json::from_value(data).map_err(|err| HandlerError::InvalidPayload(err.to_string()))
}
