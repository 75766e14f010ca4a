use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::connection::{ConnectionError, ConnectionManager, ServerAddress};
use crate::protocol::{
    Action, CreateFolderData, CreatedFolder, DeleteFolderData, DownloadedFile, FileEntry,
    FileListData, FileSelector, FolderNode, FolderTreeData, LoginData, ProtocolError, Request,
    Response, UploadFileData, UploadedFile, content_digest, decode_line, encode_line,
};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server address is not configured")]
    NotConfigured,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Server(String),
    #[error("file error: {0}")]
    Io(#[from] io::Error),
    #[error("not a regular file: {0}")]
    NotAFile(String),
    #[error("file too large: {size} bytes exceeds limit of {limit}")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("invalid file content: {0}")]
    InvalidContent(#[from] base64::DecodeError),
    #[error("invalid file digest: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

/// Typed requests over a shared [`ConnectionManager`].
#[derive(Clone)]
pub struct ProtocolClient {
    connection: Arc<ConnectionManager>,
    address: Option<ServerAddress>,
    max_upload_bytes: u64,
}

impl ProtocolClient {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            address: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_address(mut self, address: ServerAddress) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: u64) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn address(&self) -> Option<&ServerAddress> {
        self.address.as_ref()
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        let address = self.address.as_ref().ok_or(ClientError::NotConfigured)?;
        self.connection.connect(address).await?;
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let data = LoginData {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.call(Action::Login, &data).await?;
        Ok(())
    }

    pub async fn upload(&self, file: &Path, folder_id: i64) -> Result<UploadedFile, ClientError> {
        let metadata = tokio::fs::metadata(file).await?;
        if !metadata.is_file() {
            return Err(ClientError::NotAFile(file.display().to_string()));
        }
        if metadata.len() > self.max_upload_bytes {
            return Err(ClientError::FileTooLarge {
                size: metadata.len(),
                limit: self.max_upload_bytes,
            });
        }
        let bytes = tokio::fs::read(file).await?;
        let file_size = bytes.len() as u64;
        if file_size > self.max_upload_bytes {
            return Err(ClientError::FileTooLarge {
                size: file_size,
                limit: self.max_upload_bytes,
            });
        }
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::NotAFile(file.display().to_string()))?;
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let data = UploadFileData {
            file_name,
            file_hash: Some(content_digest(&bytes)),
            file_content: BASE64.encode(&bytes),
            folder_id,
            file_size,
            last_modified,
        };
        tracing::debug!(path = %file.display(), folder_id, file_size, "uploading file");
        self.call_typed(Action::UploadFile, &data).await
    }

    pub async fn get_file_list(&self, folder_id: i64) -> Result<Vec<FileEntry>, ClientError> {
        self.call_typed(Action::GetFileList, &FileListData { folder_id })
            .await
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<i64>,
    ) -> Result<CreatedFolder, ClientError> {
        let data = CreateFolderData {
            folder_name: name.to_string(),
            parent_folder_id: parent_id,
        };
        self.call_typed(Action::CreateFolder, &data).await
    }

    pub async fn get_folder_tree(
        &self,
        parent_id: Option<i64>,
    ) -> Result<Vec<FolderNode>, ClientError> {
        self.call_typed(Action::FolderTree, &FolderTreeData { parent_id })
            .await
    }

    pub async fn download(&self, selector: &FileSelector) -> Result<DownloadedFile, ClientError> {
        self.call_typed(Action::Download, selector).await
    }

    /// Downloads into `target`, checking the content against the server digest.
    pub async fn download_to(
        &self,
        selector: &FileSelector,
        target: &Path,
    ) -> Result<DownloadedFile, ClientError> {
        let file = self.download(selector).await?;
        let bytes = BASE64.decode(file.file_content.as_bytes())?;
        let actual = content_digest(&bytes);
        if actual != file.file_hash {
            return Err(ClientError::DigestMismatch {
                expected: file.file_hash.clone(),
                actual,
            });
        }
        if let Some(parent) = target.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &bytes).await?;
        Ok(file)
    }

    pub async fn delete_file(&self, selector: &FileSelector) -> Result<(), ClientError> {
        self.call(Action::DeleteFile, selector).await?;
        Ok(())
    }

    pub async fn delete_folder(&self, folder_id: i64, recursive: bool) -> Result<(), ClientError> {
        let data = DeleteFolderData {
            folder_id,
            recursive,
        };
        self.call(Action::DeleteFolder, &data).await?;
        Ok(())
    }

    async fn call_typed<P: Serialize, T: DeserializeOwned>(
        &self,
        action: Action,
        data: &P,
    ) -> Result<T, ClientError> {
        let response = self.call(action, data).await?;
        Ok(response.payload()?)
    }

    async fn call<P: Serialize>(&self, action: Action, data: &P) -> Result<Response, ClientError> {
        self.connect().await?;
        let line = encode_line(&Request::new(action, data)?)?;
        let reply = self.connection.send_request_and_get_response(&line).await?;
        let response: Response = decode_line(&reply)?;
        if response.is_success() {
            Ok(response)
        } else {
            tracing::debug!(action = action.as_str(), message = %response.message, "server rejected request");
            Err(ClientError::Server(response.message))
        }
    }
}
