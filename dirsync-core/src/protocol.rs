use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message contains an embedded newline")]
    EmbeddedNewline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Login,
    FolderTree,
    GetFileList,
    CreateFolder,
    UploadFile,
    Download,
    DeleteFile,
    DeleteFolder,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::Login,
        Action::FolderTree,
        Action::GetFileList,
        Action::CreateFolder,
        Action::UploadFile,
        Action::Download,
        Action::DeleteFile,
        Action::DeleteFolder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Login => "LOGIN",
            Action::FolderTree => "FOLDER_TREE",
            Action::GetFileList => "GET_FILE_LIST",
            Action::CreateFolder => "CREATE_FOLDER",
            Action::UploadFile => "UPLOAD_FILE",
            Action::Download => "DOWNLOAD",
            Action::DeleteFile => "DELETE_FILE",
            Action::DeleteFolder => "DELETE_FOLDER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn new<T: Serialize>(action: Action, data: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            action: action.as_str().to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(T::deserialize(&self.data)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::error_with_data(message, Value::Null)
    }

    pub fn error_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(T::deserialize(&self.data)?)
    }
}

/// Serializes a message as a single protocol line, without the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(message)?;
    // serde_json escapes control characters inside strings, so this only trips on bugs.
    if line.contains('\n') {
        return Err(ProtocolError::EmbeddedNewline);
    }
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginData {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderTreeData {
    #[serde(default)]
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListData {
    pub folder_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderData {
    pub folder_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_folder_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileData {
    pub file_name: String,
    pub file_content: String,
    pub folder_id: i64,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<i64>,
}

impl FileSelector {
    pub fn by_id(file_id: i64) -> Self {
        Self {
            file_id: Some(file_id),
            ..Self::default()
        }
    }

    pub fn by_name(folder_id: i64, file_name: impl Into<String>) -> Self {
        Self {
            file_id: None,
            file_name: Some(file_name.into()),
            folder_id: Some(folder_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFolderData {
    pub folder_id: i64,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub id: i64,
    pub name: String,
    pub icon: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub created: String,
    pub modified: String,
    #[serde(default)]
    pub children: Vec<FolderNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: i64,
    pub name: String,
    pub icon: String,
    pub size: u64,
    pub size_display: String,
    pub hash: String,
    pub created: String,
    pub modified: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedFolder {
    pub folder_id: i64,
    pub folder_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub file_id: i64,
    pub file_size: u64,
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedFile {
    pub file_id: i64,
    pub file_name: String,
    pub file_content: String,
    pub file_size: u64,
    pub file_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNotEmpty {
    pub child_folders: i64,
    pub child_files: i64,
}
