//! SFTP data types

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncRead;

use super::error::SftpError;

/// File entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    /// File type
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Last modified time (Unix timestamp)
    pub modified: i64,
    /// File permissions (octal string, e.g., "755")
    pub permissions: String,
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// The action a request performs against the remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    List,
    Get,
    Put,
    Delete,
    Mkdir,
    Rmdir,
    Open,
    Close,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::List => "list",
            OperationKind::Get => "get",
            OperationKind::Put => "put",
            OperationKind::Delete => "delete",
            OperationKind::Mkdir => "mkdir",
            OperationKind::Rmdir => "rmdir",
            OperationKind::Open => "open",
            OperationKind::Close => "close",
        }
    }

    /// Status label shown while the operation runs.
    pub fn progress_label(&self) -> &'static str {
        match self {
            OperationKind::List => "listing",
            OperationKind::Get => "downloading",
            OperationKind::Put => "uploading",
            OperationKind::Delete => "deleting",
            OperationKind::Mkdir => "creating directory",
            OperationKind::Rmdir => "removing directory",
            OperationKind::Open => "opening",
            OperationKind::Close => "closing",
        }
    }

    /// Whether a plain string payload may stand in for the target path.
    pub fn accepts_path_payload(&self) -> bool {
        matches!(
            self,
            OperationKind::List
                | OperationKind::Get
                | OperationKind::Delete
                | OperationKind::Mkdir
                | OperationKind::Rmdir
        )
    }
}

impl FromStr for OperationKind {
    type Err = SftpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "list" => Ok(OperationKind::List),
            "get" => Ok(OperationKind::Get),
            "put" => Ok(OperationKind::Put),
            "delete" => Ok(OperationKind::Delete),
            "mkdir" => Ok(OperationKind::Mkdir),
            "rmdir" => Ok(OperationKind::Rmdir),
            "open" => Ok(OperationKind::Open),
            "close" => Ok(OperationKind::Close),
            _ => Err(SftpError::UnknownOperation(s.to_string())),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload.
///
/// `Text` doubles as a path override (list/get/delete/mkdir/rmdir) or as an
/// upload source (a local file path, or literal content).
#[derive(Default)]
pub enum Payload {
    #[default]
    None,
    Text(String),
    Bytes(Bytes),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    /// Legacy shape carrying both a file name and inline content
    Named { name: String, data: Bytes },
}

impl Payload {
    /// File name carried by the legacy shape, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Payload::Named { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    /// The payload as a path override, if it is a non-empty string.
    pub fn as_path(&self) -> Option<&str> {
        match self {
            Payload::Text(text) if !text.trim().is_empty() => Some(text.trim()),
            _ => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::None => f.write_str("None"),
            Payload::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            Payload::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream"),
            Payload::Named { name, data } => f
                .debug_struct("Named")
                .field("name", name)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Resolved upload source handed to the remote session.
pub enum UploadSource {
    Bytes(Bytes),
    LocalFile(PathBuf),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            UploadSource::LocalFile(path) => f.debug_tuple("LocalFile").field(path).finish(),
            UploadSource::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Upload tuning passed through to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOptions {
    /// Write requests kept in flight (scales the copy buffer)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Fail the upload when closing the remote handle fails
    #[serde(default = "default_true")]
    pub reject_on_error: bool,
}

fn default_concurrency() -> usize {
    constants::DEFAULT_PUT_CONCURRENCY
}

fn default_true() -> bool {
    true
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            concurrency: constants::DEFAULT_PUT_CONCURRENCY,
            reject_on_error: true,
        }
    }
}

/// Outcome of a verified upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub ok: bool,
    pub path: String,
    pub size: u64,
}

/// Result payload, discriminated by operation kind
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Listing(Vec<FileInfo>),
    Content { path: String, data: Bytes },
    Transfer(TransferOutcome),
    Deleted { path: String },
    DirectoryCreated { path: String },
    DirectoryRemoved { path: String },
    Opened { session_id: String },
    Closed,
}

impl OperationResult {
    /// Marker returned to the host for a successful delete.
    pub const DELETE_SUCCESS: &'static str = "success";

    /// Marker returned to the host for a closed session.
    pub const CLOSED: &'static str = "closed";

    /// Render the host-facing payload.
    pub fn to_payload(&self) -> Value {
        match self {
            OperationResult::Listing(entries) => {
                serde_json::to_value(entries).unwrap_or_default()
            }
            OperationResult::Content { path, data } => json!({
                "path": path,
                "size": data.len(),
                "data": base64::engine::general_purpose::STANDARD.encode(data),
            }),
            OperationResult::Transfer(outcome) => json!({
                "ok": outcome.ok,
                "path": outcome.path,
                "size": outcome.size,
            }),
            OperationResult::Deleted { .. } => Value::String(Self::DELETE_SUCCESS.to_string()),
            OperationResult::DirectoryCreated { path }
            | OperationResult::DirectoryRemoved { path } => json!({ "path": path }),
            OperationResult::Opened { session_id } => json!({ "session": session_id }),
            OperationResult::Closed => Value::String(Self::CLOSED.to_string()),
        }
    }
}

/// Constants for SFTP operations
pub mod constants {
    /// Default chunk size for file transfers (32 KB, one SFTP write request)
    pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

    /// Default number of write requests in flight during upload
    pub const DEFAULT_PUT_CONCURRENCY: usize = 64;

    /// Upper bound for the upload copy buffer (2 MB)
    pub const MAX_COPY_BUFFER: usize = 2 * 1024 * 1024;
}
