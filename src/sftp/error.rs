//! SFTP Error types

use thiserror::Error;

use crate::ssh::SshError;

/// Error class reported to the host alongside the failure status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport unreachable or authentication rejected
    Connect,
    /// Missing configuration identity or unusable request input
    Resolution,
    /// Remote call rejected (missing file, permission, ...)
    Operation,
    /// Upload acknowledged by the transport but the remote size differs
    Verification,
    /// Operation kind not recognized
    UnknownOperation,
}

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Resolution failed: {0}")]
    Resolution(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation failed: {0}")]
    Operation(String),

    #[error("Size mismatch for {path}: expected {expected} bytes, remote has {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation queue full for {key} ({capacity} pending)")]
    QueueFull { key: String, capacity: usize },

    #[error("Operation queue closed for {0}")]
    QueueClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SftpError {
    /// Map the error onto the reporting taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SftpError::ConnectFailed(_) => ErrorKind::Connect,
            SftpError::Resolution(_) => ErrorKind::Resolution,
            SftpError::SizeMismatch { .. } => ErrorKind::Verification,
            SftpError::UnknownOperation(_) => ErrorKind::UnknownOperation,
            SftpError::FileNotFound(_)
            | SftpError::PermissionDenied(_)
            | SftpError::Operation(_)
            | SftpError::QueueFull { .. }
            | SftpError::QueueClosed(_)
            | SftpError::Io(_) => ErrorKind::Operation,
        }
    }

    /// Whether a failed `mkdir` only means the directory is already there.
    ///
    /// SFTP v3 servers report this as a generic failure, so the message is
    /// the only signal available.
    pub fn is_already_exists(&self) -> bool {
        match self {
            SftpError::Io(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            SftpError::Operation(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("already exists") || msg.contains("file exists")
            }
            _ => false,
        }
    }

    /// Classify a raw protocol error message for `path`.
    pub fn from_remote(message: impl Into<String>, path: &str) -> Self {
        let message = message.into();
        if message.contains("No such file") || message.contains("not found") {
            SftpError::FileNotFound(path.to_string())
        } else if message.contains("Permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else {
            SftpError::Operation(message)
        }
    }
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        SftpError::ConnectFailed(err.to_string())
    }
}

impl serde::Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SftpError::ConnectFailed("refused".into()).kind(),
            ErrorKind::Connect
        );
        assert_eq!(
            SftpError::SizeMismatch {
                path: "a".into(),
                expected: 5,
                actual: 3
            }
            .kind(),
            ErrorKind::Verification
        );
        assert_eq!(
            SftpError::FileNotFound("missing.txt".into()).kind(),
            ErrorKind::Operation
        );
        assert_eq!(
            SftpError::UnknownOperation("copy".into()).kind(),
            ErrorKind::UnknownOperation
        );
    }

    #[test]
    fn test_already_exists_detection() {
        assert!(SftpError::Operation("Failure: File exists".into()).is_already_exists());
        assert!(SftpError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "exists"
        ))
        .is_already_exists());
        assert!(!SftpError::PermissionDenied("/root".into()).is_already_exists());
    }

    #[test]
    fn test_from_remote_classification() {
        assert!(matches!(
            SftpError::from_remote("No such file", "x.txt"),
            SftpError::FileNotFound(p) if p == "x.txt"
        ));
        assert!(matches!(
            SftpError::from_remote("Permission denied", "/etc"),
            SftpError::PermissionDenied(_)
        ));
        assert!(matches!(
            SftpError::from_remote("Bad message", "x"),
            SftpError::Operation(_)
        ));
    }
}
