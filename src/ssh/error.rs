//! SSH transport errors
//!
//! Everything here ends up as [`crate::sftp::SftpError::ConnectFailed`]; the
//! variants only shape the message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Authentication failed for {user}: {reason}")]
    AuthenticationFailed { user: String, reason: String },

    #[error("Host key for {host} is not trusted (fingerprint {fingerprint})")]
    UntrustedHostKey { host: String, fingerprint: String },

    #[error("SFTP subsystem not available: {0}")]
    Subsystem(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("{0} timed out after {1}s")]
    Timeout(&'static str, u64),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Key(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
