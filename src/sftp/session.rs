//! Remote session capability
//!
//! [`RemoteSession`] is everything the operation layer needs from a live
//! SFTP connection. [`SftpSession`] implements it over russh + russh-sftp;
//! tests use an in-memory double.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use russh::client::Handle;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::fs::Metadata;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::path_utils::{is_absolute_remote_path, join_remote_path, normalize_remote_path};
use super::types::*;
use crate::ssh::{ClientHandler, CredentialIdentity, SshError};

/// A live session, shared between the cache entry and the running operation
pub type SessionHandle = Arc<dyn RemoteSession>;

/// Operations the transport layer must provide.
///
/// Relative paths are interpreted against [`RemoteSession::current_dir`].
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Unique id of this connection (for logs and `open` results)
    fn id(&self) -> &str;

    async fn current_dir(&self) -> Result<String, SftpError>;

    async fn change_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>, SftpError>;

    async fn get(&self, path: &str) -> Result<Bytes, SftpError>;

    async fn put(
        &self,
        source: UploadSource,
        path: &str,
        options: PutOptions,
    ) -> Result<(), SftpError>;

    async fn delete(&self, path: &str) -> Result<(), SftpError>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SftpError>;

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), SftpError>;

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError>;

    /// Close the connection. Calling it twice is a no-op.
    async fn end(&self) -> Result<(), SftpError>;

    /// Whether the connection still looks usable
    fn is_connected(&self) -> bool;
}

/// Opens sessions for a credential identity
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, identity: &CredentialIdentity) -> Result<SessionHandle, SftpError>;
}

/// russh-sftp backed session
pub struct SftpSession {
    id: String,
    sftp: RusshSftpSession,
    ssh: Handle<ClientHandler>,
    /// Current working directory
    cwd: RwLock<String>,
    connected: AtomicBool,
}

impl SftpSession {
    /// Open the SFTP subsystem on an authenticated SSH connection
    pub async fn open(ssh: Handle<ClientHandler>) -> Result<Self, SftpError> {
        let id = uuid::Uuid::new_v4().to_string();
        info!("Opening SFTP subsystem for session {}", id);

        let channel = ssh
            .channel_open_session()
            .await
            .map_err(SshError::from)?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(SshError::from)?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Subsystem(e.to_string()))?;

        // Initial working directory is the login directory
        let cwd = sftp
            .canonicalize(".")
            .await
            .map_err(|e| SftpError::ConnectFailed(e.to_string()))?;

        info!("SFTP subsystem opened for session {} (cwd: {})", id, cwd);

        Ok(Self {
            id,
            sftp,
            ssh,
            cwd: RwLock::new(cwd),
            connected: AtomicBool::new(true),
        })
    }

    fn resolve_path(&self, path: &str) -> String {
        if is_absolute_remote_path(path) {
            normalize_remote_path(path)
        } else {
            normalize_remote_path(&join_remote_path(&self.cwd.read(), path))
        }
    }

    fn map_sftp_error(&self, err: SftpErrorInner, path: &str) -> SftpError {
        SftpError::from_remote(err.to_string(), path)
    }

    async fn is_dir(&self, path: &str) -> bool {
        matches!(self.sftp.metadata(path).await, Ok(m) if m.is_dir())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        match self.sftp.create_dir(path).await {
            Ok(()) => Ok(()),
            // SFTP v3 has no EEXIST status; look before reporting a generic failure
            Err(_) if self.is_dir(path).await => Err(SftpError::Operation(format!(
                "{}: directory already exists",
                path
            ))),
            Err(e) => Err(self.map_sftp_error(e, path)),
        }
    }

    async fn remove_tree(&self, path: &str) -> Result<(), SftpError> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| self.map_sftp_error(e, path))?;

        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child = join_remote_path(path, &name);
            if entry.metadata().is_dir() {
                // Boxed to avoid infinite future size
                Box::pin(self.remove_tree(&child)).await?;
            } else {
                self.sftp
                    .remove_file(&child)
                    .await
                    .map_err(|e| self.map_sftp_error(e, &child))?;
            }
        }

        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| self.map_sftp_error(e, path))
    }
}

fn file_info(name: String, path: String, metadata: &Metadata) -> FileInfo {
    let file_type = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.is_symlink() {
        FileType::Symlink
    } else if metadata.is_regular() {
        FileType::File
    } else {
        FileType::Unknown
    };

    let permissions = metadata
        .permissions
        .map(|p| format!("{:o}", p & 0o777))
        .unwrap_or_else(|| "000".to_string());

    FileInfo {
        name,
        path,
        file_type,
        size: metadata.size.unwrap_or(0),
        modified: metadata.mtime.map(|t| t as i64).unwrap_or(0),
        permissions,
    }
}

#[async_trait]
impl RemoteSession for SftpSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn current_dir(&self) -> Result<String, SftpError> {
        Ok(self.cwd.read().clone())
    }

    async fn change_dir(&self, path: &str) -> Result<(), SftpError> {
        let target = self.resolve_path(path);
        let canonical = self
            .sftp
            .canonicalize(&target)
            .await
            .map_err(|e| self.map_sftp_error(e, &target))?;

        if !self.is_dir(&canonical).await {
            return Err(SftpError::Operation(format!("{} is not a directory", canonical)));
        }

        debug!("Session {} cwd -> {}", self.id, canonical);
        *self.cwd.write() = canonical;
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let dir = self.resolve_path(path);
        debug!("Listing directory: {}", dir);

        let read_dir = self
            .sftp
            .read_dir(&dir)
            .await
            .map_err(|e| self.map_sftp_error(e, &dir))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();

            // Skip . and ..
            if name == "." || name == ".." {
                continue;
            }

            let full_path = join_remote_path(&dir, &name);
            entries.push(file_info(name, full_path, &entry.metadata()));
        }

        debug!("Listed {} entries in {}", entries.len(), dir);
        Ok(entries)
    }

    async fn get(&self, path: &str) -> Result<Bytes, SftpError> {
        let target = self.resolve_path(path);
        debug!("Reading file: {}", target);

        let content = self
            .sftp
            .read(&target)
            .await
            .map_err(|e| self.map_sftp_error(e, &target))?;

        Ok(Bytes::from(content))
    }

    async fn put(
        &self,
        source: UploadSource,
        path: &str,
        options: PutOptions,
    ) -> Result<(), SftpError> {
        let target = self.resolve_path(path);
        debug!("Uploading {:?} to {}", source, target);

        // Open file for writing (create if not exists, truncate if exists)
        let mut file = self
            .sftp
            .open_with_flags(
                &target,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| self.map_sftp_error(e, &target))?;

        let buffer_size = (constants::DEFAULT_CHUNK_SIZE * options.concurrency.max(1))
            .min(constants::MAX_COPY_BUFFER);

        let written = match source {
            UploadSource::Bytes(data) => {
                file.write_all(&data).await?;
                data.len() as u64
            }
            UploadSource::LocalFile(local) => {
                let local_file = tokio::fs::File::open(&local).await?;
                let mut reader = BufReader::with_capacity(buffer_size, local_file);
                tokio::io::copy_buf(&mut reader, &mut file).await?
            }
            UploadSource::Stream(stream) => {
                let mut reader = BufReader::with_capacity(buffer_size, stream);
                tokio::io::copy_buf(&mut reader, &mut file).await?
            }
        };

        file.flush().await?;

        // Closing the handle is where some servers report write failures
        if let Err(e) = file.shutdown().await {
            if options.reject_on_error {
                return Err(SftpError::Operation(format!(
                    "Failed to close {}: {}",
                    target, e
                )));
            }
            warn!("Ignoring close error for {}: {}", target, e);
        }

        info!("Wrote {} bytes to {}", written, target);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), SftpError> {
        let target = self.resolve_path(path);
        info!("Deleting: {}", target);

        self.sftp
            .remove_file(&target)
            .await
            .map_err(|e| self.map_sftp_error(e, &target))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        let target = self.resolve_path(path);
        info!("Creating directory: {} (recursive: {})", target, recursive);

        if !recursive {
            return self.create_dir(&target).await;
        }

        let mut current = if is_absolute_remote_path(&target) {
            "/".to_string()
        } else {
            String::new()
        };
        for segment in target.split('/').filter(|s| !s.is_empty()) {
            current = if current.is_empty() {
                segment.to_string()
            } else {
                join_remote_path(&current, segment)
            };
            if self.is_dir(&current).await {
                continue;
            }
            self.create_dir(&current).await?;
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        let target = self.resolve_path(path);
        info!("Removing directory: {} (recursive: {})", target, recursive);

        if recursive {
            self.remove_tree(&target).await
        } else {
            self.sftp
                .remove_dir(&target)
                .await
                .map_err(|e| self.map_sftp_error(e, &target))
        }
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        let target = self.resolve_path(path);
        debug!("Getting file info: {}", target);

        let metadata = self
            .sftp
            .metadata(&target)
            .await
            .map_err(|e| self.map_sftp_error(e, &target))?;

        let name = target
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(file_info(name, target, &metadata))
    }

    async fn end(&self) -> Result<(), SftpError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing SFTP session {}", self.id);
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close for {} reported: {}", self.id, e);
        }

        self.ssh
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await
            .map_err(|e| SftpError::Operation(format!("Disconnect failed: {}", e)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.ssh.is_closed()
    }
}
