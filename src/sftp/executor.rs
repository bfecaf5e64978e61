//! Operation executor
//!
//! One request goes through resolve → dispatch → verify → cleanup. The
//! executor never runs two operations for the same identity at once; that
//! guarantee comes from the caller running it inside the operation queue.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::SftpError;
use super::path_utils::{parent_dir, resolve_dir_path, resolve_file_path, split_payload_path};
use super::session::SessionHandle;
use super::types::*;
use crate::session::{ConnectionCache, Lease};
use crate::ssh::CredentialIdentity;
use crate::status::StatusReporter;

/// A request bound to its credential identity, waiting in the queue
#[derive(Debug)]
pub struct PendingOperation {
    pub kind: OperationKind,
    /// Status owner (node name)
    pub owner: String,
    pub identity: CredentialIdentity,
    pub workdir: Option<String>,
    pub filename: Option<String>,
    pub payload: Payload,
    /// Keep the session cached after this operation
    pub persist: bool,
    /// Let a string payload override the path of list/get/delete/mkdir/rmdir
    pub payload_as_path: bool,
    pub put_options: PutOptions,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, owner: impl Into<String>, identity: CredentialIdentity) -> Self {
        Self {
            kind,
            owner: owner.into(),
            identity,
            workdir: None,
            filename: None,
            payload: Payload::None,
            persist: false,
            payload_as_path: true,
            put_options: PutOptions::default(),
        }
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
}

/// Remote location an operation acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// open / close
    Session,
    Directory(String),
    File(String),
}

impl Target {
    /// Compute the target of `op` from its workdir, file name and payload.
    pub fn resolve(op: &PendingOperation) -> Result<Self, SftpError> {
        let workdir = op.workdir.as_deref();
        let path_override = if op.payload_as_path && op.kind.accepts_path_payload() {
            op.payload.as_path()
        } else {
            None
        };

        let target = match op.kind {
            OperationKind::Open | OperationKind::Close => Target::Session,
            OperationKind::List | OperationKind::Mkdir | OperationKind::Rmdir => {
                Target::Directory(resolve_dir_path(path_override.or(workdir)))
            }
            OperationKind::Get | OperationKind::Delete => match path_override {
                Some(path) => {
                    let (dir, name) = split_payload_path(path);
                    Target::File(resolve_file_path(Some(&dir), Some(&name), None)?)
                }
                None => Target::File(resolve_file_path(
                    workdir,
                    op.filename.as_deref(),
                    op.payload.name(),
                )?),
            },
            OperationKind::Put => Target::File(resolve_file_path(
                workdir,
                op.filename.as_deref(),
                op.payload.name(),
            )?),
        };

        Ok(target)
    }

    fn path(&self) -> &str {
        match self {
            Target::Session => "",
            Target::Directory(path) | Target::File(path) => path,
        }
    }
}

/// Runs operations against cached or one-shot sessions
#[derive(Clone)]
pub struct OperationExecutor {
    cache: Arc<ConnectionCache>,
    status: StatusReporter,
}

impl OperationExecutor {
    pub fn new(cache: Arc<ConnectionCache>, status: StatusReporter) -> Self {
        Self { cache, status }
    }

    /// Execute `op` and report its terminal status.
    pub async fn execute(&self, op: PendingOperation) -> Result<OperationResult, SftpError> {
        let owner = op.owner.clone();
        let kind = op.kind;

        let result = self.run(op).await;
        match &result {
            Ok(_) => {
                debug!("{} for {} succeeded", kind, owner);
                self.status.succeeded(&owner);
            }
            Err(e) => {
                warn!("{} for {} failed: {}", kind, owner, e);
                self.status.failed(&owner, e);
            }
        }
        result
    }

    async fn run(&self, op: PendingOperation) -> Result<OperationResult, SftpError> {
        let target = Target::resolve(&op)?;
        let PendingOperation {
            kind,
            owner,
            identity,
            payload,
            persist,
            put_options,
            ..
        } = op;

        // Never connects just to disconnect
        if kind == OperationKind::Close {
            self.status.in_progress(&owner, kind.progress_label());
            let closed = self.cache.close(&identity.key()).await;
            debug!("close for {}: cached session closed = {}", owner, closed);
            return Ok(OperationResult::Closed);
        }

        // Unusable upload input fails before any connection is made
        let upload = match kind {
            OperationKind::Put => Some(upload_source(payload).await?),
            _ => None,
        };

        let persist = persist || kind == OperationKind::Open;
        let lease = self
            .cache
            .acquire(&identity, persist, || self.status.connecting(&owner))
            .await?;
        let handle = lease.handle.clone();
        let lease = LeaseGuard::new(self.cache.clone(), lease);

        self.status.in_progress(&owner, kind.progress_label());
        debug!("{} {} on session {}", kind, target.path(), handle.id());

        let result = dispatch(&handle, kind, &target, upload, put_options).await;

        lease.release().await;
        result
    }
}

/// Hands a lease back to the cache even when the operation unwinds
struct LeaseGuard {
    cache: Arc<ConnectionCache>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    fn new(cache: Arc<ConnectionCache>, lease: Lease) -> Self {
        Self {
            cache,
            lease: Some(lease),
        }
    }

    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            self.cache.release(lease).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        warn!("Operation on {} did not complete, releasing its session", lease.key);
        let cache = self.cache.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { cache.release(lease).await });
            }
            Err(_) => warn!("No runtime to end session for {}", lease.key),
        }
    }
}

async fn dispatch(
    session: &SessionHandle,
    kind: OperationKind,
    target: &Target,
    upload: Option<(UploadSource, Option<u64>)>,
    put_options: PutOptions,
) -> Result<OperationResult, SftpError> {
    let path = target.path().to_string();

    match kind {
        OperationKind::List => Ok(OperationResult::Listing(session.list(&path).await?)),
        OperationKind::Get => {
            let data = session.get(&path).await?;
            Ok(OperationResult::Content { path, data })
        }
        OperationKind::Put => {
            let (source, expected) = upload
                .ok_or_else(|| SftpError::Resolution("nothing to upload".to_string()))?;
            put(session, path, source, expected, put_options).await
        }
        OperationKind::Delete => {
            session.delete(&path).await?;
            Ok(OperationResult::Deleted { path })
        }
        OperationKind::Mkdir => {
            session.mkdir(&path, false).await?;
            Ok(OperationResult::DirectoryCreated { path })
        }
        OperationKind::Rmdir => {
            session.rmdir(&path, false).await?;
            Ok(OperationResult::DirectoryRemoved { path })
        }
        OperationKind::Open => Ok(OperationResult::Opened {
            session_id: session.id().to_string(),
        }),
        OperationKind::Close => Ok(OperationResult::Closed),
    }
}

/// Turn the payload into an upload source and its expected size, if known.
///
/// A text payload naming an existing local file uploads that file; any other
/// text is uploaded as its UTF-8 bytes.
pub async fn upload_source(payload: Payload) -> Result<(UploadSource, Option<u64>), SftpError> {
    match payload {
        Payload::None => Err(SftpError::Resolution("nothing to upload".to_string())),
        Payload::Text(text) => match tokio::fs::metadata(&text).await {
            Ok(meta) if meta.is_file() => {
                debug!("Uploading local file {}", text);
                Ok((UploadSource::LocalFile(PathBuf::from(text)), Some(meta.len())))
            }
            _ => {
                let size = text.len() as u64;
                Ok((UploadSource::Bytes(text.into_bytes().into()), Some(size)))
            }
        },
        Payload::Bytes(data) | Payload::Named { data, .. } => {
            let size = data.len() as u64;
            Ok((UploadSource::Bytes(data), Some(size)))
        }
        Payload::Stream(stream) => Ok((UploadSource::Stream(stream), None)),
    }
}

async fn put(
    session: &SessionHandle,
    path: String,
    source: UploadSource,
    expected: Option<u64>,
    options: PutOptions,
) -> Result<OperationResult, SftpError> {
    if let Some(parent) = parent_dir(&path) {
        ensure_dir(session, &parent).await;
    }

    session.put(source, &path, options).await?;

    // The transport acknowledging the write is not proof of integrity
    let remote = session.stat(&path).await?;
    if let Some(expected) = expected {
        if expected != remote.size {
            return Err(SftpError::SizeMismatch {
                path,
                expected,
                actual: remote.size,
            });
        }
    }

    info!("Uploaded {} ({} bytes)", path, remote.size);
    Ok(OperationResult::Transfer(TransferOutcome {
        ok: true,
        path,
        size: remote.size,
    }))
}

/// `mkdir -p` before an upload. Failures never abort here: an existing
/// directory is fine, anything else resurfaces from the upload itself.
async fn ensure_dir(session: &SessionHandle, dir: &str) {
    match session.mkdir(dir, true).await {
        Ok(()) => {}
        Err(e) if e.is_already_exists() => debug!("{} already exists", dir),
        Err(e) => warn!("Could not create {}: {}", dir, e),
    }
}
