//! In-memory session double for tests
//!
//! [`MemoryConnector`] hands out [`MemorySession`]s that share one file tree.
//! Counters and knobs let tests observe connects/teardowns, overlapping
//! operations, and simulate failures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

use crate::sftp::path_utils::{
    is_absolute_remote_path, join_remote_path, normalize_remote_path, parent_dir,
};
use crate::sftp::{
    FileInfo, FileType, PutOptions, RemoteSession, SessionConnector, SessionHandle, SftpError,
    UploadSource,
};
use crate::ssh::CredentialIdentity;

/// Login directory of every memory session
pub const HOME: &str = "/home/sftp";

#[derive(Default)]
struct MemoryFs {
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
}

impl MemoryFs {
    fn children(&self, dir: &str) -> Vec<String> {
        let parent = |p: &String| parent_dir(p).as_deref() == Some(dir);
        self.dirs
            .iter()
            .filter(|d| d.as_str() != "/")
            .filter(|d| parent(*d))
            .chain(self.files.keys().filter(|f| parent(*f)))
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct Shared {
    fs: Mutex<MemoryFs>,
    connects: AtomicUsize,
    ends: AtomicUsize,
    overlaps: AtomicUsize,
    fail_connects: AtomicBool,
    truncate_uploads: AtomicBool,
    crash_ops: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    connect_delay: Mutex<Duration>,
    op_delay: Mutex<Duration>,
    denied_prefix: Mutex<Option<String>>,
    identities: Mutex<Vec<CredentialIdentity>>,
    ops: Mutex<Vec<String>>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let shared = Shared::default();
        {
            let mut fs = shared.fs.lock();
            for dir in ["/", "/home", HOME] {
                fs.dirs.insert(dir.to_string());
            }
        }
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.shared.ends.load(Ordering::SeqCst)
    }

    /// Times an operation started while another was running on the same session
    pub fn overlaps(&self) -> usize {
        self.shared.overlaps.load(Ordering::SeqCst)
    }

    pub fn identities(&self) -> Vec<CredentialIdentity> {
        self.shared.identities.lock().clone()
    }

    /// `"<op> <path>"` for every call, in call order
    pub fn ops(&self) -> Vec<String> {
        self.shared.ops.lock().clone()
    }

    pub fn fail_connects(&self, fail: bool) {
        self.shared.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Store only half of every upload while still reporting success
    pub fn truncate_uploads(&self, truncate: bool) {
        self.shared.truncate_uploads.store(truncate, Ordering::SeqCst);
    }

    /// Panic inside every remote call, as a crashing transport would
    pub fn crash_ops(&self, crash: bool) {
        self.shared.crash_ops.store(crash, Ordering::SeqCst);
    }

    /// Park every remote call until [`Self::release_ops`] lets it through
    pub fn hold_ops(&self) {
        *self.shared.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_ops(&self, calls: usize) {
        if let Some(gate) = self.shared.gate.lock().as_ref() {
            gate.add_permits(calls);
        }
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = delay;
    }

    pub fn set_op_delay(&self, delay: Duration) {
        *self.shared.op_delay.lock() = delay;
    }

    /// Reject writes below `prefix` with permission denied
    pub fn deny_writes(&self, prefix: &str) {
        *self.shared.denied_prefix.lock() = Some(abs(prefix));
    }

    pub fn seed_dir(&self, path: &str) {
        let path = abs(path);
        let mut fs = self.shared.fs.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join_remote_path(if current.is_empty() { "/" } else { &current }, segment);
            fs.dirs.insert(current.clone());
        }
    }

    pub fn seed_file(&self, path: &str, data: &[u8]) {
        let path = abs(path);
        if let Some(parent) = parent_dir(&path) {
            self.seed_dir(&parent);
        }
        self.shared
            .fs
            .lock()
            .files
            .insert(path, Bytes::copy_from_slice(data));
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.shared.fs.lock().files.get(&abs(path)).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.shared.fs.lock().dirs.contains(&abs(path))
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Relative paths are taken from the login directory
fn abs(path: &str) -> String {
    if is_absolute_remote_path(path) {
        normalize_remote_path(path)
    } else {
        normalize_remote_path(&join_remote_path(HOME, path))
    }
}

#[async_trait]
impl SessionConnector for MemoryConnector {
    async fn connect(&self, identity: &CredentialIdentity) -> Result<SessionHandle, SftpError> {
        let delay = *self.shared.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.shared.identities.lock().push(identity.clone());
        if self.shared.fail_connects.load(Ordering::SeqCst) {
            return Err(SftpError::ConnectFailed(format!(
                "{}: connection refused",
                identity.display_name()
            )));
        }

        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySession {
            id: uuid::Uuid::new_v4().to_string(),
            shared: self.shared.clone(),
            cwd: Mutex::new(HOME.to_string()),
            connected: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

pub struct MemorySession {
    id: String,
    shared: Arc<Shared>,
    cwd: Mutex<String>,
    connected: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySession {
    fn resolve(&self, path: &str) -> String {
        if is_absolute_remote_path(path) {
            normalize_remote_path(path)
        } else {
            normalize_remote_path(&join_remote_path(&self.cwd.lock(), path))
        }
    }

    /// Record the call and hold the session "busy" for the configured delay
    async fn enter(&self, op: &str, path: &str) -> Result<InFlight, SftpError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SftpError::Operation("session is closed".to_string()));
        }
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.shared.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let guard = InFlight(self.in_flight.clone());

        self.shared.ops.lock().push(format!("{} {}", op, path));
        if self.shared.crash_ops.load(Ordering::SeqCst) {
            panic!("transport crashed during {} {}", op, path);
        }
        let gate = self.shared.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.map(|p| p.forget()).ok();
        }
        let delay = *self.shared.op_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(guard)
    }

    fn check_writable(&self, path: &str) -> Result<(), SftpError> {
        match self.shared.denied_prefix.lock().as_deref() {
            Some(prefix) if path.starts_with(prefix) => {
                Err(SftpError::PermissionDenied(path.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn info(fs: &MemoryFs, path: &str) -> Option<FileInfo> {
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        if let Some(data) = fs.files.get(path) {
            return Some(FileInfo {
                name,
                path: path.to_string(),
                file_type: FileType::File,
                size: data.len() as u64,
                modified: 0,
                permissions: "644".to_string(),
            });
        }
        fs.dirs.contains(path).then(|| FileInfo {
            name,
            path: path.to_string(),
            file_type: FileType::Directory,
            size: 0,
            modified: 0,
            permissions: "755".to_string(),
        })
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn current_dir(&self) -> Result<String, SftpError> {
        Ok(self.cwd.lock().clone())
    }

    async fn change_dir(&self, path: &str) -> Result<(), SftpError> {
        let target = self.resolve(path);
        let _busy = self.enter("cd", &target).await?;
        if !self.shared.fs.lock().dirs.contains(&target) {
            return Err(SftpError::FileNotFound(target));
        }
        *self.cwd.lock() = target;
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let dir = self.resolve(path);
        let _busy = self.enter("list", &dir).await?;
        let fs = self.shared.fs.lock();
        if !fs.dirs.contains(&dir) {
            return Err(SftpError::FileNotFound(dir));
        }
        Ok(fs
            .children(&dir)
            .iter()
            .filter_map(|child| Self::info(&fs, child))
            .collect())
    }

    async fn get(&self, path: &str) -> Result<Bytes, SftpError> {
        let target = self.resolve(path);
        let _busy = self.enter("get", &target).await?;
        self.shared
            .fs
            .lock()
            .files
            .get(&target)
            .cloned()
            .ok_or(SftpError::FileNotFound(target))
    }

    async fn put(
        &self,
        source: UploadSource,
        path: &str,
        _options: PutOptions,
    ) -> Result<(), SftpError> {
        let target = self.resolve(path);
        let _busy = self.enter("put", &target).await?;
        self.check_writable(&target)?;

        let mut data = match source {
            UploadSource::Bytes(data) => data.to_vec(),
            UploadSource::LocalFile(local) => tokio::fs::read(local).await?,
            UploadSource::Stream(mut stream) => {
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await?;
                buf
            }
        };
        if self.shared.truncate_uploads.load(Ordering::SeqCst) {
            data.truncate(data.len() / 2);
        }

        let mut fs = self.shared.fs.lock();
        let parent = parent_dir(&target).unwrap_or_else(|| "/".to_string());
        if !fs.dirs.contains(&parent) {
            return Err(SftpError::FileNotFound(parent));
        }
        fs.files.insert(target, Bytes::from(data));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), SftpError> {
        let target = self.resolve(path);
        let _busy = self.enter("delete", &target).await?;
        self.check_writable(&target)?;
        self.shared
            .fs
            .lock()
            .files
            .remove(&target)
            .map(|_| ())
            .ok_or(SftpError::FileNotFound(target))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        let target = self.resolve(path);
        let _busy = self.enter("mkdir", &target).await?;
        self.check_writable(&target)?;

        let mut fs = self.shared.fs.lock();
        if fs.dirs.contains(&target) || fs.files.contains_key(&target) {
            if recursive && fs.dirs.contains(&target) {
                return Ok(());
            }
            return Err(SftpError::Operation(format!("{}: File exists", target)));
        }

        let parent = parent_dir(&target).unwrap_or_else(|| "/".to_string());
        if !fs.dirs.contains(&parent) {
            if !recursive {
                return Err(SftpError::FileNotFound(parent));
            }
            let mut current = String::new();
            for segment in parent.split('/').filter(|s| !s.is_empty()) {
                current =
                    join_remote_path(if current.is_empty() { "/" } else { &current }, segment);
                if fs.files.contains_key(&current) {
                    return Err(SftpError::Operation(format!("{}: Not a directory", current)));
                }
                fs.dirs.insert(current.clone());
            }
        }
        fs.dirs.insert(target);
        Ok(())
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        let target = self.resolve(path);
        let _busy = self.enter("rmdir", &target).await?;
        self.check_writable(&target)?;

        let mut fs = self.shared.fs.lock();
        if !fs.dirs.contains(&target) {
            return Err(SftpError::FileNotFound(target));
        }

        let prefix = format!("{}/", target);
        let non_empty = fs.files.keys().any(|f| f.starts_with(&prefix))
            || fs.dirs.iter().any(|d| d.starts_with(&prefix));
        if non_empty && !recursive {
            return Err(SftpError::Operation(format!(
                "{}: Directory not empty",
                target
            )));
        }

        fs.files.retain(|f, _| !f.starts_with(&prefix));
        fs.dirs.retain(|d| !d.starts_with(&prefix) && *d != target);
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        let target = self.resolve(path);
        let _busy = self.enter("stat", &target).await?;
        let fs = self.shared.fs.lock();
        Self::info(&fs, &target).ok_or(SftpError::FileNotFound(target))
    }

    async fn end(&self) -> Result<(), SftpError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.shared.ends.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
