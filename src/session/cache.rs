//! Connection Cache
//!
//! At most one live [`RemoteSession`](crate::sftp::RemoteSession) per
//! credential identity.
//!
//! # Lifecycle
//!
//! - `acquire` returns the cached handle when one is alive, otherwise connects.
//!   The new handle is stored only when the caller asks to persist it
//!   (explicit `open`, or reuse mode).
//! - `release` tears down a handle that was opened for a single operation.
//! - `close` / `close_all` remove the entry first, then end the session, so a
//!   closed handle is never handed out again.
//!
//! All calls for one key are serialized by the operation queue; the cache
//! itself does no per-key locking across `.await`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::sftp::{SessionConnector, SessionHandle, SftpError};
use crate::ssh::{CredentialIdentity, SessionKey};

/// One cached session
pub struct CacheEntry {
    /// Entry id (uuid)
    pub id: String,

    pub key: SessionKey,

    pub handle: SessionHandle,

    pub created_at: DateTime<Utc>,

    /// Unix timestamp (seconds) of the last acquire
    last_active: AtomicI64,

    /// Operations served by this entry
    use_count: AtomicU64,
}

impl CacheEntry {
    fn new(key: SessionKey, handle: SessionHandle) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key,
            handle,
            created_at: now,
            last_active: AtomicI64::new(now.timestamp()),
            use_count: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_active.store(Utc::now().timestamp(), Ordering::SeqCst);
        self.use_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::SeqCst)
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::SeqCst)
    }

    fn to_info(&self) -> CacheEntryInfo {
        CacheEntryInfo {
            id: self.id.clone(),
            key: self.key.to_string(),
            session_id: self.handle.id().to_string(),
            connected: self.handle.is_connected(),
            created_at: self.created_at.to_rfc3339(),
            last_active: DateTime::from_timestamp(self.last_active(), 0)
                .unwrap_or(self.created_at)
                .to_rfc3339(),
            use_count: self.use_count(),
        }
    }
}

/// Cache entry snapshot (for monitoring)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryInfo {
    pub id: String,
    pub key: String,
    pub session_id: String,
    pub connected: bool,
    pub created_at: String,
    pub last_active: String,
    pub use_count: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_entries: usize,
    pub entries: Vec<CacheEntryInfo>,
}

/// A handle borrowed for one operation
pub struct Lease {
    pub key: SessionKey,
    pub handle: SessionHandle,
    /// The handle came out of the cache
    pub was_cached: bool,
    /// The handle is (now) owned by the cache
    pub persisted: bool,
}

impl Lease {
    /// Whether `release` will end the session
    pub fn is_transient(&self) -> bool {
        !self.was_cached && !self.persisted
    }
}

pub struct ConnectionCache {
    connector: Arc<dyn SessionConnector>,
    entries: DashMap<SessionKey, Arc<CacheEntry>>,
    connect_timeout: Duration,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn SessionConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            entries: DashMap::new(),
            connect_timeout,
        }
    }

    /// Get a live handle for `identity`, connecting if needed.
    ///
    /// `on_connect` runs only when a new connection is about to be made.
    pub async fn acquire(
        &self,
        identity: &CredentialIdentity,
        persist: bool,
        on_connect: impl FnOnce(),
    ) -> Result<Lease, SftpError> {
        let key = identity.key();

        if let Some(entry) = self.live_entry(&key).await {
            entry.touch();
            debug!("Reusing cached session {} for {}", entry.handle.id(), key);
            return Ok(Lease {
                key,
                handle: entry.handle.clone(),
                was_cached: true,
                persisted: true,
            });
        }

        on_connect();
        info!("Connecting new session for {}", identity.display_name());

        let handle = tokio::time::timeout(self.connect_timeout, self.connector.connect(identity))
            .await
            .map_err(|_| {
                SftpError::ConnectFailed(format!(
                    "{}: timed out after {}s",
                    identity.display_name(),
                    self.connect_timeout.as_secs()
                ))
            })??;

        if persist {
            let entry = Arc::new(CacheEntry::new(key.clone(), handle.clone()));
            entry.touch();
            info!("Cached session {} for {}", handle.id(), key);
            self.entries.insert(key.clone(), entry);
        }

        Ok(Lease {
            key,
            handle,
            was_cached: false,
            persisted: persist,
        })
    }

    /// Give back a lease; one-shot sessions are ended here.
    pub async fn release(&self, lease: Lease) {
        if !lease.is_transient() {
            return;
        }

        debug!("Ending one-shot session {} for {}", lease.handle.id(), lease.key);
        if let Err(e) = lease.handle.end().await {
            warn!("Failed to end session for {}: {}", lease.key, e);
        }
    }

    /// Remove and end the cached session for `key`.
    ///
    /// Returns whether something was cached. Teardown errors are swallowed.
    pub async fn close(&self, key: &SessionKey) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            debug!("No cached session for {}", key);
            return false;
        };

        info!("Closing cached session {} for {}", entry.handle.id(), key);
        if let Err(e) = entry.handle.end().await {
            warn!("Failed to close session for {}: {}", key, e);
        }
        true
    }

    /// Close every cached session; returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let keys: Vec<SessionKey> = self.entries.iter().map(|e| e.key().clone()).collect();

        let mut closed = 0;
        for key in keys {
            if self.close(&key).await {
                closed += 1;
            }
        }

        info!("Closed {} cached sessions", closed);
        closed
    }

    pub fn is_cached(&self, key: &SessionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut entries: Vec<CacheEntryInfo> =
            self.entries.iter().map(|e| e.value().to_info()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        CacheStats {
            total_entries: entries.len(),
            entries,
        }
    }

    /// Cached entry if its session still looks alive; dead ones are evicted.
    async fn live_entry(&self, key: &SessionKey) -> Option<Arc<CacheEntry>> {
        // Clone out of the map so no shard lock is held across `.await`
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        if entry.handle.is_connected() {
            return Some(entry);
        }

        warn!(
            "Cached session {} for {} is no longer connected, evicting",
            entry.handle.id(),
            key
        );
        self.entries.remove(key);
        if let Err(e) = entry.handle.end().await {
            debug!("Ending dead session for {}: {}", key, e);
        }
        None
    }
}
