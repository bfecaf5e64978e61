//! Session Manager
//!
//! Owns the connection cache, the operation queue and the executor, and wires
//! them together: every submitted operation is queued behind the in-flight
//! work of its credential identity, then executed against the cached (or a
//! one-shot) session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::cache::{CacheStats, ConnectionCache};
use super::queue::OperationQueue;
use crate::config::{ConfigFile, ManagerConfig};
use crate::sftp::{OperationExecutor, OperationResult, PendingOperation, SessionConnector, SftpError};
use crate::ssh::{CredentialIdentity, SshConnector};
use crate::status::StatusReporter;

pub struct SessionManager {
    cache: Arc<ConnectionCache>,
    queue: OperationQueue,
    executor: OperationExecutor,
    status: StatusReporter,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn SessionConnector>, config: &ManagerConfig) -> Self {
        let cache = Arc::new(ConnectionCache::new(
            connector,
            Duration::from_secs(config.connect_timeout_secs),
        ));
        let status = StatusReporter::new(Duration::from_millis(config.status_clear_ms));
        let executor = OperationExecutor::new(cache.clone(), status.clone());

        Self {
            cache,
            queue: OperationQueue::new(config.queue_capacity),
            executor,
            status,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Manager talking to real servers over SSH
    pub fn from_config(file: &ConfigFile) -> Self {
        Self::new(Arc::new(SshConnector::new(file.ssh.clone())), &file.manager)
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Operations queued or running for `identity`
    pub fn pending(&self, identity: &CredentialIdentity) -> usize {
        self.queue.pending(&identity.key())
    }

    /// Queue `op` behind its identity's in-flight work and wait for the result.
    pub async fn submit(&self, op: PendingOperation) -> Result<OperationResult, SftpError> {
        let key = op.identity.key();
        let owner = op.owner.clone();

        if self.shutting_down.load(Ordering::SeqCst) {
            let err = SftpError::QueueClosed(key.to_string());
            self.status.failed(&owner, &err);
            return Err(err);
        }

        let executor = self.executor.clone();
        let executed = Arc::new(AtomicBool::new(false));
        let executed_flag = executed.clone();

        let result = self
            .queue
            .run(&key, async move {
                let result = executor.execute(op).await;
                executed_flag.store(true, Ordering::SeqCst);
                result
            })
            .await;

        // Rejected or aborted jobs never reached the executor's own reporting
        if let Err(e) = &result {
            if !executed.load(Ordering::SeqCst) {
                self.status.failed(&owner, e);
            }
        }
        result
    }

    /// Close the cached session for `identity` once the work queued before
    /// this call is done.
    ///
    /// The teardown is itself a queued job, so it never ends a session under
    /// a running operation; anything submitted afterwards reconnects.
    pub async fn close(&self, identity: &CredentialIdentity) -> bool {
        let key = identity.key();
        let cache = self.cache.clone();
        let close_key = key.clone();

        match self
            .queue
            .run_unbounded(&key, async move { Ok(cache.close(&close_key).await) })
            .await
        {
            Ok(closed) => closed,
            Err(e) => {
                warn!("Could not close session for {}: {}", key, e);
                false
            }
        }
    }

    /// Drain every queue, then close every cached session.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down session manager");
        self.queue.drain_all().await;
        let closed = self.cache.close_all().await;
        info!("Session manager stopped ({} sessions closed)", closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::{OperationKind, Payload};
    use crate::status::StatusPhase;
    use crate::testing::MemoryConnector;

    fn identity(host: &str) -> CredentialIdentity {
        CredentialIdentity::with_password(host, 22, "deploy", "secret")
    }

    fn manager(connector: &MemoryConnector, config: ManagerConfig) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(Arc::new(connector.clone()), &config))
    }

    fn put(host: &str, name: &str, body: &str) -> PendingOperation {
        PendingOperation::new(OperationKind::Put, "node-1", identity(host))
            .filename(name)
            .payload(Payload::Text(body.into()))
            .persist(true)
    }

    #[tokio::test]
    async fn test_same_identity_never_overlaps() {
        let connector = MemoryConnector::new();
        connector.set_op_delay(Duration::from_millis(5));
        let manager = manager(&connector, ManagerConfig::default());

        let mut handles = Vec::new();
        for i in 0..6 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.submit(put("a", &format!("f{}.txt", i), "data")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(connector.overlaps(), 0);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_failure_then_success_in_order() {
        let connector = MemoryConnector::new();
        connector.hold_ops();
        let manager = manager(&connector, ManagerConfig::default());
        let mut events = manager.status().subscribe();

        let delete = PendingOperation::new(OperationKind::Delete, "first", identity("a"))
            .filename("missing.txt");
        let m = manager.clone();
        let first = tokio::spawn(async move { m.submit(delete).await });
        while manager.pending(&identity("a")) < 1 {
            tokio::task::yield_now().await;
        }

        let mut upload = put("a", "ok.txt", "fine");
        upload.owner = "second".into();
        let m = manager.clone();
        let second = tokio::spawn(async move { m.submit(upload).await });
        while manager.pending(&identity("a")) < 2 {
            tokio::task::yield_now().await;
        }

        connector.release_ops(16);
        assert!(matches!(
            first.await.unwrap(),
            Err(SftpError::FileNotFound(_))
        ));
        second.await.unwrap().unwrap();
        assert!(connector.file("ok.txt").is_some());
        assert_eq!(connector.overlaps(), 0);

        let mut log = Vec::new();
        while let Ok(event) = events.try_recv() {
            log.push((event.owner, event.phase));
        }
        let first_failed = log
            .iter()
            .position(|(o, p)| o == "first" && matches!(p, StatusPhase::Failed { .. }))
            .unwrap();
        let second_started = log.iter().position(|(o, _)| o == "second").unwrap();
        assert!(log[..first_failed].iter().any(|(o, _)| o == "first"));
        assert!(first_failed < second_started);

        // The failing delete is the first remote call, the upload follows it
        let ops = connector.ops();
        assert!(ops[0].starts_with("delete "));
        assert!(ops[1..].iter().all(|op| !op.starts_with("delete ")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_is_serialized_with_operations() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector, ManagerConfig::default());
        let id = identity("a");

        manager.submit(put("a", "warm.txt", "0")).await.unwrap();
        connector.hold_ops();

        let m = manager.clone();
        let before = tokio::spawn(async move { m.submit(put("a", "one.txt", "1")).await });
        while manager.pending(&id) < 1 {
            tokio::task::yield_now().await;
        }

        let m = manager.clone();
        let close_id = id.clone();
        let close = tokio::spawn(async move { m.close(&close_id).await });
        while manager.pending(&id) < 2 {
            tokio::task::yield_now().await;
        }

        let m = manager.clone();
        let after = tokio::spawn(async move { m.submit(put("a", "two.txt", "2")).await });
        while manager.pending(&id) < 3 {
            tokio::task::yield_now().await;
        }

        connector.release_ops(64);
        before.await.unwrap().unwrap();
        assert!(close.await.unwrap());
        after.await.unwrap().unwrap();

        assert_eq!(connector.overlaps(), 0);
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.ends(), 1);
        assert!(connector.file("one.txt").is_some());
        assert!(connector.file("two.txt").is_some());
        assert!(manager.cache().is_cached(&id.key()));
    }

    #[tokio::test]
    async fn test_bounded_queue_reports_failure_status() {
        let connector = MemoryConnector::new();
        connector.set_op_delay(Duration::from_millis(50));
        let manager = manager(
            &connector,
            ManagerConfig {
                queue_capacity: 1,
                ..Default::default()
            },
        );

        let m = manager.clone();
        let running = tokio::spawn(async move { m.submit(put("a", "slow.txt", "x")).await });
        while manager.pending(&identity("a")) == 0 {
            tokio::task::yield_now().await;
        }

        let rejected = manager.submit(put("a", "fast.txt", "y")).await;
        assert!(matches!(rejected, Err(SftpError::QueueFull { .. })));
        assert!(matches!(
            manager.status().current("node-1"),
            Some(StatusPhase::Failed { .. })
        ));

        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_closes() {
        let connector = MemoryConnector::new();
        connector.set_op_delay(Duration::from_millis(5));
        let manager = manager(&connector, ManagerConfig::default());

        let mut handles = Vec::new();
        for i in 0..3 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                m.submit(put("a", &format!("q{}.txt", i), "queued")).await
            }));
        }
        while manager.pending(&identity("a")) < 3 {
            tokio::task::yield_now().await;
        }

        manager.shutdown().await;

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        for i in 0..3 {
            assert!(connector.file(&format!("q{}.txt", i)).is_some());
        }
        assert!(manager.cache().is_empty());
        assert_eq!(connector.ends(), 1);

        let late = manager.submit(put("a", "late.txt", "x")).await;
        assert!(matches!(late, Err(SftpError::QueueClosed(_))));
    }

    #[tokio::test]
    async fn test_close_identity_reconnects_next_time() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector, ManagerConfig::default());
        let id = identity("a");

        manager.submit(put("a", "one.txt", "1")).await.unwrap();
        assert!(manager.cache().is_cached(&id.key()));

        assert!(manager.close(&id).await);
        assert!(!manager.cache().is_cached(&id.key()));

        manager.submit(put("a", "two.txt", "2")).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector, ManagerConfig::default());

        manager.submit(put("a", "one.txt", "1")).await.unwrap();
        manager.submit(put("b", "two.txt", "2")).await.unwrap();

        let stats = manager.cache_stats();
        assert_eq!(stats.total_entries, 2);
        assert!(stats.entries.iter().all(|e| e.connected && e.use_count == 1));
    }
}
