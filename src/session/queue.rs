//! Operation Queue
//!
//! Per-session mailbox that serializes every operation against one cached
//! connection.
//!
//! # Architecture
//!
//! Each [`SessionKey`] gets a worker task owning the receiving end of an
//! mpsc channel. Callers never touch the session directly: they enqueue a job
//! and await its reply on a oneshot channel.
//!
//! - Jobs for one key run strictly in submission order, one at a time
//! - Each job runs in its own task, so an error or a panic only fails that job
//! - Different keys have different workers and run concurrently
//!
//! Dropping the sender (see [`OperationQueue::drain`]) lets the worker finish
//! what is already queued, then exit. The mailbox stays registered until the
//! worker is gone, and rejects new work meanwhile, so a second worker for the
//! same key can never start while the first is still running.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::sftp::SftpError;
use crate::ssh::SessionKey;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Counts a job from enqueue until it finishes, panics or is dropped unrun
struct DepthGuard(Arc<AtomicUsize>);

impl DepthGuard {
    fn new(depth: &Arc<AtomicUsize>) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self(depth.clone())
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Mailbox {
    /// `None` once draining started
    tx: Option<mpsc::UnboundedSender<Job>>,
    /// Taken by whoever drains
    worker: Option<JoinHandle<()>>,
    /// Queued + running jobs
    depth: Arc<AtomicUsize>,
}

impl Mailbox {
    fn spawn(key: SessionKey) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(key, rx));
        Self {
            tx: Some(tx),
            worker: Some(worker),
            depth,
        }
    }
}

async fn run_worker(key: SessionKey, mut rx: mpsc::UnboundedReceiver<Job>) {
    debug!("Operation worker started for {}", key);

    while let Some(job) = rx.recv().await {
        if let Err(e) = tokio::spawn(job).await {
            if e.is_panic() {
                error!("Queued operation for {} panicked", key);
            } else {
                error!("Queued operation for {} was cancelled", key);
            }
        }
    }

    debug!("Operation worker for {} exited", key);
}

pub struct OperationQueue {
    mailboxes: DashMap<SessionKey, Mailbox>,
    /// Max queued + running jobs per key (0 = unbounded)
    capacity: usize,
    /// Set by [`Self::drain_all`]; no new work is accepted afterwards
    closed: AtomicBool,
}

impl OperationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            mailboxes: DashMap::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Run `job` behind everything already queued for `key` and wait for it.
    pub async fn run<F, T>(&self, key: &SessionKey, job: F) -> Result<T, SftpError>
    where
        F: Future<Output = Result<T, SftpError>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(key, job, true).await
    }

    /// Like [`Self::run`] but not subject to the capacity limit.
    ///
    /// Used for session teardown, which must not be refused by a busy queue.
    pub async fn run_unbounded<F, T>(&self, key: &SessionKey, job: F) -> Result<T, SftpError>
    where
        F: Future<Output = Result<T, SftpError>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(key, job, false).await
    }

    async fn enqueue<F, T>(&self, key: &SessionKey, job: F, bounded: bool) -> Result<T, SftpError>
    where
        F: Future<Output = Result<T, SftpError>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        // Scoped so the map guard is released before awaiting the reply
        {
            let entry = self.mailboxes.entry(key.clone());

            // Checked under the entry lock: drain_all sets the flag before
            // collecting keys, so a mailbox created here is always seen there
            if self.closed.load(Ordering::SeqCst) {
                return Err(SftpError::QueueClosed(key.to_string()));
            }
            let mut mailbox = entry.or_insert_with(|| Mailbox::spawn(key.clone()));

            let restart = match mailbox.tx.as_ref() {
                None => return Err(SftpError::QueueClosed(key.to_string())),
                Some(tx) => tx.is_closed(),
            };
            if restart {
                debug!("Operation worker for {} is gone, restarting", key);
                *mailbox = Mailbox::spawn(key.clone());
            }

            let pending = mailbox.depth.load(Ordering::SeqCst);
            if bounded && self.capacity > 0 && pending >= self.capacity {
                return Err(SftpError::QueueFull {
                    key: key.to_string(),
                    capacity: self.capacity,
                });
            }

            let guard = DepthGuard::new(&mailbox.depth);
            let wrapped: Job = Box::pin(async move {
                let result = job.await;
                drop(guard);
                // Caller may have gone away; nothing to report then
                let _ = reply_tx.send(result);
            });

            let sent = mailbox
                .tx
                .as_ref()
                .is_some_and(|tx| tx.send(wrapped).is_ok());
            if !sent {
                return Err(SftpError::QueueClosed(key.to_string()));
            }
        }

        reply_rx.await.map_err(|_| {
            SftpError::Operation(format!("operation for {} aborted before completing", key))
        })?
    }

    /// Jobs queued or running for `key`
    pub fn pending(&self, key: &SessionKey) -> usize {
        self.mailboxes
            .get(key)
            .map(|m| m.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Stop accepting work for `key` and wait for queued jobs to finish.
    ///
    /// New jobs for `key` fail with `QueueClosed` until the worker has exited
    /// and the mailbox is unregistered. Returns at once when another drain of
    /// the same key is already in progress.
    pub async fn drain(&self, key: &SessionKey) {
        let worker = {
            let Some(mut mailbox) = self.mailboxes.get_mut(key) else {
                return;
            };
            let pending = mailbox.depth.load(Ordering::SeqCst);
            info!("Draining {} queued operation(s) for {}", pending, key);

            // Dropping the sender ends the worker loop once the backlog is done
            mailbox.tx = None;
            mailbox.worker.take()
        };

        let Some(worker) = worker else {
            return;
        };
        if let Err(e) = worker.await {
            error!("Operation worker for {} failed: {}", key, e);
        }
        self.mailboxes.remove_if(key, |_, m| m.tx.is_none());
    }

    /// Refuse all new work, then drain every mailbox.
    pub async fn drain_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for key in self.keys() {
            self.drain(&key).await;
        }
    }

    /// Keys with a live worker
    pub fn keys(&self) -> Vec<SessionKey> {
        self.mailboxes.iter().map(|m| m.key().clone()).collect()
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(0)
    }
}
