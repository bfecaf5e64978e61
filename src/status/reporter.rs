//! StatusReporter
//!
//! Operation status side channel.
//!
//! Pushes connecting / in-progress / terminal phases to subscribers. Each
//! event carries a per-owner `generation`; consumers drop events whose
//! generation is not newer than the last one they saw.
//!
//! A success is cleared after a short delay, but only if nothing newer was
//! emitted for that owner in between. A failure stays until the next
//! operation of the same owner.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::sftp::error::{ErrorKind, SftpError};

/// Subscriber buffer; slow subscribers lag and skip
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Phase of the owner's current (or last) operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum StatusPhase {
    Connecting,
    InProgress { label: String },
    Succeeded,
    Failed { kind: ErrorKind, message: String },
    Cleared,
}

/// One status change
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub owner: String,
    pub generation: u64,
    #[serde(flatten)]
    pub phase: StatusPhase,
    pub at: DateTime<Utc>,
}

struct ReporterState {
    /// owner -> (generation, phase) of the last event; generations start at 1
    current: DashMap<String, (u64, StatusPhase)>,
    tx: broadcast::Sender<StatusEvent>,
    clear_after: Duration,
}

/// Cheap to clone; all clones share subscribers and generations.
#[derive(Clone)]
pub struct StatusReporter {
    state: Arc<ReporterState>,
}

impl StatusReporter {
    pub fn new(clear_after: Duration) -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(ReporterState {
                current: DashMap::new(),
                tx,
                clear_after,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.state.tx.subscribe()
    }

    /// Last phase emitted for `owner`
    pub fn current(&self, owner: &str) -> Option<StatusPhase> {
        self.state.current.get(owner).map(|e| e.value().1.clone())
    }

    pub fn generation(&self, owner: &str) -> u64 {
        self.state.current.get(owner).map(|e| e.value().0).unwrap_or(0)
    }

    pub fn connecting(&self, owner: &str) {
        self.emit(owner, StatusPhase::Connecting);
    }

    pub fn in_progress(&self, owner: &str, label: &str) {
        self.emit(
            owner,
            StatusPhase::InProgress {
                label: label.to_string(),
            },
        );
    }

    pub fn failed(&self, owner: &str, error: &SftpError) {
        self.emit(
            owner,
            StatusPhase::Failed {
                kind: error.kind(),
                message: error.to_string(),
            },
        );
    }

    /// Emit success and schedule the delayed clear.
    pub fn succeeded(&self, owner: &str) {
        let generation = self.emit(owner, StatusPhase::Succeeded);

        let reporter = self.clone();
        let owner = owner.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(reporter.state.clear_after).await;
            reporter.clear_if_current(&owner, generation);
        });
    }

    fn clear_if_current(&self, owner: &str, generation: u64) {
        let Some(mut entry) = self.state.current.get_mut(owner) else {
            return;
        };
        if entry.0 != generation {
            debug!(
                "Status for {} moved on (gen {} -> {}), not clearing",
                owner, generation, entry.0
            );
            return;
        }

        let next = entry.0 + 1;
        *entry = (next, StatusPhase::Cleared);
        self.send(owner, next, StatusPhase::Cleared);
    }

    // Generation bump and store happen under the entry lock so a delayed
    // clear can never interleave with a newer event.
    fn emit(&self, owner: &str, phase: StatusPhase) -> u64 {
        let mut entry = self
            .state
            .current
            .entry(owner.to_string())
            .or_insert((0, StatusPhase::Cleared));

        let generation = entry.0 + 1;
        *entry = (generation, phase.clone());
        self.send(owner, generation, phase);
        generation
    }

    fn send(&self, owner: &str, generation: u64, phase: StatusPhase) {
        let event = StatusEvent {
            owner: owner.to_string(),
            generation,
            phase,
            at: Utc::now(),
        };
        debug!("Status: {:?}", event);
        // No subscribers is fine
        let _ = self.state.tx.send(event);
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}
