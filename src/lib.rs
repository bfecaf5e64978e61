//! Oxide SFTP - reusable SFTP session node
//!
//! Runs file operations (list/get/put/delete/mkdir/rmdir/open/close) against
//! long-lived SFTP sessions shared by many independent requests. Sessions are
//! cached per credential identity and every operation on one identity is
//! serialized through its own queue.

pub mod config;
pub mod node;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigFile, ConfigStorage, CredentialProfile, ManagerConfig, NodeConfig};
pub use node::{OperationRequest, SftpNode};
pub use session::SessionManager;
pub use sftp::{OperationKind, OperationResult, Payload, SftpError};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
///
/// Embedders with their own subscriber should skip this.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
