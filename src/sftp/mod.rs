//! SFTP module
//!
//! Remote session capability, path resolution and the operation executor.

pub mod error;
pub mod executor;
pub mod path_utils;
pub mod session;
pub mod types;

pub use error::{ErrorKind, SftpError};
pub use executor::{OperationExecutor, PendingOperation, Target};
pub use session::{RemoteSession, SessionConnector, SessionHandle, SftpSession};
pub use types::*;
