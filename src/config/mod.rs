//! Configuration Management Module
//!
//! Credential profiles, node definitions and manager tuning, persisted as JSON.

pub mod storage;
pub mod types;

pub use storage::{config_dir, sftp_config_file, ConfigStorage, StorageError};
pub use types::{ConfigFile, CredentialProfile, ManagerConfig, NodeConfig, CONFIG_VERSION};
