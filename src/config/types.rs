//! Configuration types
//!
//! Serialized as JSON (see [`super::ConfigStorage`]).

use serde::{Deserialize, Serialize};

use crate::sftp::PutOptions;
use crate::ssh::{CredentialOverlay, SshConnectorConfig};

/// Current configuration file version
pub const CONFIG_VERSION: u32 = 1;

/// Root configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Config format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Named credential profiles
    #[serde(default)]
    pub credentials: Vec<CredentialProfile>,

    /// Node definitions
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub manager: ManagerConfig,

    /// SSH transport settings
    #[serde(default)]
    pub ssh: SshConnectorConfig,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            credentials: Vec::new(),
            nodes: Vec::new(),
            manager: ManagerConfig::default(),
            ssh: SshConnectorConfig::default(),
        }
    }
}

impl ConfigFile {
    pub fn credential(&self, name: &str) -> Option<&CredentialProfile> {
        self.credentials.iter().find(|c| c.name == name)
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Add or replace a credential profile by name
    pub fn upsert_credential(&mut self, profile: CredentialProfile) {
        match self.credentials.iter_mut().find(|c| c.name == profile.name) {
            Some(existing) => *existing = profile,
            None => self.credentials.push(profile),
        }
    }

    /// Add or replace a node by name
    pub fn upsert_node(&mut self, node: NodeConfig) {
        match self.nodes.iter_mut().find(|n| n.name == node.name) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }
}

/// A named, reusable set of connection credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialProfile {
    pub name: String,

    #[serde(flatten)]
    pub overlay: CredentialOverlay,
}

impl CredentialProfile {
    pub fn new(name: impl Into<String>, overlay: CredentialOverlay) -> Self {
        Self {
            name: name.into(),
            overlay,
        }
    }
}

/// Configuration of one SFTP node; every field can be overridden per request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, also the status owner id
    pub name: String,

    /// Default operation (list/get/put/delete/mkdir/rmdir/open/close)
    #[serde(default = "default_operation")]
    pub operation: String,

    /// Default working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Default file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Name of a [`CredentialProfile`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Keep the session cached between requests
    #[serde(default)]
    pub keep_connection: bool,

    /// Let a string payload stand in for the path of list/get/delete/mkdir/rmdir
    #[serde(default = "default_true")]
    pub payload_as_path: bool,

    #[serde(default)]
    pub put: PutOptions,

    /// Inline credential values layered over the profile
    #[serde(default)]
    pub credentials: CredentialOverlay,
}

fn default_operation() -> String {
    "list".to_string()
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            workdir: None,
            filename: None,
            credential: None,
            keep_connection: false,
            payload_as_path: true,
            put: PutOptions::default(),
            credentials: CredentialOverlay::default(),
        }
    }
}

/// Session manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound for establishing a session, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Max queued + running operations per identity (0 = unbounded)
    #[serde(default)]
    pub queue_capacity: usize,

    /// Delay before a success status is cleared, in milliseconds
    #[serde(default = "default_status_clear_ms")]
    pub status_clear_ms: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_status_clear_ms() -> u64 {
    1000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            queue_capacity: 0,
            status_clear_ms: default_status_clear_ms(),
        }
    }
}
