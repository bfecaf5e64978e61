//! SFTP node
//!
//! A configured entry point: binds a [`NodeConfig`] and its credential
//! profile, merges per-request overrides, and hands the resulting
//! [`PendingOperation`] to the [`SessionManager`].

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ConfigFile, CredentialProfile, NodeConfig};
use crate::session::SessionManager;
use crate::sftp::{OperationKind, OperationResult, Payload, PendingOperation, PutOptions, SftpError};
use crate::ssh::CredentialOverlay;
use crate::status::StatusPhase;

/// One request; unset fields fall back to the node configuration
#[derive(Debug, Default)]
pub struct OperationRequest {
    pub operation: Option<String>,
    pub workdir: Option<String>,
    pub filename: Option<String>,
    pub payload: Payload,
    /// Highest-precedence credential values
    pub credentials: CredentialOverlay,
    pub keep_connection: Option<bool>,
    pub payload_as_path: Option<bool>,
    pub put: Option<PutOptions>,
}

impl OperationRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
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

    pub fn credentials(mut self, credentials: CredentialOverlay) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn keep_connection(mut self, keep: bool) -> Self {
        self.keep_connection = Some(keep);
        self
    }
}

pub struct SftpNode {
    config: NodeConfig,
    /// Credential profile with the node's inline values on top
    credentials: CredentialOverlay,
    manager: Arc<SessionManager>,
}

impl SftpNode {
    /// Bind `config` to its credential profile.
    ///
    /// Fails when the referenced profile does not exist, or when the node
    /// names no credentials at all.
    pub fn new(
        config: NodeConfig,
        profiles: &[CredentialProfile],
        manager: Arc<SessionManager>,
    ) -> Result<Self, SftpError> {
        let store = match &config.credential {
            Some(name) => profiles
                .iter()
                .find(|p| &p.name == name)
                .map(|p| p.overlay.clone())
                .ok_or_else(|| {
                    SftpError::Resolution(format!(
                        "node '{}' references unknown credential '{}'",
                        config.name, name
                    ))
                })?,
            None if config.credentials == CredentialOverlay::default() => {
                return Err(SftpError::Resolution(format!(
                    "node '{}' has no credentials configured",
                    config.name
                )));
            }
            None => CredentialOverlay::default(),
        };

        let credentials = store.layer(&config.credentials);
        info!("SFTP node '{}' ready ({})", config.name, config.operation);

        Ok(Self {
            config,
            credentials,
            manager,
        })
    }

    /// Build the node named `name` from a loaded configuration file.
    pub fn from_config(
        file: &ConfigFile,
        name: &str,
        manager: Arc<SessionManager>,
    ) -> Result<Self, SftpError> {
        let config = file
            .node(name)
            .cloned()
            .ok_or_else(|| SftpError::Resolution(format!("node '{}' is not configured", name)))?;
        Self::new(config, &file.credentials, manager)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Last status of this node
    pub fn status(&self) -> Option<StatusPhase> {
        self.manager.status().current(&self.config.name)
    }

    /// Handle one request. The returned future resolving is the completion
    /// signal.
    pub async fn handle(&self, request: OperationRequest) -> Result<OperationResult, SftpError> {
        let op = match self.prepare(request) {
            Ok(op) => op,
            Err(e) => {
                self.manager.status().failed(&self.config.name, &e);
                return Err(e);
            }
        };

        debug!("Node '{}' submitting {}", self.config.name, op.kind);
        self.manager.submit(op).await
    }

    /// Let queued work finish and close this node's cached session.
    pub async fn close(&self) -> bool {
        match self.credentials.resolve() {
            Ok(identity) => {
                info!("Closing SFTP node '{}'", self.config.name);
                self.manager.close(&identity).await
            }
            // Only per-request credentials; nothing of ours can be cached
            Err(_) => false,
        }
    }

    fn prepare(&self, request: OperationRequest) -> Result<PendingOperation, SftpError> {
        let operation = request
            .operation
            .as_deref()
            .unwrap_or(&self.config.operation);
        let kind: OperationKind = operation.parse()?;

        let identity = self.credentials.layer(&request.credentials).resolve()?;

        Ok(PendingOperation {
            kind,
            owner: self.config.name.clone(),
            identity,
            workdir: request.workdir.or_else(|| self.config.workdir.clone()),
            filename: request.filename.or_else(|| self.config.filename.clone()),
            payload: request.payload,
            persist: request.keep_connection.unwrap_or(self.config.keep_connection),
            payload_as_path: request
                .payload_as_path
                .unwrap_or(self.config.payload_as_path),
            put_options: request.put.unwrap_or(self.config.put),
        })
    }
}
