//! SSH Client implementation using russh
//!
//! [`SshConnector`] turns a [`CredentialIdentity`] into an authenticated SSH
//! connection with the SFTP subsystem open on it.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, CredentialIdentity};
use super::error::SshError;
use crate::sftp::{SessionConnector, SessionHandle, SftpError, SftpSession};

/// Transport tuning for [`SshConnector`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConnectorConfig {
    /// Connection timeout in seconds (handshake + authentication)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Keepalive interval in seconds (0 disables)
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Accepted host key fingerprints (`SHA256:...`). Empty accepts any key.
    #[serde(default)]
    pub trusted_fingerprints: Vec<String>,
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

impl Default for SshConnectorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            keepalive_secs: default_keepalive(),
            trusted_fingerprints: Vec::new(),
        }
    }
}

/// Opens russh-sftp sessions
pub struct SshConnector {
    config: SshConnectorConfig,
}

impl SshConnector {
    pub fn new(config: SshConnectorConfig) -> Self {
        Self { config }
    }

    /// Connect and authenticate, returning the SSH handle
    pub async fn connect_ssh(
        &self,
        identity: &CredentialIdentity,
    ) -> Result<client::Handle<ClientHandler>, SshError> {
        let addr = format!("{}:{}", identity.host, identity.port);

        info!("Connecting to SSH server at {}", addr);

        // Resolve address
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Resolve {
                host: addr.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| SshError::Resolve {
                host: addr.clone(),
                reason: "no address found".to_string(),
            })?;

        let keepalive_interval =
            (self.config.keepalive_secs > 0).then(|| Duration::from_secs(self.config.keepalive_secs));
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval,
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            identity.host.clone(),
            identity.port,
            self.config.trusted_fingerprints.clone(),
        );

        let secs = self.config.timeout_secs;
        let timeout = Duration::from_secs(secs);

        // Connect with timeout
        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection", secs))??;

        debug!("SSH handshake completed");

        let authenticated = tokio::time::timeout(timeout, authenticate(&mut handle, identity))
            .await
            .map_err(|_| SshError::Timeout("Authentication", secs))??;

        if !authenticated {
            return Err(SshError::AuthenticationFailed {
                user: identity.username.clone(),
                reason: "rejected by server".to_string(),
            });
        }

        info!("SSH authentication successful for {}", identity.display_name());
        Ok(handle)
    }
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    identity: &CredentialIdentity,
) -> Result<bool, SshError> {
    let result = match &identity.auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(&identity.username, password)
            .await
            .map_err(|e| rejected(identity, e))?,
        AuthMethod::Key {
            key_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            handle
                .authenticate_publickey(&identity.username, key_with_hash)
                .await
                .map_err(|e| rejected(identity, e))?
        }
        AuthMethod::KeyData {
            private_key,
            passphrase,
        } => {
            let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            handle
                .authenticate_publickey(&identity.username, key_with_hash)
                .await
                .map_err(|e| rejected(identity, e))?
        }
    };

    Ok(result.success())
}

fn rejected(identity: &CredentialIdentity, err: russh::Error) -> SshError {
    SshError::AuthenticationFailed {
        user: identity.username.clone(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, identity: &CredentialIdentity) -> Result<SessionHandle, SftpError> {
        let handle = self.connect_ssh(identity).await?;
        let session = SftpSession::open(handle).await?;
        Ok(Arc::new(session))
    }
}

/// SHA256 fingerprint of a public key, OpenSSH style
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Client handler for russh callbacks (host key verification)
pub struct ClientHandler {
    host: String,
    port: u16,
    /// Pinned fingerprints; empty means trust on every use
    trusted: Vec<String>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, trusted: Vec<String>) -> Self {
        Self {
            host,
            port,
            trusted,
        }
    }

    fn accepts(&self, fingerprint: &str) -> bool {
        self.trusted.is_empty() || self.trusted.iter().any(|t| t == fingerprint)
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = fingerprint(server_public_key);

        if !self.accepts(&fingerprint) {
            warn!(
                "Host key for {}:{} not trusted (fingerprint: {})",
                self.host, self.port, fingerprint
            );
            return Err(SshError::UntrustedHostKey {
                host: format!("{}:{}", self.host, self.port),
                fingerprint,
            });
        }

        if self.trusted.is_empty() {
            debug!(
                "Accepting host key for {}:{} without pinning (fingerprint: {})",
                self.host, self.port, fingerprint
            );
        } else {
            info!("Host key verified for {}:{}", self.host, self.port);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_config_defaults() {
        let config: SshConnectorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.keepalive_secs, 30);
        assert!(config.trusted_fingerprints.is_empty());
    }

    #[test]
    fn test_host_key_pinning() {
        let open = ClientHandler::new("h".into(), 22, vec![]);
        assert!(open.accepts("SHA256:anything"));

        let pinned = ClientHandler::new("h".into(), 22, vec!["SHA256:abc".into()]);
        assert!(pinned.accepts("SHA256:abc"));
        assert!(!pinned.accepts("SHA256:def"));
    }
}
