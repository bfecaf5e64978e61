//! SSH credential identity
//!
//! A [`CredentialIdentity`] is the fully resolved host/port/username/secret
//! tuple used to open (and later reuse) a remote session. It is assembled per
//! request from layered [`CredentialOverlay`]s.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::sftp::SftpError;

/// Authentication methods supported
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication from a key file
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH key authentication from inline key material (OpenSSH/PEM text)
    KeyData {
        private_key: String,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    pub fn key_data(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::KeyData {
            private_key: private_key.into(),
            passphrase,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
            AuthMethod::KeyData { .. } => "key_data",
        }
    }

    fn feed(&self, hasher: &mut Sha256) {
        feed_field(hasher, self.kind());
        match self {
            AuthMethod::Password { password } => feed_field(hasher, password),
            AuthMethod::Key {
                key_path: material,
                passphrase,
            }
            | AuthMethod::KeyData {
                private_key: material,
                passphrase,
            } => {
                feed_field(hasher, material);
                match passphrase {
                    Some(passphrase) => {
                        hasher.update([1u8]);
                        feed_field(hasher, passphrase);
                    }
                    None => hasher.update([0u8]),
                }
            }
        }
    }
}

/// Length-prefixed so adjacent fields cannot shift bytes between each other
fn feed_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

// Secrets never reach logs
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Key { key_path, .. } => f
                .debug_struct("Key")
                .field("key_path", key_path)
                .finish_non_exhaustive(),
            other => write!(f, "{}(<redacted>)", other.kind()),
        }
    }
}

/// Resolved credentials of one remote session
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialIdentity {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,
}

fn default_port() -> u16 {
    22
}

impl CredentialIdentity {
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: AuthMethod::password(password),
        }
    }

    pub fn with_key(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        key_path: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: AuthMethod::key(key_path, passphrase),
        }
    }

    /// Cache/queue key: `user@host:port#fingerprint`.
    ///
    /// The fingerprint covers the auth material, so two identities that only
    /// differ by secret never share a session.
    pub fn key(&self) -> SessionKey {
        let mut hasher = Sha256::new();
        self.auth.feed(&mut hasher);
        let digest = hasher.finalize();
        let fingerprint: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();

        SessionKey(format!(
            "{}@{}:{}#{}",
            self.username, self.host, self.port, fingerprint
        ))
    }

    /// Display name for logs
    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Debug for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIdentity")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Key of one cache entry and its operation queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partially specified credentials.
///
/// Layers are stacked credential store → node configuration → request; the
/// upper layer wins field by field.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Inline private key material
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl CredentialOverlay {
    /// Stack `upper` on top of `self`.
    pub fn layer(&self, upper: &CredentialOverlay) -> CredentialOverlay {
        fn pick<T: Clone>(upper: &Option<T>, lower: &Option<T>) -> Option<T> {
            upper.clone().or_else(|| lower.clone())
        }

        CredentialOverlay {
            host: pick(&upper.host, &self.host),
            port: pick(&upper.port, &self.port),
            username: pick(&upper.username, &self.username),
            password: pick(&upper.password, &self.password),
            private_key: pick(&upper.private_key, &self.private_key),
            key_path: pick(&upper.key_path, &self.key_path),
            passphrase: pick(&upper.passphrase, &self.passphrase),
        }
    }

    /// Turn the stacked values into a full identity.
    ///
    /// Key material is preferred over a password when both are present.
    pub fn resolve(&self) -> Result<CredentialIdentity, SftpError> {
        let host = non_empty(&self.host)
            .ok_or_else(|| SftpError::Resolution("host is not configured".to_string()))?;
        let username = non_empty(&self.username)
            .ok_or_else(|| SftpError::Resolution("username is not configured".to_string()))?;

        let auth = if let Some(private_key) = non_empty(&self.private_key) {
            AuthMethod::key_data(private_key, self.passphrase.clone())
        } else if let Some(key_path) = non_empty(&self.key_path) {
            AuthMethod::key(key_path, self.passphrase.clone())
        } else if let Some(password) = &self.password {
            AuthMethod::password(password.clone())
        } else {
            return Err(SftpError::Resolution(format!(
                "no password or private key configured for {}@{}",
                username, host
            )));
        };

        Ok(CredentialIdentity {
            host,
            port: self.port.unwrap_or_else(default_port),
            username,
            auth,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl fmt::Debug for CredentialOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialOverlay")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}
