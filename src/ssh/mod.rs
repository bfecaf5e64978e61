//! SSH module - credentials and the russh transport
//!
//! This module provides the SSH side of remote sessions using the russh
//! library.
//!
//! # Features
//! - Password, key file and inline key authentication
//! - Layered credential resolution (store → node → request)
//! - Host key pinning by SHA256 fingerprint

mod client;
mod config;
mod error;

pub use client::{fingerprint, ClientHandler, SshConnector, SshConnectorConfig};
pub use config::{AuthMethod, CredentialIdentity, CredentialOverlay, SessionKey};
pub use error::SshError;
