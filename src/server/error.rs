//! Error types for session management
//!
//! `SessionError` is what registry and dispatcher callers see; it wraps the
//! lower layers and adds the lifecycle failures of a single session attempt.

use std::io;

use crate::io::process::ProcessError;
use crate::lsp::LspError;
use crate::lsp::protocol::JsonRpcError;

// ============================================================================
// Session Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No interpreter / server entry point could be resolved for the workspace
    #[error("No valid interpreter found for workspace {workspace}")]
    NoValidInterpreter { workspace: String },

    /// Connecting to the server endpoint failed
    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectionFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The initialize exchange was rejected or the connection died during it
    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Invalid session state: current={current}, expected={expected}")]
    InvalidState { current: String, expected: String },

    #[error("No workspace folder owns {resource}")]
    UnknownWorkspace { resource: String },

    #[error("Session startup failed: {reason}")]
    StartupFailed { reason: String },

    #[error("Session shutdown failed: {reason}")]
    ShutdownFailed { reason: String },

    /// The session has no live client (stopped or never started)
    #[error("Session has no active client")]
    ClientUnavailable,

    /// A forwarded request failed
    #[error("Request {method} failed: {source}")]
    Request {
        method: String,
        #[source]
        source: LspError,
    },

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            reason: reason.into(),
        }
    }

    pub fn shutdown_failed(reason: impl Into<String>) -> Self {
        Self::ShutdownFailed {
            reason: reason.into(),
        }
    }

    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(current: impl std::fmt::Debug, expected: impl Into<String>) -> Self {
        Self::InvalidState {
            current: format!("{current:?}"),
            expected: expected.into(),
        }
    }

    pub fn request(method: &str, source: LspError) -> Self {
        Self::Request {
            method: method.to_string(),
            source,
        }
    }

    /// Whether this error is a cancelled request rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Request {
                source: LspError::JsonRpc(JsonRpcError::RequestCancelled),
                ..
            }
        )
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Invalid path: {path} - {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid URI: {uri} - {reason}")]
    InvalidUri { uri: String, reason: String },
}

impl ConfigError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
