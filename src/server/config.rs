//! Server configuration
//!
//! Transport modes, per-workspace server settings and the configuration
//! provider collaborator that hands them out.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::server::error::ConfigError;
use crate::workspace::folders::{WorkspaceFolder, WorkspaceKey};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Well-known TCP port of the language server; a configured port of 0 maps here
pub const DEFAULT_TCP_PORT: u16 = 6610;

/// Host used for every socket connection
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Handshake polling budget: attempts
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 1000;

/// Handshake polling budget: interval between attempts (10s total with the default attempts)
pub const DEFAULT_HANDSHAKE_INTERVAL_MS: u64 = 10;

/// Attempts to reach a server we launched ourselves (pipe / launched socket)
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 50;

pub const DEFAULT_CONNECT_INTERVAL_MS: u64 = 100;

/// Bound on the `shutdown` request during a deliberate stop
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Interpreter used when neither CLI nor environment name one
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Flags placed before the server entry point: unbuffered output, UTF-8 mode
pub const BOOTSTRAP_FLAGS: &[&str] = &["-u", "-X", "utf8"];

/// Extra flag of the debug argument variant, right after the entry point
pub const DEBUG_LOG_FLAG: &str = "--log";

// ============================================================================
// Transport Mode
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Stdio,
    Pipe,
    Socket,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Stdio => "stdio",
            TransportMode::Pipe => "pipe",
            TransportMode::Socket => "socket",
        }
    }

    /// Server command-line flag selecting this mode
    pub fn flag(&self) -> &'static str {
        match self {
            TransportMode::Stdio => "--stdio",
            TransportMode::Pipe => "--pipe",
            TransportMode::Socket => "--socket",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "pipe" => Ok(TransportMode::Pipe),
            "socket" | "tcp" => Ok(TransportMode::Socket),
            other => Err(ConfigError::InvalidSetting(format!(
                "unknown transport mode '{other}', expected stdio, pipe or socket"
            ))),
        }
    }
}

// ============================================================================
// Server Settings
// ============================================================================

/// Settings for the server of one workspace root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub mode: TransportMode,

    /// Port of an already-running server in socket mode; 0 means the default
    pub tcp_port: u16,

    /// Socket mode only: launch the server on an ephemeral port instead of
    /// connecting to one that is already running
    pub launch_server: bool,

    /// Appended after every generated argument
    pub extra_args: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            mode: TransportMode::Stdio,
            tcp_port: DEFAULT_TCP_PORT,
            launch_server: false,
            extra_args: Vec::new(),
        }
    }
}

impl ServerSettings {
    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    pub fn with_launch_server(mut self, launch: bool) -> Self {
        self.launch_server = launch;
        self
    }

    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn effective_port(&self) -> u16 {
        match self.tcp_port {
            0 => DEFAULT_TCP_PORT,
            port => port,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.extra_args.iter().any(|arg| arg.trim().is_empty()) {
            return Err(ConfigError::InvalidSetting(
                "extraArgs must not contain empty arguments".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Configuration Provider
// ============================================================================

/// Read-only source of per-workspace server settings
pub trait ConfigurationProvider: Send + Sync {
    fn settings_for(&self, folder: &WorkspaceFolder) -> ServerSettings;
}

/// Fixed settings: one default plus per-workspace overrides
///
/// JSON shape: `{"default": {...}, "workspaces": {"file:///root": {...}}}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticConfiguration {
    #[serde(default)]
    default: ServerSettings,

    #[serde(default)]
    workspaces: HashMap<String, ServerSettings>,
}

impl StaticConfiguration {
    pub fn new(default: ServerSettings) -> Self {
        Self {
            default,
            workspaces: HashMap::new(),
        }
    }

    pub fn with_workspace(mut self, key: &WorkspaceKey, settings: ServerSettings) -> Self {
        self.workspaces.insert(key.as_str().to_string(), settings);
        self
    }

    pub fn default_settings(&self) -> &ServerSettings {
        &self.default
    }

    pub fn default_settings_mut(&mut self) -> &mut ServerSettings {
        &mut self.default
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: StaticConfiguration = serde_json::from_str(json)?;
        raw.default.validate()?;

        let mut workspaces = HashMap::with_capacity(raw.workspaces.len());
        for (uri, settings) in raw.workspaces {
            settings.validate()?;
            workspaces.insert(WorkspaceKey::parse(&uri)?.as_str().to_string(), settings);
        }

        Ok(Self {
            default: raw.default,
            workspaces,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }
}

impl ConfigurationProvider for StaticConfiguration {
    fn settings_for(&self, folder: &WorkspaceFolder) -> ServerSettings {
        self.workspaces
            .get(folder.key().as_str())
            .unwrap_or(&self.default)
            .clone()
    }
}

/// Timing knobs of session startup and teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_interval: Duration::from_millis(DEFAULT_CONNECT_INTERVAL_MS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}
