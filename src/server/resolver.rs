//! Executable resolution
//!
//! Decides which interpreter runs the server and which entry point it runs,
//! per workspace root.

use std::path::PathBuf;

use crate::server::config::DEFAULT_INTERPRETER;
use crate::workspace::folders::WorkspaceFolder;

/// Environment variable naming the interpreter
pub const INTERPRETER_ENV: &str = "LSM_INTERPRETER";

/// Environment variable naming the server entry point
pub const SERVER_ENTRY_ENV: &str = "LSM_SERVER_ENTRY";

/// Resolved server invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub interpreter: String,
    pub entry_point: PathBuf,
}

/// Resolves the server invocation for a workspace; `None` means no usable
/// interpreter is available
pub trait ExecutableResolver: Send + Sync {
    fn resolve(&self, folder: &WorkspaceFolder) -> Option<ServerCommand>;
}

/// Same invocation for every workspace
#[derive(Debug, Clone)]
pub struct StaticExecutableResolver {
    interpreter: String,
    entry_point: Option<PathBuf>,
}

impl StaticExecutableResolver {
    pub fn new(interpreter: impl Into<String>, entry_point: Option<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            entry_point,
        }
    }

    /// CLI value > environment variable > default, for both parts
    pub fn from_env(interpreter: Option<String>, entry_point: Option<PathBuf>) -> Self {
        Self::from_sources(
            interpreter,
            std::env::var(INTERPRETER_ENV).ok(),
            entry_point,
            std::env::var_os(SERVER_ENTRY_ENV).map(PathBuf::from),
        )
    }

    fn from_sources(
        cli_interpreter: Option<String>,
        env_interpreter: Option<String>,
        cli_entry: Option<PathBuf>,
        env_entry: Option<PathBuf>,
    ) -> Self {
        let interpreter = cli_interpreter
            .or(env_interpreter)
            .filter(|i| !i.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());
        let entry_point = cli_entry
            .or(env_entry)
            .filter(|p| !p.as_os_str().is_empty());

        Self::new(interpreter, entry_point)
    }
}

impl ExecutableResolver for StaticExecutableResolver {
    fn resolve(&self, _folder: &WorkspaceFolder) -> Option<ServerCommand> {
        self.entry_point.as_ref().map(|entry_point| ServerCommand {
            interpreter: self.interpreter.clone(),
            entry_point: entry_point.clone(),
        })
    }
}
