//! Logging setup
//!
//! Environment: `RUST_LOG` (filter, default `info`), `LSM_LOG_FILE`,
//! `LSM_LOG_UNIQUE=true` (pid in the file name), `LSM_LOG_JSON=true`.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_ENV: &str = "LSM_LOG_FILE";
pub const LOG_UNIQUE_ENV: &str = "LSM_LOG_UNIQUE";
pub const LOG_JSON_ENV: &str = "LSM_LOG_JSON";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive (e.g. "debug", "lsp_session_manager=trace")
    pub level: String,
    /// Log to this file instead of stderr
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let unique = lookup(LOG_UNIQUE_ENV).as_deref() == Some("true");
        let file_path = lookup(LOG_FILE_ENV).map(|path| {
            let path = PathBuf::from(path);
            if unique {
                with_pid(&path, std::process::id())
            } else {
                path
            }
        });
        let json_format = lookup(LOG_JSON_ENV).as_deref() == Some("true");

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// `server.log` -> `server.<pid>.log`
fn with_pid(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let file_name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(extension) if !extension.is_empty() => {
            format!("{}.{}.{}", stem.to_string_lossy(), pid, extension)
        }
        _ => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(file_name)
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new().create(true).append(true).open(file_path)?;
            subscriber
                .with(fmt::layer().json().with_writer(file).with_ansi(false))
                .try_init()?;
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new().create(true).append(true).open(file_path)?;
            subscriber
                .with(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true),
                )
                .try_init()?;
        }
        (None, true) => {
            subscriber
                .with(fmt::layer().json().with_writer(io::stderr).with_ansi(false))
                .try_init()?;
        }
        (None, false) => {
            subscriber
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(true)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true),
                )
                .try_init()?;
        }
    }

    Ok(())
}

/// One-line structured event for a protocol message
#[macro_export]
macro_rules! log_lsp_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            data = ?$data,
            pid = std::process::id(),
            "LSP message"
        );
    };
}

/// One-line structured event for an operation's duration
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}
