//! Transport factory and connectors
//!
//! [`TransportFactory`] turns a workspace's settings into a
//! [`ConnectionDescriptor`]: how to launch the server and how to reach it.
//! A [`Connector`] turns that descriptor into a live [`Connection`].

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::io::process::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, ProcessStdio,
    StderrMonitor, StopMode,
};
use crate::io::transport::{BoxedTransport, StreamTransport};
use crate::server::config::{
    BOOTSTRAP_FLAGS, DEBUG_LOG_FLAG, LOOPBACK_HOST, ServerSettings, SessionTimings, TransportMode,
};
use crate::server::error::SessionError;
use crate::server::output::OutputSink;
use crate::server::resolver::{ExecutableResolver, ServerCommand};
use crate::workspace::folders::WorkspaceFolder;

// ============================================================================
// Connection Descriptors
// ============================================================================

/// Where the client talks to a launched server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerChannel {
    Stdio,
    /// Unix domain socket path or Windows named pipe name
    Pipe { endpoint: String },
    Socket { addr: SocketAddr },
}

/// Everything needed to spawn the server for one workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLaunch {
    pub command: String,
    pub run_args: Vec<String>,
    /// Same as `run_args` plus the logging flag
    pub debug_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub channel: ServerChannel,
}

impl ServerLaunch {
    pub fn args(&self, debug: bool) -> &[String] {
        if debug {
            &self.debug_args
        } else {
            &self.run_args
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    /// Spawn a server process, then talk to it over `channel`
    Launch(ServerLaunch),
    /// Connect to a server that is already listening
    Socket { addr: SocketAddr },
}

impl ConnectionDescriptor {
    pub fn mode(&self) -> TransportMode {
        match self {
            ConnectionDescriptor::Launch(launch) => match launch.channel {
                ServerChannel::Stdio => TransportMode::Stdio,
                ServerChannel::Pipe { .. } => TransportMode::Pipe,
                ServerChannel::Socket { .. } => TransportMode::Socket,
            },
            ConnectionDescriptor::Socket { .. } => TransportMode::Socket,
        }
    }

    /// Human-readable endpoint for logs and errors
    pub fn endpoint(&self) -> String {
        match self {
            ConnectionDescriptor::Launch(launch) => match &launch.channel {
                ServerChannel::Stdio => format!("{} (stdio)", launch.command),
                ServerChannel::Pipe { endpoint } => endpoint.clone(),
                ServerChannel::Socket { addr } => addr.to_string(),
            },
            ConnectionDescriptor::Socket { addr } => addr.to_string(),
        }
    }
}

// ============================================================================
// Transport Factory
// ============================================================================

/// Builds connection descriptors from workspace settings
pub struct TransportFactory {
    resolver: Arc<dyn ExecutableResolver>,
}

impl TransportFactory {
    pub fn new(resolver: Arc<dyn ExecutableResolver>) -> Self {
        Self { resolver }
    }

    /// Build the descriptor for `folder`
    ///
    /// Endpoints the client will connect to (pipe names, ephemeral ports) are
    /// chosen here, before the server is spawned.
    pub fn build(
        &self,
        folder: &WorkspaceFolder,
        settings: &ServerSettings,
    ) -> Result<ConnectionDescriptor, SessionError> {
        if settings.mode == TransportMode::Socket && !settings.launch_server {
            let addr = loopback(settings.effective_port())?;
            debug!("Workspace {} connects to running server at {}", folder.name, addr);
            return Ok(ConnectionDescriptor::Socket { addr });
        }

        let command = self
            .resolver
            .resolve(folder)
            .ok_or_else(|| SessionError::NoValidInterpreter {
                workspace: folder.name.clone(),
            })?;

        let (channel, mode_args) = match settings.mode {
            TransportMode::Stdio => (ServerChannel::Stdio, vec![TransportMode::Stdio.flag().to_string()]),
            TransportMode::Pipe => {
                let endpoint = pipe_endpoint();
                let args = vec![TransportMode::Pipe.flag().to_string(), endpoint.clone()];
                (ServerChannel::Pipe { endpoint }, args)
            }
            TransportMode::Socket => {
                let port = pick_ephemeral_port().map_err(|source| SessionError::ConnectionFailed {
                    endpoint: format!("{LOOPBACK_HOST}:0"),
                    source,
                })?;
                let addr = loopback(port)?;
                let args = vec![TransportMode::Socket.flag().to_string(), port.to_string()];
                (ServerChannel::Socket { addr }, args)
            }
        };

        Ok(ConnectionDescriptor::Launch(ServerLaunch {
            run_args: server_args(&command, false, &mode_args, &settings.extra_args),
            debug_args: server_args(&command, true, &mode_args, &settings.extra_args),
            command: command.interpreter,
            working_dir: folder.path(),
            channel,
        }))
    }
}

/// Bootstrap flags, entry point, optional log flag, mode flags, extra args last
fn server_args(
    command: &ServerCommand,
    debug: bool,
    mode_args: &[String],
    extra_args: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = BOOTSTRAP_FLAGS.iter().map(|f| f.to_string()).collect();
    args.push(command.entry_point.to_string_lossy().into_owned());
    if debug {
        args.push(DEBUG_LOG_FLAG.to_string());
    }
    args.extend(mode_args.iter().cloned());
    args.extend(extra_args.iter().cloned());
    args
}

fn loopback(port: u16) -> Result<SocketAddr, SessionError> {
    format!("{LOOPBACK_HOST}:{port}")
        .parse()
        .map_err(|e| SessionError::startup_failed(format!("invalid loopback address: {e}")))
}

/// Ask the OS for a free loopback port; the probe listener is released
/// before the server binds it
pub fn pick_ephemeral_port() -> io::Result<u16> {
    let listener = TcpListener::bind((LOOPBACK_HOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Fresh, unique endpoint name for pipe mode
pub fn pipe_endpoint() -> String {
    let name = format!("lsp-session-{}", uuid::Uuid::new_v4().simple());
    if cfg!(windows) {
        format!(r"\\.\pipe\{name}")
    } else {
        std::env::temp_dir()
            .join(format!("{name}.sock"))
            .to_string_lossy()
            .into_owned()
    }
}

// ============================================================================
// Connectors
// ============================================================================

/// A live connection: the transport plus the server process, if we own one
pub struct Connection {
    pub transport: BoxedTransport,
    pub process: Option<ChildProcessManager>,
}

/// Per-attempt connection options
#[derive(Clone)]
pub struct ConnectOptions {
    /// Select the debug argument variant
    pub debug: bool,
    pub timings: SessionTimings,
    /// Receives server stderr and process exit notes
    pub output: Arc<dyn OutputSink>,
}

/// Turns a descriptor into a live connection
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        options: &ConnectOptions,
    ) -> Result<Connection, SessionError>;
}

/// Production connector: spawns processes and opens real sockets and pipes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessConnector;

/// Reports child exits to the session's output sink
struct SinkExitReporter {
    output: Arc<dyn OutputSink>,
}

#[async_trait]
impl ProcessExitHandler for SinkExitReporter {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        let line = match (event.pid, event.code) {
            (Some(pid), Some(code)) => format!("Server process {pid} exited with code {code}"),
            (Some(pid), None) => format!("Server process {pid} terminated by signal"),
            (None, _) => "Server process exited".to_string(),
        };
        self.output.append_line(&line);
    }
}

impl ProcessConnector {
    async fn launch(
        &self,
        launch: &ServerLaunch,
        options: &ConnectOptions,
    ) -> Result<Connection, SessionError> {
        let stdio = match launch.channel {
            ServerChannel::Stdio => ProcessStdio::Transport,
            _ => ProcessStdio::Detached,
        };
        let mut process = ChildProcessManager::new(
            launch.command.clone(),
            launch.args(options.debug).to_vec(),
            launch.working_dir.clone(),
        )
        .with_stdio(stdio);

        let output = Arc::clone(&options.output);
        process.on_stderr_line(move |line| output.append_line(&line));
        process.on_exit(Arc::new(SinkExitReporter {
            output: Arc::clone(&options.output),
        }));

        options
            .output
            .append_line(&format!("Starting server: {}", process.command_line()));
        process.start().await?;

        let attempts = options.timings.connect_attempts;
        let interval = options.timings.connect_interval;
        let transport: Result<BoxedTransport, SessionError> = match &launch.channel {
            ServerChannel::Stdio => process
                .create_stdio_transport()
                .map(|t| Box::new(t) as BoxedTransport)
                .map_err(SessionError::from),
            ServerChannel::Pipe { endpoint } => {
                connect_with_retry(endpoint, attempts, interval, || open_pipe(endpoint)).await
            }
            ServerChannel::Socket { addr } => {
                connect_with_retry(&addr.to_string(), attempts, interval, || async move {
                    TcpStream::connect(*addr)
                        .await
                        .map(|s| Box::new(StreamTransport::from_stream(s)) as BoxedTransport)
                })
                .await
            }
        };

        match transport {
            Ok(transport) => Ok(Connection {
                transport,
                process: Some(process),
            }),
            Err(e) => {
                warn!("Could not reach launched server: {}", e);
                if let Err(stop_error) = process.stop(StopMode::Force).await {
                    debug!("Server process already gone: {}", stop_error);
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        options: &ConnectOptions,
    ) -> Result<Connection, SessionError> {
        match descriptor {
            ConnectionDescriptor::Launch(launch) => self.launch(launch, options).await,
            ConnectionDescriptor::Socket { addr } => {
                info!("Connecting to running server at {}", addr);
                let stream = TcpStream::connect(*addr).await.map_err(|source| {
                    SessionError::ConnectionFailed {
                        endpoint: addr.to_string(),
                        source,
                    }
                })?;
                Ok(Connection {
                    transport: Box::new(StreamTransport::from_stream(stream)),
                    process: None,
                })
            }
        }
    }
}

/// Retry `open` until it succeeds or the attempt budget is spent
async fn connect_with_retry<F, Fut>(
    endpoint: &str,
    attempts: u32,
    interval: Duration,
    mut open: F,
) -> Result<BoxedTransport, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<BoxedTransport>>,
{
    let mut last_error = io::Error::new(io::ErrorKind::NotConnected, "no connection attempt made");

    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match open().await {
            Ok(transport) => {
                debug!("Connected to {} after {} attempt(s)", endpoint, attempt);
                return Ok(transport);
            }
            Err(e) => {
                debug!("Connection attempt {} to {} failed: {}", attempt, endpoint, e);
                last_error = e;
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    Err(SessionError::ConnectionFailed {
        endpoint: endpoint.to_string(),
        source: last_error,
    })
}

#[cfg(unix)]
async fn open_pipe(endpoint: &str) -> io::Result<BoxedTransport> {
    let stream = tokio::net::UnixStream::connect(endpoint).await?;
    Ok(Box::new(StreamTransport::from_stream(stream)))
}

#[cfg(windows)]
async fn open_pipe(endpoint: &str) -> io::Result<BoxedTransport> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)?;
    Ok(Box::new(StreamTransport::from_stream(client)))
}
