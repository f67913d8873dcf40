//! Process management layer
//!
//! Handles external process lifecycle and output monitoring,
//! completely separate from transport concerns.

use crate::io::transport::StreamTransport;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
// warn! is used in Windows-specific code blocks
#[allow(unused_imports)]
use tracing::{error, info, trace, warn};

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Try graceful shutdown first (SIGTERM)
    Graceful,
    /// Force kill immediately (SIGKILL)
    Force,
}

/// How the child's standard streams are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStdio {
    /// stdin/stdout carry the protocol and become a transport
    Transport,
    /// The protocol runs over another channel; stdin is closed and stdout is
    /// drained into the output handler alongside stderr
    Detached,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    Stopped,
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired when the process exits, for whatever reason
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    pub pid: Option<u32>,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
}

/// Trait for handling process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Output Monitoring Trait
// ============================================================================

/// Trait for monitoring diagnostic output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for output lines
    ///
    /// Only one handler can be active at a time. Monitoring starts when the
    /// process starts; lines are drained even without a handler.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(&mut self) -> Result<(), Self::Error>;

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    fn is_running(&self) -> bool;

    /// Take the stdio transport for communicating with the process
    fn create_stdio_transport(&mut self) -> Result<StreamTransport, Self::Error>;

    /// Synchronous force kill for Drop implementations
    fn kill_sync(&mut self);
}

type LineHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Manages child processes spawned via Command
pub struct ChildProcessManager {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    stdio: ProcessStdio,

    /// Thread-safe process state
    state: Arc<Mutex<ProcessState>>,

    /// Stdio transport (created when process starts in `ProcessStdio::Transport`)
    stdio_transport: Option<StreamTransport>,

    output_handler: Option<LineHandler>,
    output_tasks: Vec<JoinHandle<()>>,

    /// Waits for the child to exit
    wait_task: Option<JoinHandle<()>>,

    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            args,
            working_directory: working_dir,
            stdio: ProcessStdio::Transport,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            output_handler: None,
            output_tasks: Vec::new(),
            wait_task: None,
            exit_handler: None,
        }
    }

    pub fn with_stdio(mut self, stdio: ProcessStdio) -> Self {
        self.stdio = stdio;
        self
    }

    /// Install a handler fired once when the child exits
    pub fn on_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn get_state(&self) -> ProcessState {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, new_state: ProcessState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = new_state;
    }

    /// Drain a child output pipe line by line, forwarding to the handler
    fn spawn_line_monitor<R>(&mut self, stream: R, stream_name: &'static str)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let handler = self.output_handler.clone();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: {} EOF reached", stream_name);
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim_end().to_string();
                        if line_content.is_empty() {
                            continue;
                        }
                        match handler {
                            Some(ref handler) => handler(line_content),
                            None => trace!(
                                "ChildProcessManager: {} drained: {}",
                                stream_name,
                                line_content
                            ),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from {}: {}", stream_name, e);
                        break;
                    }
                }
            }
        });

        self.output_tasks.push(task);
    }

    fn spawn_wait_task(&mut self, mut child: Child) {
        let current_pid = self.get_state().pid();
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(exit_status) => {
                    info!(
                        "Process PID {:?} exited with status: {}",
                        current_pid, exit_status
                    );
                    exit_status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    None
                }
            };

            *state.lock().unwrap_or_else(|e| e.into_inner()) = ProcessState::Stopped;

            if let Some(handler) = &exit_handler {
                handler
                    .on_process_exit(ProcessExitEvent {
                        pid: current_pid,
                        code,
                    })
                    .await;
            }
        });

        self.wait_task = Some(task);
    }

    fn abort_output_tasks(&mut self) {
        for task in self.output_tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {}", self.command_line());

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match self.stdio {
            ProcessStdio::Transport => command_builder.stdin(Stdio::piped()),
            ProcessStdio::Detached => command_builder.stdin(Stdio::null()),
        };

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn().map_err(|source| ProcessError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Process started with PID: {}", pid);
        self.set_state(ProcessState::Running { pid });

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        match self.stdio {
            ProcessStdio::Transport => {
                let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
                self.stdio_transport = Some(StreamTransport::from_child(stdin, stdout));
            }
            ProcessStdio::Detached => self.spawn_line_monitor(stdout, "stdout"),
        }

        // Always drain stderr so the child never blocks on a full pipe
        self.spawn_line_monitor(stderr, "stderr");

        self.spawn_wait_task(child);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => info!("Gracefully stopping process with PID: {}", pid),
            StopMode::Force => info!("Force killing process with PID: {}", pid),
        }

        if let Some(mut transport) = self.stdio_transport.take() {
            use crate::io::transport::Transport;
            let _ = transport.close().await;
        }

        #[cfg(unix)]
        {
            let signal = match mode {
                StopMode::Graceful => libc::SIGTERM,
                StopMode::Force => libc::SIGKILL,
            };
            // SAFETY: pid belongs to a child we spawned and have not reaped yet
            if unsafe { libc::kill(pid as libc::pid_t, signal) } == 0 {
                info!("Sent signal {} to process {}", signal, pid);
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Process termination on this platform relies on the server exiting on its own");
        }

        self.abort_output_tasks();
        self.set_state(ProcessState::Stopped);

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StreamTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return,
        };

        info!("Synchronously force killing process with PID: {}", pid);

        #[cfg(unix)]
        {
            // SAFETY: see stop()
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            warn!("Synchronous process kill not implemented on this platform");
        }

        self.abort_output_tasks();
        self.set_state(ProcessState::Stopped);
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.output_handler = Some(Arc::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        if self.is_running() {
            warn!(
                "ChildProcessManager dropped while process is running - force killing {}",
                self.command
            );
            self.kill_sync();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_process_state_transitions() {
        let mut manager =
            ChildProcessManager::new("sleep".to_string(), vec!["5".to_string()], None);

        assert_eq!(manager.get_state(), ProcessState::NotStarted);

        manager.start().await.unwrap();
        assert!(matches!(manager.get_state(), ProcessState::Running { .. }));

        manager.stop(StopMode::Graceful).await.unwrap();
        assert_eq!(manager.get_state(), ProcessState::Stopped);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_invalid_operations() {
        let mut manager =
            ChildProcessManager::new("sleep".to_string(), vec!["5".to_string()], None);

        let result = manager.stop(StopMode::Graceful).await;
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        manager.start().await.unwrap();
        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::AlreadyStarted)));

        manager.stop(StopMode::Force).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_names_command() {
        let mut manager =
            ChildProcessManager::new("definitely-not-a-real-binary".to_string(), vec![], None);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-binary"));
    }

    #[tokio::test]
    async fn test_stderr_monitoring() {
        let mut manager = ChildProcessManager::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                "echo 'error message' >&2; sleep 1".to_string(),
            ],
            None,
        );

        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines_clone = Arc::clone(&lines);
        manager.on_stderr_line(move |line| lines_clone.lock().unwrap().push(line));

        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop(StopMode::Graceful).await.unwrap();

        assert_eq!(lines.lock().unwrap().first().map(String::as_str), Some("error message"));
    }

    #[tokio::test]
    async fn test_detached_stdout_goes_to_handler() {
        let mut manager = ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), "echo listening; sleep 1".to_string()],
            None,
        )
        .with_stdio(ProcessStdio::Detached);

        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines_clone = Arc::clone(&lines);
        manager.on_stderr_line(move |line| lines_clone.lock().unwrap().push(line));

        manager.start().await.unwrap();
        assert!(matches!(
            manager.create_stdio_transport(),
            Err(ProcessError::NotStarted)
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop(StopMode::Force).await.unwrap();

        assert!(lines.lock().unwrap().contains(&"listening".to_string()));
    }

    struct ChannelExitHandler(mpsc::UnboundedSender<ProcessExitEvent>);

    #[async_trait]
    impl ProcessExitHandler for ChannelExitHandler {
        async fn on_process_exit(&self, event: ProcessExitEvent) {
            let _ = self.0.send(event);
        }
    }

    #[tokio::test]
    async fn test_exit_handler_reports_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), "exit 3".to_string()],
            None,
        );
        manager.on_exit(Arc::new(ChannelExitHandler(tx)));

        manager.start().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.code, Some(3));
        assert!(!manager.is_running());
    }
}
