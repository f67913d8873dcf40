//! Session state machine
//!
//! A [`Session`] owns one server connection for one workspace root: the
//! protocol client, the server process when we launched it, the lifecycle
//! state and the restart-on-close policy flag.
//!
//! States move `Stopped -> Starting -> Running -> Stopped`, with
//! `Starting -> Stopped` on a failed start. Every transition is published on
//! the [`ChangeNotifier`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use url::Url;

use crate::io::process::{ChildProcessManager, ProcessManager, StopMode};
use crate::lsp::client::LspClient;
use crate::lsp::protocol::{ConnectionStatus, JsonRpcClient};
use crate::server::config::TransportMode;
use crate::server::error::SessionError;
use crate::server::factory::{ConnectOptions, ConnectionDescriptor, Connector};
use crate::server::output::OutputSink;
use crate::server::waiter::HandshakeProbe;
use crate::workspace::folders::{WorkspaceFolder, WorkspaceKey};
use crate::workspace::notifier::{ChangeNotifier, SessionEvent};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Stopped, SessionState::Starting)
                | (SessionState::Starting, SessionState::Running)
                | (SessionState::Starting, SessionState::Stopped)
                | (SessionState::Running, SessionState::Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
        };
        f.write_str(name)
    }
}

/// Registry-side view a session consults when it stops or loses its connection
pub trait CloseObserver: Send + Sync {
    /// Whether `session_id` is still the registry's entry for `key`
    fn is_current(&self, key: &WorkspaceKey, session_id: u64) -> bool;

    /// The connection of a running session closed without a stop request
    fn on_unexpected_close(&self, key: &WorkspaceKey, session_id: u64);
}

/// Snapshot of a session for observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: u64,
    pub key: String,
    pub workspace_name: String,
    pub resource_uri: String,
    pub mode: TransportMode,
    pub state: SessionState,
    pub restart_on_close: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// Collaborators and identity of a session under construction
#[derive(Clone)]
pub struct SessionContext {
    pub folder: WorkspaceFolder,
    /// Resource whose request caused the session to be created
    pub resource_uri: Url,
    pub mode: TransportMode,
    pub output: Arc<dyn OutputSink>,
    pub notifier: ChangeNotifier,
    pub observer: Arc<dyn CloseObserver>,
    pub shutdown_timeout: Duration,
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    id: u64,
    key: WorkspaceKey,
    folder: WorkspaceFolder,
    resource_uri: Url,
    mode: TransportMode,

    state: Mutex<SessionState>,

    /// Armed on reaching Running while current; disarmed once superseded
    restart_on_close: AtomicBool,

    /// Set before a deliberate stop so the close monitor stays quiet
    stopping: AtomicBool,

    client: RwLock<Option<Arc<LspClient>>>,

    /// Present only when we launched the server
    process: tokio::sync::Mutex<Option<ChildProcessManager>>,

    output: Arc<dyn OutputSink>,
    notifier: ChangeNotifier,
    observer: Arc<dyn CloseObserver>,
    shutdown_timeout: Duration,

    started_at: Mutex<Option<DateTime<Utc>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(context: SessionContext) -> Arc<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let key = context.folder.key();
        debug!("Creating session {} for {}", id, key);

        Arc::new(Self {
            id,
            key,
            folder: context.folder,
            resource_uri: context.resource_uri,
            mode: context.mode,
            state: Mutex::new(SessionState::Stopped),
            restart_on_close: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            client: RwLock::new(None),
            process: tokio::sync::Mutex::new(None),
            output: context.output,
            notifier: context.notifier,
            observer: context.observer,
            shutdown_timeout: context.shutdown_timeout,
            started_at: Mutex::new(None),
            monitor: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn folder(&self) -> &WorkspaceFolder {
        &self.folder
    }

    pub fn resource_uri(&self) -> &Url {
        &self.resource_uri
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn output(&self) -> &Arc<dyn OutputSink> {
        &self.output
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn restart_on_close(&self) -> bool {
        self.restart_on_close.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn client(&self) -> Option<Arc<LspClient>> {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            key: self.key.to_string(),
            workspace_name: self.folder.name.clone(),
            resource_uri: self.resource_uri.to_string(),
            mode: self.mode,
            state: self.state(),
            restart_on_close: self.restart_on_close(),
            started_at: self.started_at(),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect and kick off the handshake
    ///
    /// Returns once the connection exists; readiness is observed through the
    /// [`HandshakeProbe`] impl. Any failure leaves the session Stopped with
    /// everything it acquired released.
    pub async fn start(
        self: &Arc<Self>,
        connector: &dyn Connector,
        descriptor: &ConnectionDescriptor,
        options: &ConnectOptions,
    ) -> Result<(), SessionError> {
        info!("Starting session {} for {} ({})", self.id, self.key, self.mode);
        debug!("Endpoint: {}", descriptor.endpoint());

        self.transition(SessionState::Starting)?;

        let params = match self.folder.lsp_uri() {
            Ok(root_uri) => LspClient::initialize_params(&root_uri, &self.folder.name),
            Err(e) => {
                self.fail_start();
                return Err(e.into());
            }
        };

        debug!("Connecting to server");
        let connection = match connector.connect(descriptor, options).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Session {} could not connect: {}", self.id, e);
                self.output
                    .append_line(&format!("Failed to start server: {e}"));
                self.fail_start();
                return Err(e);
            }
        };

        debug!("Creating LSP client");
        let client = Arc::new(LspClient::new(JsonRpcClient::new(connection.transport)));
        let output = Arc::clone(&self.output);
        client
            .install_handlers(move |line| output.append_line(&line))
            .await;

        *self.process.lock().await = connection.process;
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&client));

        debug!("Starting handshake");
        client.start_handshake(params);
        self.spawn_close_monitor(&client);

        Ok(())
    }

    /// Handshake finished: Starting -> Running
    pub fn mark_running(&self) -> Result<(), SessionError> {
        self.transition(SessionState::Running)?;
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let current = self.observer.is_current(&self.key, self.id);
        self.restart_on_close.store(current, Ordering::SeqCst);
        info!(
            "Session {} for {} is running (restart on close: {})",
            self.id, self.key, current
        );
        Ok(())
    }

    /// The registry no longer owns this session
    pub fn disarm_restart(&self) {
        if self.restart_on_close.swap(false, Ordering::SeqCst) {
            debug!("Session {} restart policy disarmed", self.id);
        }
    }

    /// Deliberate stop: `shutdown`/`exit`, close the connection, stop the
    /// process
    ///
    /// Teardown always runs to completion; the first error met is returned
    /// afterwards.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.stopping.store(true, Ordering::SeqCst);
        let started = Instant::now();
        info!("Stopping session {} for {}", self.id, self.key);

        let mut first_error: Option<SessionError> = None;

        if let Some(client) = self.take_client() {
            if let Err(e) = client.shutdown(self.shutdown_timeout).await {
                warn!("Session {} shutdown request failed: {}", self.id, e);
                first_error.get_or_insert(SessionError::shutdown_failed(e.to_string()));
            }
            client.close().await;
        }

        if let Some(handle) = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        if let Err(e) = self.stop_process(StopMode::Graceful).await {
            first_error.get_or_insert(e);
        }

        if self.state() != SessionState::Stopped {
            if let Err(e) = self.transition(SessionState::Stopped) {
                debug!("Session {} stopped concurrently: {}", self.id, e);
            }
        }

        crate::log_timing!(Level::DEBUG, "session_stop", started.elapsed());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    pub async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let client = self.client().ok_or(SessionError::ClientUnavailable)?;
        client
            .request(method, params)
            .await
            .map_err(|e| SessionError::request(method, e))
    }

    pub async fn request_with_cancellation<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        token: &CancellationToken,
    ) -> Result<R, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let client = self.client().ok_or(SessionError::ClientUnavailable)?;
        client
            .request_with_cancellation(method, params, token)
            .await
            .map_err(|e| SessionError::request(method, e))
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.can_transition_to(next) {
                return Err(SessionError::invalid_state(*state, format!("a state leading to {next:?}")));
            }
            debug!("Session {} state {} -> {}", self.id, *state, next);
            *state = next;
        }

        if next == SessionState::Stopped && !self.observer.is_current(&self.key, self.id) {
            self.disarm_restart();
        }

        self.notifier.publish(SessionEvent::StateChanged {
            key: self.key.clone(),
            resource_uri: self.resource_uri.clone(),
            state: next,
        });
        Ok(())
    }

    /// Starting -> Stopped after a failed start attempt
    fn fail_start(&self) {
        if let Err(e) = self.transition(SessionState::Stopped) {
            error!("Session {} could not leave Starting: {}", self.id, e);
        }
    }

    fn take_client(&self) -> Option<Arc<LspClient>> {
        self.client.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn stop_process(&self, mode: StopMode) -> Result<(), SessionError> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        if !process.is_running() {
            return Ok(());
        }
        process.stop(mode).await.map_err(|e| {
            warn!("Session {} process stop failed: {}", self.id, e);
            SessionError::from(e)
        })
    }

    fn spawn_close_monitor(self: &Arc<Self>, client: &LspClient) {
        let mut status = client.subscribe_status();
        let session: Weak<Session> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let reason = match status.wait_for(ConnectionStatus::is_terminal).await {
                Ok(status) => status.clone(),
                Err(_) => ConnectionStatus::Closed,
            };
            if let Some(session) = session.upgrade() {
                session.handle_connection_end(reason).await;
            }
        });

        *self.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    async fn handle_connection_end(&self, status: ConnectionStatus) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        // A failure during Starting is reported by the initialization waiter
        if self.state() != SessionState::Running {
            debug!("Session {} connection ended while {}", self.id, self.state());
            return;
        }

        let restart_eligible = self.restart_on_close();
        let cause = match &status {
            ConnectionStatus::Failed(reason) => reason.as_str(),
            _ => "connection closed",
        };
        if unexpected_close_level(restart_eligible) == Level::INFO {
            info!(
                "Session {} for {} ended ({}); it will be recreated on the next request",
                self.id, self.key, cause
            );
        } else {
            error!(
                "Session {} for {} closed unexpectedly: {}",
                self.id, self.key, cause
            );
        }
        self.output.append_line(&format!(
            "Server connection closed unexpectedly{}",
            if restart_eligible {
                "; the next request will restart it"
            } else {
                ""
            }
        ));

        if let Err(e) = self.transition(SessionState::Stopped) {
            debug!("Session {} already stopped: {}", self.id, e);
            return;
        }

        if let Some(client) = self.take_client() {
            client.close().await;
        }
        if let Err(e) = self.stop_process(StopMode::Force).await {
            debug!("Session {} process cleanup: {}", self.id, e);
        }

        self.notifier.publish(SessionEvent::Closed {
            key: self.key.clone(),
            restart_eligible,
        });
        self.observer.on_unexpected_close(&self.key, self.id);
    }
}

/// Eligible closes are expected and only informational
fn unexpected_close_level(restart_eligible: bool) -> Level {
    if restart_eligible { Level::INFO } else { Level::ERROR }
}

impl HandshakeProbe for Session {
    fn connection_status(&self) -> ConnectionStatus {
        self.client()
            .map_or(ConnectionStatus::Closed, |client| client.status())
    }

    fn handshake_complete(&self) -> bool {
        self.client().is_some_and(|client| client.is_initialized())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("restart_on_close", &self.restart_on_close())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
