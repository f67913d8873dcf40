//! Session registry
//!
//! One session per workspace root. Every lifecycle operation
//! (`get_or_create`, `remove`, `remove_all`, `refresh`) runs under a single
//! gate, so a partially constructed session is never visible to a second
//! caller and concurrent callers for one key always share one construction.
//! Waiting for a handshake therefore blocks lifecycle operations on every
//! other key as well.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Level, debug, error, info, instrument, warn};
use url::Url;

use crate::server::config::{ConfigurationProvider, SessionTimings, StaticConfiguration};
use crate::server::error::SessionError;
use crate::server::factory::{ConnectOptions, Connector, ProcessConnector, TransportFactory};
use crate::server::output::{OutputSinks, sink_label};
use crate::server::resolver::{ExecutableResolver, StaticExecutableResolver};
use crate::server::session::{CloseObserver, Session, SessionContext, SessionInfo, SessionState};
use crate::server::waiter::{HandshakeProbe, InitializationWaiter, WaitOutcome};
use crate::workspace::folders::{WorkspaceFolder, WorkspaceFolders, WorkspaceKey};
use crate::workspace::notifier::{ChangeNotifier, RefreshReceiver, RefreshTrigger, SessionEvent};

type SessionMap = HashMap<WorkspaceKey, Arc<Session>>;

/// Result of tearing down a set of sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownSummary {
    pub stopped: usize,
    pub failed: usize,
}

impl TeardownSummary {
    fn record(&mut self, result: &Result<(), SessionError>) {
        match result {
            Ok(()) => self.stopped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.stopped + self.failed
    }
}

// ============================================================================
// Registry
// ============================================================================

struct RegistryInner {
    /// The gate; the map is only mutated while it is held
    sessions: Mutex<SessionMap>,

    /// Copy of the gate-protected map for lock-free reads
    current: RwLock<SessionMap>,

    folders: RwLock<WorkspaceFolders>,
    factory: TransportFactory,
    configuration: Arc<dyn ConfigurationProvider>,
    connector: Arc<dyn Connector>,
    sinks: OutputSinks,
    notifier: ChangeNotifier,
    waiter: InitializationWaiter,
    timings: SessionTimings,
    debug_server: bool,
}

impl RegistryInner {
    fn publish(&self, sessions: &SessionMap) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = sessions.clone();
    }

    fn current_id(&self, key: &WorkspaceKey) -> Option<u64> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|session| session.id())
    }
}

/// Lets sessions ask whether they are still current without owning the registry
struct RegistryObserver {
    inner: Weak<RegistryInner>,
}

impl CloseObserver for RegistryObserver {
    fn is_current(&self, key: &WorkspaceKey, session_id: u64) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.current_id(key) == Some(session_id))
    }

    fn on_unexpected_close(&self, key: &WorkspaceKey, session_id: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let key = key.clone();

        tokio::spawn(async move {
            let mut sessions = inner.sessions.lock().await;
            if sessions.get(&key).map(|s| s.id()) != Some(session_id) {
                debug!("Closed session {} for {} was already replaced", session_id, key);
                return;
            }
            if let Some(session) = sessions.remove(&key) {
                session.disarm_restart();
                inner.publish(&sessions);
                info!("Removed closed session {} for {}", session_id, key);
            }
        });
    }
}

/// Map from workspace key to its live session
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn builder() -> SessionRegistryBuilder {
        SessionRegistryBuilder::new()
    }

    /// Return the running session for `key`, creating it if necessary
    ///
    /// `Ok(None)` means the server did not finish its handshake within the
    /// waiter budget; nothing is stored and the next call starts over.
    #[instrument(name = "registry_get_or_create", skip(self, key, resource_uri), fields(key = %key))]
    pub async fn get_or_create(
        &self,
        key: &WorkspaceKey,
        resource_uri: &Url,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let mut sessions = self.inner.sessions.lock().await;

        if let Some(existing) = sessions.get(key) {
            if existing.state() == SessionState::Running {
                debug!("Reusing session {} for {}", existing.id(), key);
                return Ok(Some(Arc::clone(existing)));
            }

            // Closed but its removal has not run yet
            if let Some(stale) = sessions.remove(key) {
                info!("Replacing stopped session {} for {}", stale.id(), key);
                stale.disarm_restart();
                self.inner.publish(&sessions);
            }
        }

        let folder = self
            .folder(key)
            .ok_or_else(|| SessionError::UnknownWorkspace {
                resource: resource_uri.to_string(),
            })?;

        let started = Instant::now();
        let Some(session) = self.start_session(&folder, resource_uri).await? else {
            return Ok(None);
        };

        sessions.insert(key.clone(), Arc::clone(&session));
        self.inner.publish(&sessions);

        let running = session
            .mark_running()
            .and_then(|()| match session.connection_status() {
                status if status.is_terminal() => Err(SessionError::handshake_failed(format!(
                    "connection lost right after the handshake: {status:?}"
                ))),
                _ => Ok(()),
            });

        if let Err(e) = running {
            sessions.remove(key);
            self.inner.publish(&sessions);
            session.disarm_restart();
            if let Err(stop_error) = session.stop().await {
                debug!("Cleanup of session {} failed: {}", session.id(), stop_error);
            }
            return Err(e);
        }

        crate::log_timing!(Level::INFO, "session_start", started.elapsed());
        Ok(Some(session))
    }

    /// Build, start and wait for a new session; the gate is held by the caller
    async fn start_session(
        &self,
        folder: &WorkspaceFolder,
        resource_uri: &Url,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let inner = &self.inner;
        let settings = inner.configuration.settings_for(folder);
        info!(
            "Creating session for {} (mode: {})",
            folder.name, settings.mode
        );

        let descriptor = inner.factory.build(folder, &settings)?;
        let output = inner.sinks.get_or_create(&sink_label(settings.mode, &folder.name));

        let session = Session::new(SessionContext {
            folder: folder.clone(),
            resource_uri: resource_uri.clone(),
            mode: descriptor.mode(),
            output: Arc::clone(&output),
            notifier: inner.notifier.clone(),
            observer: Arc::new(RegistryObserver {
                inner: Arc::downgrade(inner),
            }),
            shutdown_timeout: inner.timings.shutdown_timeout,
        });

        let options = ConnectOptions {
            debug: inner.debug_server,
            timings: inner.timings,
            output,
        };
        session
            .start(inner.connector.as_ref(), &descriptor, &options)
            .await?;

        match inner.waiter.wait(session.as_ref()).await {
            WaitOutcome::Ready => Ok(Some(session)),
            WaitOutcome::TimedOut => {
                warn!(
                    "Server for {} did not finish its handshake in {:?}, discarding session",
                    folder.name,
                    inner.waiter.budget()
                );
                session
                    .output()
                    .append_line("Server did not become ready in time");
                if let Err(e) = session.stop().await {
                    debug!("Cleanup of session {} failed: {}", session.id(), e);
                }
                Ok(None)
            }
            WaitOutcome::Failed(reason) => {
                error!("Handshake with server for {} failed: {}", folder.name, reason);
                if let Err(e) = session.stop().await {
                    debug!("Cleanup of session {} failed: {}", session.id(), e);
                }
                Err(SessionError::handshake_failed(reason))
            }
        }
    }

    /// Remove and stop the session for `key`; stop failures are logged
    ///
    /// Returns whether a session was registered.
    #[instrument(name = "registry_remove", skip(self, key), fields(key = %key))]
    pub async fn remove(&self, key: &WorkspaceKey) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let summary = self.remove_locked(&mut sessions, |k| k == key).await;
        summary.total() > 0
    }

    /// Remove and stop every session concurrently
    ///
    /// The map is cleared before any session is stopped; one failing stop
    /// never prevents the others.
    #[instrument(name = "registry_remove_all", skip(self))]
    pub async fn remove_all(&self) -> TeardownSummary {
        let mut sessions = self.inner.sessions.lock().await;
        self.remove_locked(&mut sessions, |_| true).await
    }

    async fn remove_locked<F>(&self, sessions: &mut SessionMap, mut selected: F) -> TeardownSummary
    where
        F: FnMut(&WorkspaceKey) -> bool,
    {
        let keys: Vec<WorkspaceKey> = sessions.keys().filter(|k| selected(k)).cloned().collect();
        let removed: Vec<Arc<Session>> = keys.iter().filter_map(|k| sessions.remove(k)).collect();
        self.inner.publish(sessions);

        let mut summary = TeardownSummary::default();
        if removed.is_empty() {
            return summary;
        }

        let mut stops = JoinSet::new();
        for session in removed {
            session.disarm_restart();
            stops.spawn(async move {
                let result = session.stop().await;
                if let Err(e) = &result {
                    warn!("Failed to stop session for {}: {}", session.key(), e);
                }
                result
            });
        }

        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok(result) => summary.record(&result),
                Err(e) => {
                    error!("Session stop task failed: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Stopped {} session(s), {} failed",
            summary.stopped, summary.failed
        );
        summary
    }

    /// Apply an external change; affected sessions are removed and come back
    /// lazily on the next request
    #[instrument(name = "registry_refresh", skip(self))]
    pub async fn refresh(&self, trigger: RefreshTrigger) -> TeardownSummary {
        let mut sessions = self.inner.sessions.lock().await;

        match trigger {
            RefreshTrigger::WorkspaceFoldersChanged { added, removed } => {
                {
                    let mut folders = self.inner.folders.write().unwrap_or_else(|e| e.into_inner());
                    for key in &removed {
                        folders.remove(key);
                    }
                    for folder in added {
                        folders.add(folder);
                    }
                }
                self.remove_locked(&mut sessions, |k| removed.contains(k))
                    .await
            }
            RefreshTrigger::ConfigurationChanged { affected: Some(keys) } => {
                self.remove_locked(&mut sessions, |k| keys.contains(k)).await
            }
            RefreshTrigger::ConfigurationChanged { affected: None }
            | RefreshTrigger::InterpreterChanged => {
                self.remove_locked(&mut sessions, |_| true).await
            }
        }
    }

    /// Consume refresh triggers until the sender side is dropped
    pub fn spawn_refresh_listener(&self, mut triggers: RefreshReceiver) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(trigger) = triggers.recv().await {
                debug!("Refresh triggered: {:?}", trigger);
                registry.refresh(trigger).await;
            }
            debug!("Refresh listener finished");
        })
    }

    /// Process-wide teardown
    pub async fn shutdown(&self) -> TeardownSummary {
        info!("Shutting down all sessions");
        let summary = self.remove_all().await;
        if summary.failed > 0 {
            warn!("{} session(s) did not stop cleanly", summary.failed);
        }
        summary
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Registered session for `key`, without creating one
    pub fn get(&self, key: &WorkspaceKey) -> Option<Arc<Session>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .inner
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub fn folder(&self, key: &WorkspaceKey) -> Option<WorkspaceFolder> {
        self.inner
            .folders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn folders(&self) -> Vec<WorkspaceFolder> {
        self.inner
            .folders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Folder owning `resource`, see [`WorkspaceFolders::resolve`]
    pub fn resolve_folder(&self, resource: &Url, fallback_to_sole_root: bool) -> Option<WorkspaceFolder> {
        self.inner
            .folders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(resource, fallback_to_sole_root)
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Wires the registry's collaborators; every one has a production default
pub struct SessionRegistryBuilder {
    folders: Vec<WorkspaceFolder>,
    resolver: Option<Arc<dyn ExecutableResolver>>,
    configuration: Option<Arc<dyn ConfigurationProvider>>,
    connector: Option<Arc<dyn Connector>>,
    sinks: Option<OutputSinks>,
    notifier: Option<ChangeNotifier>,
    waiter: InitializationWaiter,
    timings: SessionTimings,
    debug_server: bool,
}

impl SessionRegistryBuilder {
    pub fn new() -> Self {
        Self {
            folders: Vec::new(),
            resolver: None,
            configuration: None,
            connector: None,
            sinks: None,
            notifier: None,
            waiter: InitializationWaiter::default(),
            timings: SessionTimings::default(),
            debug_server: false,
        }
    }

    pub fn with_folders(mut self, folders: impl IntoIterator<Item = WorkspaceFolder>) -> Self {
        self.folders.extend(folders);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExecutableResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_configuration(mut self, configuration: Arc<dyn ConfigurationProvider>) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_sinks(mut self, sinks: OutputSinks) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub fn with_notifier(mut self, notifier: ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_waiter(mut self, waiter: InitializationWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Launch servers with the debug argument variant
    pub fn with_debug_server(mut self, debug: bool) -> Self {
        self.debug_server = debug;
        self
    }

    pub fn build(self) -> SessionRegistry {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StaticExecutableResolver::from_env(None, None)));
        let configuration = self
            .configuration
            .unwrap_or_else(|| Arc::new(StaticConfiguration::default()));

        debug!(
            "Building session registry for {} folder(s)",
            self.folders.len()
        );

        SessionRegistry {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                current: RwLock::new(HashMap::new()),
                folders: RwLock::new(WorkspaceFolders::new(self.folders)),
                factory: TransportFactory::new(resolver),
                configuration,
                connector: self.connector.unwrap_or_else(|| Arc::new(ProcessConnector)),
                sinks: self.sinks.unwrap_or_default(),
                notifier: self.notifier.unwrap_or_default(),
                waiter: self.waiter,
                timings: self.timings,
                debug_server: self.debug_server,
            }),
        }
    }
}

impl Default for SessionRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{FakeServerBehavior, MockConnector};
    use crate::workspace::notifier::refresh_channel;
    use std::path::PathBuf;
    use std::time::Duration;

    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    const A: &str = "file:///work/a";
    const B: &str = "file:///work/b";

    fn key(uri: &str) -> WorkspaceKey {
        WorkspaceKey::parse(uri).unwrap()
    }

    fn resource(uri: &str) -> Url {
        Url::parse(&format!("{uri}/suite.robot")).unwrap()
    }

    fn folder(uri: &str) -> WorkspaceFolder {
        WorkspaceFolder::from_uri(Url::parse(uri).unwrap())
    }

    fn registry_with(connector: Arc<MockConnector>) -> SessionRegistry {
        SessionRegistry::builder()
            .with_folders([folder(A), folder(B)])
            .with_resolver(Arc::new(StaticExecutableResolver::new(
                "python3",
                Some(PathBuf::from("/srv/server.py")),
            )))
            .with_connector(connector)
            .with_waiter(InitializationWaiter::new(50, Duration::from_millis(5)))
            .with_timings(SessionTimings {
                shutdown_timeout: Duration::from_millis(500),
                ..SessionTimings::default()
            })
            .build()
    }

    async fn running(registry: &SessionRegistry, uri: &str) -> Arc<Session> {
        registry
            .get_or_create(&key(uri), &resource(uri))
            .await
            .unwrap()
            .expect("session should become ready")
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_construction() {
        let connector = Arc::new(MockConnector::new().with_connect_delay(Duration::from_millis(50)));
        let registry = registry_with(connector.clone());

        let mut callers = JoinSet::new();
        for _ in 0..8 {
            let registry = registry.clone();
            callers.spawn(async move { running(&registry, A).await });
        }

        let mut sessions = Vec::new();
        while let Some(session) = callers.join_next().await {
            sessions.push(session.unwrap());
        }

        assert_eq!(connector.connections(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        registry.remove_all().await;
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_sessions() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry_with(connector.clone());

        let a = running(&registry, A).await;
        let b = running(&registry, B).await;

        assert_ne!(a.id(), b.id());
        assert_eq!(connector.connections(), 2);
        assert_eq!(registry.sessions().len(), 2);
        registry.remove_all().await;
    }

    #[tokio::test]
    async fn test_remove_all_then_get_or_create_is_fresh() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry_with(connector.clone());

        let first = running(&registry, A).await;
        running(&registry, B).await;

        let summary = registry.remove_all().await;
        assert_eq!(summary, TeardownSummary { stopped: 2, failed: 0 });
        assert!(registry.sessions().is_empty());
        assert_eq!(first.state(), SessionState::Stopped);

        let second = running(&registry, A).await;
        assert_ne!(first.id(), second.id());
        assert_eq!(second.state(), SessionState::Running);
        assert_eq!(connector.connections(), 3);
        assert_eq!(connector.shutdown_requests(), 2);
        registry.remove_all().await;
    }

    #[tokio::test]
    async fn test_remove_all_tolerates_a_failing_stop() {
        let connector = Arc::new(MockConnector::new().then(FakeServerBehavior::RejectShutdown));
        let registry = registry_with(connector.clone());

        let refusing = running(&registry, A).await;
        let cooperative = running(&registry, B).await;

        let summary = registry.remove_all().await;
        assert_eq!(summary, TeardownSummary { stopped: 1, failed: 1 });
        assert_eq!(refusing.state(), SessionState::Stopped);
        assert_eq!(cooperative.state(), SessionState::Stopped);
        assert!(registry.sessions().is_empty());

        let fresh = running(&registry, A).await;
        assert_ne!(fresh.id(), refusing.id());
        assert_eq!(connector.connections(), 3);
        registry.remove_all().await;
    }

    #[tokio::test]
    async fn test_remove_reports_session_despite_failing_stop() {
        let connector = Arc::new(MockConnector::new().then(FakeServerBehavior::RejectShutdown));
        let registry = registry_with(connector.clone());

        let refusing = running(&registry, A).await;

        assert!(registry.remove(&key(A)).await);
        assert_eq!(refusing.state(), SessionState::Stopped);
        assert!(registry.get(&key(A)).is_none());
        assert_eq!(connector.shutdown_requests(), 1);

        let fresh = running(&registry, A).await;
        assert_ne!(fresh.id(), refusing.id());
        registry.remove_all().await;
    }

    #[tokio::test]
    async fn test_handshake_timeout_is_not_stored() {
        let connector = Arc::new(MockConnector::new().then(FakeServerBehavior::StallHandshake));
        let registry = registry_with(connector.clone());

        let timed_out = registry.get_or_create(&key(A), &resource(A)).await.unwrap();
        assert!(timed_out.is_none());
        assert!(registry.get(&key(A)).is_none());

        let session = running(&registry, A).await;
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(connector.connections(), 2);
        registry.remove_all().await;
    }

    #[tokio::test]
    async fn test_restart_flag_follows_ownership() {
        let registry = registry_with(Arc::new(MockConnector::new()));

        let session = running(&registry, A).await;
        assert!(session.restart_on_close());

        assert!(registry.remove(&key(A)).await);
        assert!(!session.restart_on_close());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!registry.remove(&key(A)).await);
    }

    #[tokio::test]
    async fn test_remove_then_recreate_walks_all_states() {
        let registry = registry_with(Arc::new(MockConnector::new()));
        let old = running(&registry, A).await;
        registry.remove(&key(A)).await;

        let mut events = registry.subscribe();
        let fresh = running(&registry, A).await;
        assert_ne!(old.id(), fresh.id());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec![SessionState::Starting, SessionState::Running]);
        registry.remove_all().await;
    }

    #[tokio::test]
    async fn test_connection_failure_is_retried_from_scratch() {
        let connector = Arc::new(MockConnector::refusing());
        let registry = registry_with(connector.clone());

        for _ in 0..2 {
            let result = registry.get_or_create(&key(A), &resource(A)).await;
            assert!(matches!(result, Err(SessionError::ConnectionFailed { .. })));
        }
        assert_eq!(connector.connections(), 2);
        assert!(registry.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_handshake_surfaces_error() {
        let registry = registry_with(Arc::new(MockConnector::failing_handshake()));

        let result = registry.get_or_create(&key(A), &resource(A)).await;
        assert!(matches!(result, Err(SessionError::HandshakeFailed { .. })));
        assert!(registry.get(&key(A)).is_none());
    }

    #[tokio::test]
    async fn test_missing_interpreter_never_connects() {
        let connector = Arc::new(MockConnector::new());
        let registry = SessionRegistry::builder()
            .with_folders([folder(A)])
            .with_resolver(Arc::new(StaticExecutableResolver::new("python3", None)))
            .with_connector(connector.clone())
            .build();

        let result = registry.get_or_create(&key(A), &resource(A)).await;
        assert!(matches!(result, Err(SessionError::NoValidInterpreter { .. })));
        assert_eq!(connector.connections(), 0);
    }

    #[tokio::test]
    async fn test_unknown_workspace_is_an_error() {
        let registry = registry_with(Arc::new(MockConnector::new()));
        let result = registry
            .get_or_create(&key("file:///elsewhere"), &resource("file:///elsewhere"))
            .await;
        assert!(matches!(result, Err(SessionError::UnknownWorkspace { .. })));
    }

    #[tokio::test]
    async fn test_unexpected_close_removes_entry() {
        let connector = Arc::new(MockConnector::new().then(FakeServerBehavior::DropAfterInit));
        let registry = registry_with(connector.clone());
        let mut events = registry.subscribe();

        let dropped = running(&registry, A).await;
        let restart_eligible = loop {
            if let SessionEvent::Closed {
                restart_eligible, ..
            } = events.recv().await.unwrap()
            {
                break restart_eligible;
            }
        };
        assert!(restart_eligible);

        for _ in 0..100 {
            if registry.get(&key(A)).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.get(&key(A)).is_none());
        assert!(!dropped.restart_on_close());

        let replacement = running(&registry, A).await;
        assert_ne!(replacement.id(), dropped.id());
        registry.remove_all().await;
    }

    #[tokio::test]
    async fn test_refresh_triggers() {
        let registry = registry_with(Arc::new(MockConnector::new()));
        running(&registry, A).await;
        running(&registry, B).await;

        let summary = registry
            .refresh(RefreshTrigger::ConfigurationChanged {
                affected: Some(vec![key(B)]),
            })
            .await;
        assert_eq!(summary.stopped, 1);
        assert!(registry.get(&key(A)).is_some());
        assert!(registry.get(&key(B)).is_none());

        registry
            .refresh(RefreshTrigger::WorkspaceFoldersChanged {
                added: vec![folder("file:///work/c")],
                removed: vec![key(A)],
            })
            .await;
        assert!(registry.sessions().is_empty());
        assert!(registry.folder(&key(A)).is_none());
        assert!(registry.folder(&key("file:///work/c")).is_some());

        running(&registry, B).await;
        registry.refresh(RefreshTrigger::InterpreterChanged).await;
        assert!(registry.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_listener_consumes_triggers() {
        let registry = registry_with(Arc::new(MockConnector::new()));
        running(&registry, A).await;

        let (sender, receiver) = refresh_channel();
        let listener = registry.spawn_refresh_listener(receiver);
        sender.send(RefreshTrigger::InterpreterChanged).unwrap();
        drop(sender);
        listener.await.unwrap();

        assert!(registry.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_snapshot_is_sorted() {
        let registry = registry_with(Arc::new(MockConnector::new()));
        running(&registry, B).await;
        running(&registry, A).await;

        let keys: Vec<_> = registry.sessions().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec![A.to_string(), B.to_string()]);
        registry.shutdown().await;
    }
}
