//! Test doubles for session management
//!
//! An in-memory language server speaking framed JSON-RPC over a tokio duplex
//! stream, a scriptable [`MockConnector`] handing out connections to it, and
//! an output sink that keeps what it receives.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::{JoinHandle, JoinSet};

use crate::io::transport::{StreamTransport, Transport};
use crate::lsp::framing::LspFraming;
use crate::lsp::jsonrpc_utils::{self, error_codes};
use crate::server::error::SessionError;
use crate::server::factory::{ConnectOptions, Connection, ConnectionDescriptor, Connector};
use crate::server::output::OutputSink;

// ============================================================================
// Output Sink
// ============================================================================

#[derive(Debug)]
pub struct CollectingOutputSink {
    label: String,
    lines: Mutex<Vec<String>>,
}

impl CollectingOutputSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl OutputSink for CollectingOutputSink {
    fn label(&self) -> &str {
        &self.label
    }

    fn append_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

// ============================================================================
// Fake Language Server
// ============================================================================

/// How the fake server treats the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FakeServerBehavior {
    #[default]
    Cooperative,
    /// Never answers `initialize`
    StallHandshake,
    /// Answers `initialize` with an error
    RejectHandshake,
    /// Completes the handshake, then hangs up shortly afterwards
    DropAfterInit,
    /// Completes the handshake but answers `shutdown` with an error
    RejectShutdown,
}

/// Counters shared between a connector and the servers it spawned
#[derive(Debug, Default)]
pub struct FakeServerStats {
    connections: AtomicUsize,
    shutdown_requests: AtomicUsize,
    cancellations: AtomicUsize,
    methods: Mutex<Vec<String>>,
}

/// Delay before a [`FakeServerBehavior::DropAfterInit`] server hangs up
const DROP_AFTER_INIT_DELAY: Duration = Duration::from_millis(100);

pub struct FakeLanguageServer {
    behavior: FakeServerBehavior,
    response_delay: Duration,
    stats: Arc<FakeServerStats>,
}

impl FakeLanguageServer {
    pub fn new(
        behavior: FakeServerBehavior,
        response_delay: Duration,
        stats: Arc<FakeServerStats>,
    ) -> Self {
        Self {
            behavior,
            response_delay,
            stats,
        }
    }

    pub fn spawn(self, stream: DuplexStream) -> JoinHandle<()> {
        tokio::spawn(self.run(LspFraming::new(StreamTransport::from_stream(stream))))
    }

    async fn run(self, mut framing: LspFraming<StreamTransport>) {
        let mut delayed: JoinSet<(String, Value)> = JoinSet::new();
        let mut pending: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                message = framing.receive() => {
                    let Ok(message) = message else { return };
                    let Ok(message) = serde_json::from_str::<Value>(&message) else { continue };
                    let method = message["method"].as_str().unwrap_or_default().to_string();
                    self.stats.methods.lock().unwrap().push(method.clone());

                    match (method.as_str(), message.get("id").cloned()) {
                        ("exit", None) => return,
                        ("initialized", None) => {
                            if self.behavior == FakeServerBehavior::DropAfterInit {
                                tokio::time::sleep(DROP_AFTER_INIT_DELAY).await;
                                return;
                            }
                        }
                        ("$/cancelRequest", None) => {
                            self.stats.cancellations.fetch_add(1, Ordering::SeqCst);
                            let id = message["params"]["id"].clone();
                            if pending.remove(&id.to_string()) {
                                let reply = jsonrpc_utils::error_response(
                                    id,
                                    error_codes::REQUEST_CANCELLED,
                                    "Request cancelled".to_string(),
                                    None,
                                );
                                if send(&mut framing, &reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                        (_, None) => {}
                        (method, Some(id)) => {
                            let Some(reply) = self.answer(method, id.clone(), &message["params"]) else {
                                continue;
                            };
                            if matches!(method, "initialize" | "shutdown") || self.response_delay.is_zero() {
                                if send(&mut framing, &reply).await.is_err() {
                                    return;
                                }
                            } else {
                                let key = id.to_string();
                                pending.insert(key.clone());
                                let delay = self.response_delay;
                                delayed.spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    (key, reply)
                                });
                            }
                        }
                    }
                }
                Some(Ok((key, reply))) = delayed.join_next(), if !delayed.is_empty() => {
                    if pending.remove(&key) && send(&mut framing, &reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn answer(&self, method: &str, id: Value, params: &Value) -> Option<Value> {
        let reply = match method {
            "initialize" => match self.behavior {
                FakeServerBehavior::StallHandshake => return None,
                FakeServerBehavior::RejectHandshake => jsonrpc_utils::error_response(
                    id,
                    error_codes::INTERNAL_ERROR,
                    "no python environment".to_string(),
                    None,
                ),
                _ => jsonrpc_utils::success_response(id, json!({"capabilities": {}})),
            },
            "shutdown" => {
                self.stats.shutdown_requests.fetch_add(1, Ordering::SeqCst);
                if self.behavior == FakeServerBehavior::RejectShutdown {
                    jsonrpc_utils::error_response(
                        id,
                        error_codes::INTERNAL_ERROR,
                        "shutdown refused".to_string(),
                        None,
                    )
                } else {
                    jsonrpc_utils::null_success_response(id)
                }
            }
            "discovering/getTestsFromWorkspace" | "discovering/getTestsFromDocument" => {
                let uri = params["workspaceUri"]
                    .as_str()
                    .or_else(|| params["documentUri"].as_str())
                    .unwrap_or_default();
                jsonrpc_utils::success_response(
                    id,
                    json!([{
                        "type": "suite",
                        "id": "app.login",
                        "uri": uri,
                        "label": "Login",
                        "longName": "App.Login",
                        "children": [{
                            "type": "test",
                            "id": "app.login.valid",
                            "label": "Valid Login",
                            "longName": "App.Login.Valid Login",
                            "tags": ["smoke"]
                        }]
                    }]),
                )
            }
            "debugging/getEvaluatableExpression" => jsonrpc_utils::success_response(
                id,
                json!({
                    "range": {
                        "start": {"line": 3, "character": 4},
                        "end": {"line": 3, "character": 12}
                    },
                    "expression": "${user}"
                }),
            ),
            "debugging/getInlineValues" | "cache/clear" => {
                jsonrpc_utils::null_success_response(id)
            }
            "test/echo" => jsonrpc_utils::success_response(id, params.clone()),
            other => jsonrpc_utils::method_not_found_response(id, other),
        };
        Some(serde_json::to_value(reply).unwrap())
    }
}

async fn send(
    framing: &mut LspFraming<StreamTransport>,
    reply: &impl serde::Serialize,
) -> Result<(), crate::io::transport::TransportError> {
    framing.send(&serde_json::to_string(reply).unwrap()).await
}

// ============================================================================
// Mock Connector
// ============================================================================

/// Connector that hands out connections to in-memory fake servers
///
/// Behaviours queued with [`MockConnector::then`] are used by successive
/// connections; once the queue is empty the default behaviour applies.
pub struct MockConnector {
    default_behavior: FakeServerBehavior,
    script: Mutex<VecDeque<FakeServerBehavior>>,
    refuse: bool,
    connect_delay: Duration,
    response_delay: Duration,
    stats: Arc<FakeServerStats>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_behavior(FakeServerBehavior::Cooperative)
    }

    pub fn with_behavior(behavior: FakeServerBehavior) -> Self {
        Self {
            default_behavior: behavior,
            script: Mutex::new(VecDeque::new()),
            refuse: false,
            connect_delay: Duration::ZERO,
            response_delay: Duration::ZERO,
            stats: Arc::new(FakeServerStats::default()),
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new()
        }
    }

    pub fn stalling_handshake() -> Self {
        Self::with_behavior(FakeServerBehavior::StallHandshake)
    }

    pub fn failing_handshake() -> Self {
        Self::with_behavior(FakeServerBehavior::RejectHandshake)
    }

    pub fn dropping_after_init() -> Self {
        Self::with_behavior(FakeServerBehavior::DropAfterInit)
    }

    /// Use `behavior` for the next connection not yet scripted
    pub fn then(self, behavior: FakeServerBehavior) -> Self {
        self.script.lock().unwrap().push_back(behavior);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Delay every response except `initialize` and `shutdown`; cancellation
    /// answers immediately
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Connection attempts, refused ones included
    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn shutdown_requests(&self) -> usize {
        self.stats.shutdown_requests.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> usize {
        self.stats.cancellations.load(Ordering::SeqCst)
    }

    /// Methods received by all servers, in arrival order
    pub fn methods(&self) -> Vec<String> {
        self.stats.methods.lock().unwrap().clone()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        _options: &ConnectOptions,
    ) -> Result<Connection, SessionError> {
        self.stats.connections.fetch_add(1, Ordering::SeqCst);

        if self.refuse {
            return Err(SessionError::ConnectionFailed {
                endpoint: descriptor.endpoint(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_behavior);
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        FakeLanguageServer::new(behavior, self.response_delay, Arc::clone(&self.stats))
            .spawn(server_side);

        Ok(Connection {
            transport: Box::new(StreamTransport::from_stream(client_side)),
            process: None,
        })
    }
}
