//! JSON-RPC 2.0 protocol layer
//!
//! Implements JSON-RPC 2.0 with request/response matching, notification
//! handling, answers to server-initiated requests, per-request cancellation
//! and a watchable connection status.

use crate::io::transport::Transport;
use crate::log_lsp_message;
use crate::lsp::framing::LspFraming;
use crate::lsp::jsonrpc_utils::{self, JSONRPC_VERSION, error_codes};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, trace};

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,

    /// Request identifier (matches the request)
    pub id: Value,

    /// Result (present if successful; `null` deserializes to `None`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Inbound message after classification
#[derive(Debug)]
enum Inbound {
    Response(JsonRpcResponse),
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

impl Inbound {
    /// A `method` with an `id` is a request, a `method` alone a notification,
    /// anything else a response.
    fn parse(message: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(message)?;
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        match (has_method, has_id) {
            (true, true) => serde_json::from_value(value).map(Inbound::Request),
            (true, false) => serde_json::from_value(value).map(Inbound::Notification),
            (false, _) => serde_json::from_value(value).map(Inbound::Response),
        }
    }
}

// ============================================================================
// JSON-RPC Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Request was cancelled")]
    RequestCancelled,

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
}

// ============================================================================
// Connection Status
// ============================================================================

/// Observable state of the underlying connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Transport handed over, message loop not yet running
    Connecting,
    /// Message loop running
    Connected,
    /// A protocol-level failure was reported (e.g. the handshake was rejected)
    Failed(String),
    /// Transport closed, either deliberately or by the peer
    Closed,
}

impl ConnectionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Failed(_) | ConnectionStatus::Closed)
    }
}

// ============================================================================
// JSON-RPC Client
// ============================================================================

type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Produces the answer to a server-initiated request
pub type RequestHandler = Arc<dyn Fn(&JsonRpcRequest) -> JsonRpcResponse + Send + Sync>;

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// JSON-RPC client with request/response correlation
///
/// Cloning yields another handle onto the same connection.
#[derive(Clone)]
pub struct JsonRpcClient {
    /// Channel for sending outbound messages (requests, notifications, replies)
    outbound_sender: mpsc::UnboundedSender<String>,

    request_id: Arc<AtomicU64>,

    /// Pending requests waiting for responses
    pending_requests: PendingRequests,

    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
    request_handler: Arc<Mutex<Option<RequestHandler>>>,

    status: Arc<watch::Sender<ConnectionStatus>>,

    /// Stops the transport task
    shutdown: CancellationToken,
}

impl JsonRpcClient {
    /// Create a new JSON-RPC client, framing `transport` with Content-Length headers
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        let transport = Arc::new(Mutex::new(LspFraming::new(transport)));
        let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<String>();
        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let notification_handler = Arc::new(Mutex::new(None::<NotificationHandler>));
        let request_handler = Arc::new(Mutex::new(None::<RequestHandler>));
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let status = Arc::new(status);
        let shutdown = CancellationToken::new();

        let task_pending = Arc::clone(&pending_requests);
        let task_notification_handler = Arc::clone(&notification_handler);
        let task_request_handler = Arc::clone(&request_handler);
        let task_status = Arc::clone(&status);
        let task_shutdown = shutdown.clone();
        let reply_sender = outbound_sender.clone();

        tokio::spawn(async move {
            // A failure or close reported before this task ran must stick
            task_status.send_if_modified(|status| {
                if *status == ConnectionStatus::Connecting {
                    *status = ConnectionStatus::Connected;
                    true
                } else {
                    false
                }
            });

            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => {
                        let _ = transport.lock().await.close().await;
                        break;
                    }
                    // Outbound messages
                    Some(message) = outbound_receiver.recv() => {
                        let mut transport = transport.lock().await;
                        if let Err(e) = transport.send(&message).await {
                            error!("Failed to send message: {}", e);
                            break;
                        }
                    }
                    // Inbound messages
                    result = async {
                        let mut transport = transport.lock().await;
                        transport.receive().await
                    } => {
                        match result {
                            Ok(message) => {
                                let notification_handler = task_notification_handler.lock().await.clone();
                                let request_handler = task_request_handler.lock().await.clone();
                                Self::process_inbound_message(
                                    &message,
                                    &task_pending,
                                    notification_handler.as_ref(),
                                    request_handler.as_ref(),
                                    &reply_sender,
                                )
                                .await;
                            }
                            Err(e) => {
                                debug!("Transport receive ended: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            // A reported failure outranks the close that follows it
            task_status.send_if_modified(|status| {
                if matches!(status, ConnectionStatus::Failed(_)) {
                    false
                } else {
                    *status = ConnectionStatus::Closed;
                    true
                }
            });

            // Dropping the senders wakes every waiter with ConnectionClosed
            task_pending.lock().await.clear();
            trace!("Transport handler task finished");
        });

        Self {
            outbound_sender,
            request_id: Arc::new(AtomicU64::new(1)),
            pending_requests,
            notification_handler,
            request_handler,
            status,
            shutdown,
        }
    }

    /// Set notification handler
    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        *self.notification_handler.lock().await = Some(Arc::new(handler));
    }

    /// Set the handler answering server-initiated requests
    ///
    /// Without one, every server request is answered with MethodNotFound.
    pub async fn on_request(&self, handler: RequestHandler) {
        *self.request_handler.lock().await = Some(handler);
    }

    async fn process_inbound_message(
        message: &str,
        pending_requests: &PendingRequests,
        notification_handler: Option<&NotificationHandler>,
        request_handler: Option<&RequestHandler>,
        reply_sender: &mpsc::UnboundedSender<String>,
    ) {
        trace!("JsonRpcClient: Received message: {}", message);

        match Inbound::parse(message) {
            Ok(Inbound::Response(response)) => {
                let Some(id) = jsonrpc_utils::numeric_id(&response.id) else {
                    debug!("Received response with unusable id: {}", response.id);
                    return;
                };
                match pending_requests.lock().await.remove(&id) {
                    Some(sender) => {
                        if sender.send(response).is_err() {
                            debug!("Response receiver dropped for request {}", id);
                        }
                    }
                    None => debug!("Received response for unknown request {}", id),
                }
            }
            Ok(Inbound::Notification(notification)) => {
                log_lsp_message!(Level::DEBUG, "incoming", notification.method.as_str(), &notification.params);
                if let Some(handler) = notification_handler {
                    handler(notification);
                }
            }
            Ok(Inbound::Request(request)) => {
                log_lsp_message!(Level::DEBUG, "incoming", request.method.as_str(), &request.params);
                let response = match request_handler {
                    Some(handler) => handler(&request),
                    None => jsonrpc_utils::method_not_found_response(
                        request.id.clone(),
                        &request.method,
                    ),
                };
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        let _ = reply_sender.send(json);
                    }
                    Err(e) => error!("Failed to serialize reply to {}: {}", request.method, e),
                }
            }
            Err(e) => debug!("Received unparseable message ({}): {}", e, message),
        }
    }

    /// Register a pending request and put it on the wire
    async fn start_request<P>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> Result<(u64, oneshot::Receiver<JsonRpcResponse>), JsonRpcError>
    where
        P: Serialize,
    {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let params = params
            .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
            .transpose()?;

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        };
        let request_json = serde_json::to_string(&request).map_err(JsonRpcError::Serialization)?;
        log_lsp_message!(Level::DEBUG, "outgoing", method, &request.params);

        let (response_sender, response_receiver) = oneshot::channel();
        self.pending_requests.lock().await.insert(id, response_sender);

        if self.outbound_sender.send(request_json).is_err() {
            self.forget(id).await;
            return Err(JsonRpcError::Transport("Outbound channel closed".to_string()));
        }

        Ok((id, response_receiver))
    }

    async fn forget(&self, id: u64) {
        self.pending_requests.lock().await.remove(&id);
    }

    fn finish<R>(
        response: Result<JsonRpcResponse, oneshot::error::RecvError>,
    ) -> Result<R, JsonRpcError>
    where
        R: for<'de> Deserialize<'de>,
    {
        let response = response.map_err(|_| JsonRpcError::ConnectionClosed)?;

        if let Some(error) = response.error {
            if error.code == error_codes::REQUEST_CANCELLED {
                return Err(JsonRpcError::RequestCancelled);
            }
            return Err(JsonRpcError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        // A missing or null result deserializes as null (e.g. shutdown, absent lists)
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(JsonRpcError::Deserialization)
    }

    /// Send a request and wait for its response without a deadline
    pub async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, JsonRpcError>
    where
        P: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let (_, receiver) = self.start_request(method, params).await?;
        Self::finish(receiver.await)
    }

    /// Send a request with a deadline; the pending entry is dropped on expiry
    pub async fn request_with_timeout<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Duration,
    ) -> Result<R, JsonRpcError>
    where
        P: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let (id, receiver) = self.start_request(method, params).await?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(response) => Self::finish(response),
            Err(_) => {
                self.forget(id).await;
                Err(JsonRpcError::Timeout)
            }
        }
    }

    /// Send a request bound to a cancellation token
    ///
    /// On cancellation the pending entry is dropped, `$/cancelRequest` is sent
    /// to the server and `RequestCancelled` is returned without waiting for
    /// the server to acknowledge.
    pub async fn request_with_cancellation<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        token: &CancellationToken,
    ) -> Result<R, JsonRpcError>
    where
        P: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        if token.is_cancelled() {
            return Err(JsonRpcError::RequestCancelled);
        }

        let (id, receiver) = self.start_request(method, params).await?;

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.forget(id).await;
                debug!("JsonRpcClient: Cancelling request {} ({})", id, method);
                let _ = self
                    .notify("$/cancelRequest", Some(serde_json::json!({ "id": id })))
                    .await;
                Err(JsonRpcError::RequestCancelled)
            }
            response = receiver => Self::finish(response),
        }
    }

    /// Send a JSON-RPC notification
    pub async fn notify<P>(&self, method: &str, params: Option<P>) -> Result<(), JsonRpcError>
    where
        P: Serialize,
    {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: params
                .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
                .transpose()?,
        };

        let notification_json =
            serde_json::to_string(&notification).map_err(JsonRpcError::Serialization)?;
        log_lsp_message!(Level::DEBUG, "outgoing", method, &notification.params);

        self.outbound_sender
            .send(notification_json)
            .map_err(|_| JsonRpcError::Transport("Outbound channel closed".to_string()))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Record a protocol-level failure; it sticks through the following close
    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.status.send_replace(ConnectionStatus::Failed(reason.into()));
    }

    pub fn is_connected(&self) -> bool {
        !self.status().is_terminal() && !self.outbound_sender.is_closed()
    }

    /// Number of requests still waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.pending_requests.lock().await.len()
    }

    /// Close the connection; pending requests fail with `ConnectionClosed`
    pub async fn close(&self) {
        self.pending_requests.lock().await.clear();
        self.shutdown.cancel();
    }
}
