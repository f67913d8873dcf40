//! High-level LSP client
//!
//! Typed API over [`JsonRpcClient`]: the initialize/initialized handshake,
//! shutdown/exit, and request forwarding for custom server methods.

use crate::lsp::jsonrpc_utils;
use crate::lsp::protocol::{
    ConnectionStatus, JsonRpcClient, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    RequestHandler,
};
use lsp_types::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, InitializedParams,
    LogMessageParams, ShowMessageParams, Uri, WindowClientCapabilities,
    WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// LSP Client Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("LSP client not initialized")]
    NotInitialized,

    #[error("LSP protocol error: {0}")]
    Protocol(String),

    #[error(
        "LSP request timeout: {method} - consider using a longer timeout or checking server responsiveness"
    )]
    RequestTimeout { method: String },
}

impl LspError {
    fn from_rpc(method: &str, error: JsonRpcError) -> Self {
        match error {
            JsonRpcError::Timeout => LspError::RequestTimeout {
                method: method.to_string(),
            },
            other => LspError::JsonRpc(other),
        }
    }
}

// ============================================================================
// Server-initiated requests
// ============================================================================

/// Answers the server-to-client requests a session server is known to send
///
/// Progress tokens and capability registrations are acknowledged,
/// configuration lookups get one `null` per requested item, the rest is
/// rejected with MethodNotFound.
pub fn default_request_handler() -> RequestHandler {
    Arc::new(|request: &JsonRpcRequest| -> JsonRpcResponse {
        let id = request.id.clone();
        match request.method.as_str() {
            "window/workDoneProgress/create"
            | "client/registerCapability"
            | "client/unregisterCapability"
            | "window/showMessageRequest" => jsonrpc_utils::null_success_response(id),
            "workspace/configuration" => {
                let items = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("items"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                jsonrpc_utils::success_response(id, Value::Array(vec![Value::Null; items]))
            }
            method => {
                debug!("Rejecting unsupported server request: {}", method);
                jsonrpc_utils::method_not_found_response(id, method)
            }
        }
    })
}

// ============================================================================
// High-level LSP Client
// ============================================================================

/// LSP client over any transport
///
/// The handshake result lives in a write-once slot so readiness can be
/// polled without touching the connection.
pub struct LspClient {
    rpc_client: JsonRpcClient,

    /// Filled once `initialize` succeeded and `initialized` was sent
    handshake: Arc<OnceLock<InitializeResult>>,
}

impl LspClient {
    pub fn new(rpc_client: JsonRpcClient) -> Self {
        Self {
            rpc_client,
            handshake: Arc::new(OnceLock::new()),
        }
    }

    /// Build initialize params for a single workspace root
    #[allow(deprecated)]
    pub fn initialize_params(root_uri: &Uri, workspace_name: &str) -> InitializeParams {
        InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(root_uri.clone()),
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root_uri.clone(),
                name: workspace_name.to_string(),
            }]),
            capabilities: ClientCapabilities {
                workspace: Some(WorkspaceClientCapabilities {
                    workspace_folders: Some(true),
                    configuration: Some(true),
                    ..Default::default()
                }),
                window: Some(WindowClientCapabilities {
                    work_done_progress: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            },
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        }
    }

    /// Install the default server-request handler and forward
    /// `window/logMessage` / `window/showMessage` text to `log_line`
    pub async fn install_handlers<F>(&self, log_line: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.rpc_client.on_request(default_request_handler()).await;
        self.rpc_client
            .on_notification(move |notification| {
                let params = notification.params.unwrap_or(Value::Null);
                let text = match notification.method.as_str() {
                    "window/logMessage" => serde_json::from_value::<LogMessageParams>(params)
                        .map(|p| p.message)
                        .ok(),
                    "window/showMessage" => serde_json::from_value::<ShowMessageParams>(params)
                        .map(|p| p.message)
                        .ok(),
                    _ => None,
                };
                if let Some(text) = text {
                    log_line(text);
                }
            })
            .await;
    }

    /// Perform the handshake and wait for it
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, LspError> {
        Self::run_handshake(&self.rpc_client, &self.handshake, params).await
    }

    /// Run the handshake in the background
    ///
    /// Progress is observable through [`Self::handshake_result`] and
    /// [`Self::status`]; a failure marks the connection as failed.
    pub fn start_handshake(&self, params: InitializeParams) {
        let rpc_client = self.rpc_client.clone();
        let handshake = Arc::clone(&self.handshake);

        tokio::spawn(async move {
            if let Err(e) = Self::run_handshake(&rpc_client, &handshake, params).await {
                warn!("LSP handshake failed: {}", e);
                rpc_client.mark_failed(e.to_string());
            }
        });
    }

    async fn run_handshake(
        rpc_client: &JsonRpcClient,
        handshake: &OnceLock<InitializeResult>,
        params: InitializeParams,
    ) -> Result<InitializeResult, LspError> {
        if handshake.get().is_some() {
            return Err(LspError::Protocol("Client already initialized".to_string()));
        }

        info!("Initializing LSP client");
        let result: InitializeResult = rpc_client
            .request("initialize", Some(params))
            .await
            .map_err(|e| LspError::from_rpc("initialize", e))?;

        debug!("LSP server capabilities: {:?}", result.capabilities);

        rpc_client
            .notify("initialized", Some(InitializedParams {}))
            .await?;

        handshake
            .set(result.clone())
            .map_err(|_| LspError::Protocol("Handshake completed twice".to_string()))?;
        info!("LSP client initialized successfully");

        Ok(result)
    }

    /// Handshake result, once available
    pub fn handshake_result(&self) -> Option<&InitializeResult> {
        self.handshake.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.handshake.get().is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.rpc_client.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.rpc_client.subscribe_status()
    }

    /// Forward a request; fails if the handshake has not completed
    pub async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, LspError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if !self.is_initialized() {
            return Err(LspError::NotInitialized);
        }
        self.rpc_client
            .request(method, params)
            .await
            .map_err(|e| LspError::from_rpc(method, e))
    }

    /// Forward a request bound to a cancellation token
    pub async fn request_with_cancellation<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        token: &CancellationToken,
    ) -> Result<R, LspError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if !self.is_initialized() {
            return Err(LspError::NotInitialized);
        }
        self.rpc_client
            .request_with_cancellation(method, params, token)
            .await
            .map_err(|e| LspError::from_rpc(method, e))
    }

    /// Send `shutdown` then `exit`; a no-op before the handshake
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), LspError> {
        if !self.is_initialized() {
            return Ok(());
        }

        info!("Shutting down LSP client");
        let _: Value = self
            .rpc_client
            .request_with_timeout("shutdown", None::<Value>, timeout)
            .await
            .map_err(|e| LspError::from_rpc("shutdown", e))?;

        self.rpc_client.notify("exit", None::<Value>).await?;
        info!("LSP client shutdown complete");
        Ok(())
    }

    /// Close the connection (does not stop an external process)
    pub async fn close(&self) {
        self.rpc_client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::{StreamTransport, Transport};
    use crate::lsp::framing::LspFraming;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connected_pair() -> (LspClient, LspFraming<StreamTransport>) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let client = LspClient::new(JsonRpcClient::new(StreamTransport::from_stream(
            client_side,
        )));
        let peer = LspFraming::new(StreamTransport::from_stream(server_side));
        (client, peer)
    }

    async fn next_json(peer: &mut LspFraming<StreamTransport>) -> Value {
        serde_json::from_str(&peer.receive().await.unwrap()).unwrap()
    }

    fn root() -> Uri {
        "file:///work/project".parse().unwrap()
    }

    #[test]
    fn test_initialize_params_carry_workspace_folder() {
        let params = LspClient::initialize_params(&root(), "project");
        let value = serde_json::to_value(&params).unwrap();

        assert_eq!(value["rootUri"], "file:///work/project");
        assert_eq!(value["workspaceFolders"][0]["name"], "project");
        assert_eq!(value["clientInfo"]["name"], env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn test_default_request_handler() {
        let handler = default_request_handler();
        let request = |method: &str, params: Option<Value>| JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: json!(1),
            method: method.to_string(),
            params,
        };

        let progress = handler(&request("window/workDoneProgress/create", None));
        assert!(progress.error.is_none());

        let config = handler(&request(
            "workspace/configuration",
            Some(json!({"items": [{"section": "a"}, {"section": "b"}]})),
        ));
        assert_eq!(config.result, Some(json!([null, null])));

        let unknown = handler(&request("custom/unknown", None));
        assert_eq!(
            unknown.error.map(|e| e.code),
            Some(jsonrpc_utils::error_codes::METHOD_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_background_handshake_fills_slot() {
        let (client, mut peer) = connected_pair();
        client.start_handshake(LspClient::initialize_params(&root(), "project"));
        assert!(client.handshake_result().is_none());

        let initialize = next_json(&mut peer).await;
        assert_eq!(initialize["method"], "initialize");
        let reply = json!({"jsonrpc": "2.0", "id": initialize["id"], "result": {"capabilities": {}}});
        peer.send(&reply.to_string()).await.unwrap();

        let initialized = next_json(&mut peer).await;
        assert_eq!(initialized["method"], "initialized");

        for _ in 0..100 {
            if client.is_initialized() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.handshake_result().is_some());
    }

    #[tokio::test]
    async fn test_rejected_handshake_marks_failed() {
        let (client, mut peer) = connected_pair();
        let mut status = client.subscribe_status();
        client.start_handshake(LspClient::initialize_params(&root(), "project"));

        let initialize = next_json(&mut peer).await;
        let reply = json!({
            "jsonrpc": "2.0",
            "id": initialize["id"],
            "error": {"code": -32603, "message": "no python environment"}
        });
        peer.send(&reply.to_string()).await.unwrap();

        let failed = status
            .wait_for(|s| matches!(s, ConnectionStatus::Failed(_)))
            .await
            .unwrap()
            .clone();
        assert!(matches!(failed, ConnectionStatus::Failed(reason) if reason.contains("no python environment")));
        assert!(!client.is_initialized());
    }

    #[tokio::test]
    async fn test_request_before_handshake_is_rejected() {
        let (client, _peer) = connected_pair();
        let result: Result<Value, _> = client.request("x/y", Some(json!({}))).await;
        assert!(matches!(result, Err(LspError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_log_messages_are_forwarded() {
        let (client, mut peer) = connected_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .install_handlers(move |line| {
                let _ = tx.send(line);
            })
            .await;

        let log = json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"type": 3, "message": "indexing"}});
        peer.send(&log.to_string()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "indexing");
    }
}
