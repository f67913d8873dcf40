//! JSON-RPC 2.0 protocol utilities
//!
//! Constants and response builders, as per https://www.jsonrpc.org/specification

use crate::lsp::protocol::{JsonRpcErrorObject, JsonRpcResponse};
use serde_json::Value;

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 and LSP error codes
pub mod error_codes {
    /// Parse error - Invalid JSON was received by the server.
    pub const PARSE_ERROR: i32 = -32700;

    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;

    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;

    /// LSP: the request was cancelled by the client
    pub const REQUEST_CANCELLED: i32 = -32800;
}

/// Create a successful JSON-RPC response
pub fn success_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: Some(result),
        error: None,
    }
}

/// Create a JSON-RPC error response
pub fn error_response(
    id: Value,
    code: i32,
    message: String,
    data: Option<Value>,
) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: None,
        error: Some(JsonRpcErrorObject {
            code,
            message,
            data,
        }),
    }
}

pub fn method_not_found_response(id: Value, method: &str) -> JsonRpcResponse {
    error_response(
        id,
        error_codes::METHOD_NOT_FOUND,
        format!("Method not found: {}", method),
        None,
    )
}

/// Create a null success response (for requests that return void)
pub fn null_success_response(id: Value) -> JsonRpcResponse {
    success_response(id, Value::Null)
}

/// Numeric request id, accepting ids that servers echo back as strings
pub fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
