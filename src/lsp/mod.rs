//! Language Server Protocol client stack
//!
//! - **framing**: Content-Length framing over any [`crate::io::Transport`]
//! - **protocol**: JSON-RPC 2.0 correlation, cancellation and connection status
//! - **client**: handshake, shutdown and typed request forwarding

pub mod client;
pub mod framing;
pub mod jsonrpc_utils;
pub mod protocol;

pub use client::{LspClient, LspError};
pub use protocol::{ConnectionStatus, JsonRpcClient, JsonRpcError};
