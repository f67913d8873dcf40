//! Per-workspace language server sessions
//!
//! Starts one language server session per workspace root on demand, waits
//! for its handshake, forwards requests to it and tears it down again when
//! the workspace, its configuration or the interpreter changes.

pub mod io;
pub mod logging;
pub mod lsp;
pub mod server;
pub mod workspace;

#[cfg(test)]
mod test_utils;

pub use server::{SessionError, SessionState};
pub use workspace::{RequestDispatcher, RequestOutcome, SessionRegistry};
