//! Workspace-level session management
//!
//! - **folders**: open roots, workspace keys, resource -> root resolution
//! - **registry**: one session per root behind a single lifecycle gate
//! - **dispatcher**: resource-addressed request forwarding with cancellation
//! - **notifier**: session events and refresh triggers
//! - **types**: payloads of the forwarded requests

pub mod dispatcher;
pub mod folders;
pub mod notifier;
pub mod registry;
pub mod types;

pub use dispatcher::{RequestDispatcher, RequestOutcome};
pub use folders::{WorkspaceFolder, WorkspaceFolders, WorkspaceKey};
pub use notifier::{ChangeNotifier, RefreshTrigger, SessionEvent, refresh_channel};
pub use registry::{SessionRegistry, SessionRegistryBuilder, TeardownSummary};
