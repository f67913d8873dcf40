//! Server sessions
//!
//! Everything about one language-server connection: how the server is
//! configured, resolved and reached, the session state machine that owns the
//! connection, and the waiter that decides when a started session is usable.
//!
//! # Architecture
//!
//! - **TransportFactory**: workspace settings -> [`ConnectionDescriptor`]
//! - **Connector**: descriptor -> live connection (process + transport)
//! - **Session**: lifecycle state, restart policy, request forwarding
//! - **InitializationWaiter**: bounded handshake polling

pub mod config;
pub mod error;
pub mod factory;
pub mod output;
pub mod resolver;
pub mod session;
pub mod waiter;

#[cfg(test)]
pub mod testing;

pub use crate::server::config::{
    ConfigurationProvider, ServerSettings, SessionTimings, StaticConfiguration, TransportMode,
};
pub use crate::server::error::{ConfigError, SessionError};
pub use crate::server::factory::{
    ConnectOptions, Connection, ConnectionDescriptor, Connector, ProcessConnector,
    TransportFactory,
};
pub use crate::server::output::{OutputSink, OutputSinks, TracingOutputSink};
pub use crate::server::resolver::{ExecutableResolver, ServerCommand, StaticExecutableResolver};
pub use crate::server::session::{CloseObserver, Session, SessionInfo, SessionState};
pub use crate::server::waiter::{InitializationWaiter, WaitOutcome};
