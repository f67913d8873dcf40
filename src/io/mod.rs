//! I/O layer - Generic abstractions for process management and transport
//!
//! - **Transport**: Pure I/O layer for bidirectional message exchange over
//!   child stdio, sockets or pipes
//! - **Process**: External process lifecycle management with output monitoring
//!
//! Nothing here knows about JSON-RPC or language servers.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, ProcessStdio, StderrMonitor, StopMode,
};
pub use transport::{BoxedTransport, StreamTransport, Transport, TransportError};
