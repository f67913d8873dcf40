//! Transport layer - Pure I/O abstraction for message exchange
//!
//! This module provides the core transport abstraction that handles
//! bidirectional message exchange without knowledge of message format,
//! process management or of the kind of stream underneath (child stdio,
//! TCP socket, Unix domain socket or Windows named pipe).

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for stream reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity for UTF-8 accumulation buffer
const UTF8_ACCUMULATION_BUFFER_CAPACITY: usize = 8192;

/// Error types shared by every transport implementation
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Invalid message frame: {0}")]
    InvalidFrame(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[cfg(test)]
    #[error("No more responses available")]
    NoMoreResponses,
}

/// Core transport trait for bidirectional message exchange
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message (raw string)
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Receive a message (raw string)
    async fn receive(&mut self) -> Result<String, TransportError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

/// Type-erased transport, as handed out by connectors
pub type BoxedTransport = Box<dyn Transport>;

#[async_trait]
impl Transport for BoxedTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        (**self).receive().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

// ============================================================================
// Stream Transport Implementation
// ============================================================================

/// Transport over any pair of async byte streams
///
/// A writer task drains an outbound channel into the write half and a reader
/// task pushes UTF-8 chunks from the read half into an inbound channel, so
/// `send`/`receive` never block each other.
#[derive(Debug)]
pub struct StreamTransport {
    /// Channel for sending messages to the write half
    writer_sender: Option<mpsc::UnboundedSender<String>>,

    /// Channel for receiving chunks from the read half
    reader_receiver: Option<mpsc::UnboundedReceiver<String>>,

    /// Connection status
    connected: bool,
}

/// Internal state for the reader task that handles byte accumulation
struct ReaderState {
    /// Buffer for accumulating raw bytes before UTF-8 conversion
    byte_buffer: Vec<u8>,

    /// Buffer capacity to avoid frequent reallocations
    buffer_capacity: usize,
}

impl ReaderState {
    fn new() -> Self {
        Self {
            byte_buffer: Vec::with_capacity(UTF8_ACCUMULATION_BUFFER_CAPACITY),
            buffer_capacity: UTF8_ACCUMULATION_BUFFER_CAPACITY,
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.byte_buffer.extend_from_slice(bytes);
    }

    /// Extract the longest valid UTF-8 prefix in the buffer
    fn extract_valid_utf8(&mut self) -> Option<Vec<u8>> {
        if self.byte_buffer.is_empty() {
            return None;
        }

        match std::str::from_utf8(&self.byte_buffer) {
            Ok(_) => Some(self.byte_buffer.drain(..).collect()),
            Err(e) => {
                let valid_end = e.valid_up_to();
                if valid_end == 0 {
                    // Incomplete sequence, wait for more data
                    None
                } else {
                    Some(self.byte_buffer.drain(..valid_end).collect())
                }
            }
        }
    }

    fn compact(&mut self) {
        if self.byte_buffer.capacity() > self.buffer_capacity * 2 {
            self.byte_buffer.shrink_to(self.buffer_capacity);
        }
    }
}

impl StreamTransport {
    /// Create a transport from separate read and write halves
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_sender, writer_receiver) = mpsc::unbounded_channel();
        let (reader_sender, reader_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(writer, writer_receiver));
        tokio::spawn(Self::reader_task(reader, reader_sender));

        Self {
            writer_sender: Some(writer_sender),
            reader_receiver: Some(reader_receiver),
            connected: true,
        }
    }

    /// Create a transport from a child process' stdio pipes
    pub fn from_child(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::new(stdout, stdin)
    }

    /// Create a transport from a single bidirectional stream (socket, pipe)
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    async fn writer_task<W>(mut writer: W, mut receiver: mpsc::UnboundedReceiver<String>)
    where
        W: AsyncWrite + Send + Unpin,
    {
        while let Some(message) = receiver.recv().await {
            trace!(
                "StreamTransport: Writing message (length: {})",
                message.len()
            );

            if let Err(e) = writer.write_all(message.as_bytes()).await {
                error!("Failed to write to stream: {}", e);
                break;
            }

            if let Err(e) = writer.flush().await {
                error!("Failed to flush stream: {}", e);
                break;
            }
        }

        let _ = writer.shutdown().await;
        trace!("StreamTransport: writer task finished");
    }

    async fn reader_task<R>(reader: R, sender: mpsc::UnboundedSender<String>)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut state = ReaderState::new();
        let mut read_buffer = Box::new([0u8; READ_BUFFER_SIZE]);

        loop {
            match reader.read(read_buffer.as_mut()).await {
                Ok(0) => {
                    Self::handle_eof(&mut state, &sender);
                    break;
                }
                Ok(n) => {
                    state.add_bytes(&read_buffer[..n]);

                    while let Some(valid_bytes) = state.extract_valid_utf8() {
                        match String::from_utf8(valid_bytes) {
                            Ok(data) => {
                                if sender.send(data).is_err() {
                                    trace!("StreamTransport: receiver dropped, stopping reader");
                                    return;
                                }
                            }
                            Err(e) => {
                                error!("StreamTransport: Failed to convert validated UTF-8: {}", e);
                                break;
                            }
                        }
                    }

                    state.compact();
                }
                Err(e) => {
                    error!("Failed to read from stream: {}", e);
                    break;
                }
            }
        }

        trace!("StreamTransport: reader task finished");
    }

    fn handle_eof(state: &mut ReaderState, sender: &mpsc::UnboundedSender<String>) {
        trace!("StreamTransport: reader reached EOF");

        if let Some(final_bytes) = state.extract_valid_utf8() {
            match String::from_utf8(final_bytes) {
                Ok(final_string) => {
                    if !final_string.is_empty() && sender.send(final_string).is_err() {
                        trace!("StreamTransport: receiver dropped during EOF processing");
                    }
                }
                Err(e) => error!("StreamTransport: Invalid UTF-8 in final bytes: {}", e),
            }
        }

        if !state.byte_buffer.is_empty() {
            error!(
                "StreamTransport: {} incomplete bytes remaining at EOF",
                state.byte_buffer.len()
            );
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let sender = self
            .writer_sender
            .as_ref()
            .ok_or(TransportError::Disconnected)?;

        sender
            .send(message.to_string())
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let receiver = self
            .reader_receiver
            .as_mut()
            .ok_or(TransportError::Disconnected)?;

        match receiver.recv().await {
            Some(chunk) => Ok(chunk),
            None => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.writer_sender.take();
        self.reader_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

#[cfg(test)]
pub use mock::MockTransport;


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_transport_echo() {
        let mut child = Command::new("echo")
            .arg("hello world")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn echo command");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StreamTransport::from_child(stdin, stdout);

        let output = transport.receive().await.unwrap();
        assert_eq!(output.trim(), "hello world");
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_duplex_stream_round_trip() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let mut client = StreamTransport::from_stream(client_side);
        let mut server = StreamTransport::from_stream(server_side);

        client.send("ping").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), "ping");

        server.send("pong").await.unwrap();
        assert_eq!(client.receive().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_peer_close_disconnects_receiver() {
        let (client_side, server_side) = tokio::io::duplex(64);
        let mut client = StreamTransport::from_stream(client_side);
        drop(server_side);

        assert!(matches!(
            client.receive().await,
            Err(TransportError::Disconnected)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_boxed_transport_delegates() {
        let mut transport: BoxedTransport =
            Box::new(MockTransport::with_responses(vec!["reply".to_string()]));

        transport.send("request").await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), "reply");
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::NoMoreResponses)
        ));

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_mock_transport_disconnect() {
        let mut transport = MockTransport::new();
        transport.send("message").await.unwrap();
        assert_eq!(transport.sent_messages(), vec!["message"]);

        transport.close().await.unwrap();
        assert!(transport.send("test").await.is_err());
        assert!(transport.receive().await.is_err());
    }

    #[test]
    fn test_reader_state_split_utf8() {
        let mut state = ReaderState::new();

        state.add_bytes(&[0xE4, 0xB8]);
        assert!(state.extract_valid_utf8().is_none());

        state.add_bytes(&[0x96, b'!']);
        let extracted = state.extract_valid_utf8().expect("complete sequence");
        assert_eq!(String::from_utf8(extracted).unwrap(), "世!");
        assert!(state.byte_buffer.is_empty());
    }
}
