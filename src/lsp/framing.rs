//! LSP message framing layer
//!
//! Wraps a raw transport with Content-Length header framing:
//! `Content-Length: <length>\r\n\r\n<content>`

use crate::io::transport::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::trace;

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

const HEADER_SEPARATOR: &str = "\r\n\r\n";

/// Content-Length framing over any transport
///
/// The inner transport hands out arbitrary UTF-8 chunks; this wrapper turns
/// them into whole JSON-RPC payloads and frames outbound payloads.
pub struct LspFraming<T: Transport> {
    transport: T,

    /// Buffer for accumulating partial messages
    receive_buffer: String,

    /// Complete messages not yet handed out
    message_queue: VecDeque<String>,
}

impl<T: Transport> LspFraming<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: String::new(),
            message_queue: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Content-Length counts bytes, not chars
    pub fn frame(message: &str) -> String {
        format!("Content-Length: {}{HEADER_SEPARATOR}{}", message.len(), message)
    }

    /// Returns Some(message) if a complete message was parsed, None if more
    /// data is needed.
    fn try_parse_message(&mut self) -> Result<Option<String>, TransportError> {
        let Some(header_end) = self.receive_buffer.find(HEADER_SEPARATOR) else {
            return Ok(None);
        };

        let content_start = header_end + HEADER_SEPARATOR.len();
        let content_length = parse_content_length(&self.receive_buffer[..header_end])?;

        let available_content = self.receive_buffer.len() - content_start;
        if available_content < content_length {
            trace!(
                "LspFraming: Incomplete message - need {} more bytes",
                content_length - available_content
            );
            return Ok(None);
        }

        let content_end = content_start + content_length;
        let message = self
            .receive_buffer
            .get(content_start..content_end)
            .ok_or_else(|| {
                TransportError::InvalidFrame(
                    "Content-Length does not end on a character boundary".to_string(),
                )
            })?
            .to_string();
        self.receive_buffer.drain(..content_end);

        trace!(
            "LspFraming: Parsed complete message ({} bytes)",
            content_length
        );
        Ok(Some(message))
    }

    async fn process_transport_data(&mut self) -> Result<(), TransportError> {
        let new_data = self.transport.receive().await?;
        self.receive_buffer.push_str(&new_data);

        while let Some(message) = self.try_parse_message()? {
            self.message_queue.push_back(message);
        }

        Ok(())
    }
}

fn parse_content_length(header: &str) -> Result<usize, TransportError> {
    for line in header.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("Content-Length") {
            continue;
        }

        let value = value.trim();
        let length = value
            .parse::<usize>()
            .map_err(|_| TransportError::InvalidFrame(format!("invalid content length: {value}")))?;

        if length > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        return Ok(length);
    }

    Err(TransportError::InvalidFrame(
        "Missing Content-Length header".to_string(),
    ))
}

#[async_trait]
impl<T: Transport> Transport for LspFraming<T> {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        trace!(
            "LspFraming: Sending framed message ({} bytes content)",
            message.len()
        );
        self.transport.send(&Self::frame(message)).await
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(message) = self.message_queue.pop_front() {
                return Ok(message);
            }
            self.process_transport_data().await?;
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.transport.close().await
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
