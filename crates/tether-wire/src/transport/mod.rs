//! Transport contract — the duplex message channel a link runs over.
//!
//! A transport moves opaque UTF-8 strings. It does not need to be reliable:
//! the handshake retries until acknowledged, and calls can be bounded with
//! acknowledgement timeouts. Two implementations ship with the crate:
//!
//! - [`memory::pair`] connects two in-process endpoints.
//! - [`stream::StreamTransport`] frames messages over any byte stream
//!   (TCP sockets, pipes, `tokio::io::duplex`).

pub mod memory;
pub mod stream;

use std::sync::Arc;
use thiserror::Error;

/// Receives every inbound message as raw text.
pub type InboundHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// A duplex message channel.
///
/// A link calls [`Transport::on`] exactly once when it is created and
/// [`Transport::off`] (if implemented) when it is destroyed.
pub trait Transport: Send + Sync + 'static {
    /// Install the handler for inbound messages.
    fn on(&self, handler: InboundHandler);

    /// Send one message to the peer.
    fn emit(&self, raw: String) -> Result<(), TransportError>;

    /// Detach the inbound handler. Optional.
    fn off(&self) {}
}

impl<T: Transport> Transport for Arc<T> {
    fn on(&self, handler: InboundHandler) {
        (**self).on(handler)
    }

    fn emit(&self, raw: String) -> Result<(), TransportError> {
        (**self).emit(raw)
    }

    fn off(&self) {
        (**self).off()
    }
}
