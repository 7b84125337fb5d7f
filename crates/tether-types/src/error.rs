//! Shared error types for the tether link.

use crate::rpc_error::RpcError;
use thiserror::Error;

/// Top-level error type for a link and the calls issued through it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The link configuration was rejected during validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transport refused or failed to deliver an envelope.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The capability exchange never got acknowledged by the peer.
    #[error("Handshake failed after {attempts} attempts")]
    HandshakeFailed {
        /// How many `expose` announcements were sent.
        attempts: u32,
    },

    /// The call was still pending when the link flushed its registry.
    #[error("rpc flush {reason}")]
    Flushed {
        /// The reason given to `destroy`.
        reason: String,
    },

    /// No reply arrived within the maximum acknowledgement delay.
    #[error("No acknowledgement for {uid} within {waited_ms}ms")]
    AckTimeout {
        /// Correlation id of the expired call.
        uid: String,
        /// How long the call waited.
        waited_ms: u64,
    },

    /// The remote procedure itself failed.
    #[error("{0}")]
    Remote(RpcError),

    /// The link was destroyed before the operation could start.
    #[error("Link destroyed")]
    Destroyed,

    /// An envelope could not be encoded to JSON.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The link was constructed outside of an async runtime.
    #[error("No async runtime: {0}")]
    NoRuntime(String),

    /// The deferred backing a call was dropped without being settled.
    #[error("Call canceled before completion")]
    Canceled,
}

impl LinkError {
    /// The remote application error, if this is one.
    pub fn as_remote(&self) -> Option<&RpcError> {
        match self {
            LinkError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RpcError> for LinkError {
    fn from(err: RpcError) -> Self {
        LinkError::Remote(err)
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Encode(err.to_string())
    }
}
