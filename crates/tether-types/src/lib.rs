//! Core types and contracts for the tether RPC link.
//!
//! This crate defines the shared data structures used by the protocol engine
//! in `tether-wire`: settings, the error taxonomy, the wire-safe error codec,
//! the replaceable logger contract, identifier generation, and the capability
//! descriptor exchanged during the handshake. It contains no protocol logic.

pub mod call;
pub mod capability;
pub mod config;
pub mod error;
pub mod logger;
pub mod rpc_error;
pub mod uid;

pub use call::CallKind;
pub use capability::Capability;
pub use config::{LinkSettings, RetryCurve};
pub use error::LinkError;
pub use logger::{Logger, LoggerHooks, LoggerSlot, TracingLogger};
pub use rpc_error::{ErrorCodec, RpcError};
pub use uid::{SequentialUid, UidGenerator};
