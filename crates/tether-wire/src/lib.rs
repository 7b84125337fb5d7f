//! Tether wire protocol — bidirectional RPC over any duplex message channel.
//!
//! Each side of a link exposes local procedures and receives a tree of
//! proxies mirroring what the peer exposes, callable in four styles:
//! `invoke`, `promise`, `callback` and `listen`/`ignore`.
//!
//! ## Architecture
//!
//! - **Link**: Handshake/readiness state machine and inbound dispatch
//! - **PendingCalls**: Correlates replies with waiting callers
//! - **RemoteProcedure**: Proxy for one peer procedure
//! - **RemoteTree**: Mirror of the peer's capability descriptor
//! - **Envelope**: JSON dialect messages
//! - **Transport**: Duplex channel the link runs over

pub mod config;
pub mod expose;
pub mod link;
pub mod message;
pub mod pending;
pub mod procedure;
pub mod promise;
pub mod retry;
pub mod transport;
pub mod tree;

pub use config::{LinkConfig, ValidatedConfig};
pub use expose::{Api, Continuation, Exposable, Notifier, Procedure};
pub use link::{Link, LinkState, LinkStatus};
pub use message::{Envelope, EnvelopeType};
pub use pending::{FlushHandler, PendingCall};
pub use procedure::RemoteProcedure;
pub use promise::{Deferred, OneshotAdapter, Promise, PromiseAdapter};
pub use transport::{InboundHandler, Transport, TransportError};
pub use tree::{RemoteNode, RemoteTree};
