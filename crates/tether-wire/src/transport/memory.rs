//! In-process transport pair.
//!
//! Each direction is an unbounded channel drained by a pump task that hands
//! messages to the receiving endpoint's handler in send order. Messages that
//! arrive while the receiver has no handler attached are dropped, which is
//! how an unreliable channel (a frame that has not loaded yet, a socket that
//! is still connecting) behaves.

use super::{InboundHandler, Transport, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

type HandlerSlot = Arc<RwLock<Option<InboundHandler>>>;

/// One end of an in-memory pair.
pub struct MemoryTransport {
    name: &'static str,
    handler: HandlerSlot,
    outbound: mpsc::UnboundedSender<String>,
    emitted: AtomicU64,
    pump: JoinHandle<()>,
}

impl MemoryTransport {
    /// Number of messages this endpoint has emitted.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Whether an inbound handler is attached.
    pub fn is_attached(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl Transport for MemoryTransport {
    fn on(&self, handler: InboundHandler) {
        let mut slot = self.handler.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    fn emit(&self, raw: String) -> Result<(), TransportError> {
        self.outbound
            .send(raw)
            .map_err(|_| TransportError::Closed)?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn off(&self) {
        let mut slot = self.handler.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("name", &self.name)
            .field("emitted", &self.emitted())
            .finish_non_exhaustive()
    }
}

fn spawn_pump(
    runtime: &Handle,
    mut rx: mpsc::UnboundedReceiver<String>,
    target: HandlerSlot,
    target_name: &'static str,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        while let Some(raw) = rx.recv().await {
            let handler = target.read().unwrap_or_else(|e| e.into_inner()).clone();
            match handler {
                Some(handler) => handler(raw),
                None => debug!(endpoint = target_name, "no handler attached, message dropped"),
            }
        }
    })
}

/// Create two connected endpoints. Must be called from within a tokio
/// runtime; the pump tasks run on it.
pub fn pair() -> Result<(MemoryTransport, MemoryTransport), TransportError> {
    let runtime =
        Handle::try_current().map_err(|e| TransportError::Unavailable(e.to_string()))?;

    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a_handler: HandlerSlot = Arc::new(RwLock::new(None));
    let b_handler: HandlerSlot = Arc::new(RwLock::new(None));

    // a's outbound feeds b's handler and vice versa.
    let a_pump = spawn_pump(&runtime, a_rx, b_handler.clone(), "b");
    let b_pump = spawn_pump(&runtime, b_rx, a_handler.clone(), "a");

    Ok((
        MemoryTransport {
            name: "a",
            handler: a_handler,
            outbound: a_tx,
            emitted: AtomicU64::new(0),
            pump: a_pump,
        },
        MemoryTransport {
            name: "b",
            handler: b_handler,
            outbound: b_tx,
            emitted: AtomicU64::new(0),
            pump: b_pump,
        },
    ))
}
