//! Shared harness for the link integration tests.
//!
//! Links run over a real in-memory transport pair. Each side is wrapped in a
//! [`Tap`] so tests can push raw strings straight into the link's inbound
//! handler, and logs into a [`RecordingLogger`] so protocol errors can be
//! counted.

#![allow(dead_code)]

use serde_json::Value;
use std::sync::{Arc, Mutex, Once, RwLock};
use tether_types::{LinkSettings, Logger, LoggerHooks};
use tether_wire::transport::memory::{self, MemoryTransport};
use tether_wire::{Api, InboundHandler, Link, LinkConfig, Transport, TransportError};

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

static TRACING: Once = Once::new();

/// Route `tracing` output into the test harness (`RUST_LOG` filters it).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Recording logger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Log,
    Info,
    Assert,
    Warn,
    Error,
}

/// Logger that keeps every line it receives.
#[derive(Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<(Level, String, Vec<Value>)>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, level: Level, message: &str, context: &[Value]) {
        self.lines
            .lock()
            .unwrap()
            .push((level, message.to_string(), context.to_vec()));
    }

    pub fn count(&self, level: Level) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _, _)| *l == level)
            .count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _, _)| *l == Level::Error)
            .map(|(_, m, _)| m.clone())
            .collect()
    }

    /// Context of the first error whose message contains `needle`.
    pub fn error_context(&self, needle: &str) -> Option<Vec<Value>> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .find(|(l, m, _)| *l == Level::Error && m.contains(needle))
            .map(|(_, _, c)| c.clone())
    }

    /// The same sink, assembled from individual hooks.
    pub fn hooks(self: &Arc<Self>) -> LoggerHooks {
        let (log, info, assert, warn, error) = (
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
        );
        LoggerHooks::new()
            .with_log(move |m: &str, c: &[Value]| log.push(Level::Log, m, c))
            .with_info(move |m: &str, c: &[Value]| info.push(Level::Info, m, c))
            .with_assert(move |ok: bool, m: &str| {
                if !ok {
                    assert.push(Level::Assert, m, &[])
                }
            })
            .with_warn(move |m: &str, c: &[Value]| warn.push(Level::Warn, m, c))
            .with_error(move |m: &str, c: &[Value]| error.push(Level::Error, m, c))
    }
}

impl Logger for RecordingLogger {
    fn log(&self, message: &str, context: &[Value]) {
        self.push(Level::Log, message, context)
    }

    fn info(&self, message: &str, context: &[Value]) {
        self.push(Level::Info, message, context)
    }

    fn assert(&self, condition: bool, message: &str) {
        if !condition {
            self.push(Level::Assert, message, &[])
        }
    }

    fn warn(&self, message: &str, context: &[Value]) {
        self.push(Level::Warn, message, context)
    }

    fn error(&self, message: &str, context: &[Value]) {
        self.push(Level::Error, message, context)
    }
}

// ---------------------------------------------------------------------------
// Tap transport
// ---------------------------------------------------------------------------

/// A memory endpoint that also remembers the link's inbound handler.
pub struct Tap {
    inner: MemoryTransport,
    handler: RwLock<Option<InboundHandler>>,
}

impl Tap {
    pub fn new(inner: MemoryTransport) -> Arc<Self> {
        Arc::new(Self {
            inner,
            handler: RwLock::new(None),
        })
    }

    /// Deliver `raw` to the attached link as if the peer had sent it.
    /// Returns `false` when no link is attached.
    pub fn inject(&self, raw: &str) -> bool {
        let handler = self.handler.read().unwrap().clone();
        match handler {
            Some(handler) => {
                handler(raw.to_string());
                true
            }
            None => false,
        }
    }

    pub fn emitted(&self) -> u64 {
        self.inner.emitted()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_attached()
    }
}

impl Transport for Tap {
    fn on(&self, handler: InboundHandler) {
        *self.handler.write().unwrap() = Some(handler.clone());
        self.inner.on(handler);
    }

    fn emit(&self, raw: String) -> Result<(), TransportError> {
        self.inner.emit(raw)
    }

    fn off(&self) {
        *self.handler.write().unwrap() = None;
        self.inner.off();
    }
}

// ---------------------------------------------------------------------------
// Linked pairs
// ---------------------------------------------------------------------------

/// Settings with short handshake windows.
pub fn fast_settings() -> LinkSettings {
    LinkSettings {
        create_wait_ms: 10,
        create_max_wait_ms: 50,
        ..Default::default()
    }
}

/// One side of a pair.
pub struct Side {
    pub link: Link,
    pub tap: Arc<Tap>,
    pub logger: Arc<RecordingLogger>,
}

pub fn connect(tap: Arc<Tap>, settings: LinkSettings, api: Api) -> Side {
    let logger = RecordingLogger::new();
    let link = Link::connect(
        LinkConfig::new(tap.clone())
            .with_settings(settings)
            .with_logger(logger.clone()),
        api,
        None,
    )
    .unwrap();
    Side { link, tap, logger }
}

/// Two taps over one memory pair, nothing attached yet.
pub fn taps() -> (Arc<Tap>, Arc<Tap>) {
    let (a, b) = memory::pair().unwrap();
    (Tap::new(a), Tap::new(b))
}

/// Two ready links exposing `a_api` and `b_api` to each other.
pub async fn linked_with(settings: LinkSettings, a_api: Api, b_api: Api) -> (Side, Side) {
    init_tracing();
    let (ta, tb) = taps();
    let a = connect(ta, settings.clone(), a_api);
    let b = connect(tb, settings, b_api);
    a.link.ready().await.unwrap();
    b.link.ready().await.unwrap();
    (a, b)
}

pub async fn linked(a_api: Api, b_api: Api) -> (Side, Side) {
    linked_with(fast_settings(), a_api, b_api).await
}

/// Let the pump tasks deliver whatever is in flight.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
