//! Logger contract — the replaceable sink for protocol diagnostics.
//!
//! Protocol errors (malformed envelopes, unknown correlation ids, missing
//! flush handlers) and serialization failures are reported through the
//! *active* [`Logger`] of a link rather than raised. The default
//! [`TracingLogger`] forwards to `tracing`; hosts can swap in their own sink
//! at runtime through a [`LoggerSlot`].

use serde_json::Value;
use std::sync::{Arc, RwLock};

/// A log sink with the five levels every link expects.
pub trait Logger: Send + Sync {
    /// Verbose diagnostics.
    fn log(&self, message: &str, context: &[Value]);
    /// Informational events.
    fn info(&self, message: &str, context: &[Value]);
    /// Report `message` when `condition` does not hold.
    fn assert(&self, condition: bool, message: &str);
    /// Recoverable anomalies.
    fn warn(&self, message: &str, context: &[Value]);
    /// Protocol and serialization errors.
    fn error(&self, message: &str, context: &[Value]);
}

/// Default logger: forwards every level to `tracing` under target `tether`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

fn render(context: &[Value]) -> String {
    match context {
        [] => String::new(),
        values => Value::Array(values.to_vec()).to_string(),
    }
}

impl Logger for TracingLogger {
    fn log(&self, message: &str, context: &[Value]) {
        tracing::debug!(target: "tether", context = %render(context), "{message}");
    }

    fn info(&self, message: &str, context: &[Value]) {
        tracing::info!(target: "tether", context = %render(context), "{message}");
    }

    fn assert(&self, condition: bool, message: &str) {
        if !condition {
            tracing::error!(target: "tether", "assertion failed: {message}");
        }
    }

    fn warn(&self, message: &str, context: &[Value]) {
        tracing::warn!(target: "tether", context = %render(context), "{message}");
    }

    fn error(&self, message: &str, context: &[Value]) {
        tracing::error!(target: "tether", context = %render(context), "{message}");
    }
}

/// A level hook taking a message and structured context.
pub type LogHook = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// The assertion hook.
pub type AssertHook = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// A candidate logger assembled from individual hooks.
///
/// Unlike a [`Logger`] implementation, a candidate may be incomplete; it only
/// becomes a logger once all five hooks are present (see
/// [`LoggerHooks::into_logger`]).
#[derive(Clone, Default)]
pub struct LoggerHooks {
    pub log: Option<LogHook>,
    pub info: Option<LogHook>,
    pub assert: Option<AssertHook>,
    pub warn: Option<LogHook>,
    pub error: Option<LogHook>,
}

impl LoggerHooks {
    /// An empty candidate.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, f: impl Fn(&str, &[Value]) + Send + Sync + 'static) -> Self {
        self.log = Some(Arc::new(f));
        self
    }

    pub fn with_info(mut self, f: impl Fn(&str, &[Value]) + Send + Sync + 'static) -> Self {
        self.info = Some(Arc::new(f));
        self
    }

    pub fn with_assert(mut self, f: impl Fn(bool, &str) + Send + Sync + 'static) -> Self {
        self.assert = Some(Arc::new(f));
        self
    }

    pub fn with_warn(mut self, f: impl Fn(&str, &[Value]) + Send + Sync + 'static) -> Self {
        self.warn = Some(Arc::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(&str, &[Value]) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Whether every level has a hook.
    pub fn is_complete(&self) -> bool {
        self.log.is_some()
            && self.info.is_some()
            && self.assert.is_some()
            && self.warn.is_some()
            && self.error.is_some()
    }

    /// Turn the candidate into a logger, or `None` if any hook is missing.
    pub fn into_logger(self) -> Option<Arc<dyn Logger>> {
        Some(Arc::new(HookLogger {
            log: self.log?,
            info: self.info?,
            assert: self.assert?,
            warn: self.warn?,
            error: self.error?,
        }))
    }
}

struct HookLogger {
    log: LogHook,
    info: LogHook,
    assert: AssertHook,
    warn: LogHook,
    error: LogHook,
}

impl Logger for HookLogger {
    fn log(&self, message: &str, context: &[Value]) {
        (self.log)(message, context)
    }

    fn info(&self, message: &str, context: &[Value]) {
        (self.info)(message, context)
    }

    fn assert(&self, condition: bool, message: &str) {
        (self.assert)(condition, message)
    }

    fn warn(&self, message: &str, context: &[Value]) {
        (self.warn)(message, context)
    }

    fn error(&self, message: &str, context: &[Value]) {
        (self.error)(message, context)
    }
}

/// Shared, swappable handle to the active logger of one link.
#[derive(Clone)]
pub struct LoggerSlot {
    current: Arc<RwLock<Arc<dyn Logger>>>,
}

impl LoggerSlot {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            current: Arc::new(RwLock::new(logger)),
        }
    }

    /// The currently installed logger.
    pub fn get(&self) -> Arc<dyn Logger> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*current)
    }

    /// Replace the installed logger unconditionally.
    pub fn set(&self, logger: Arc<dyn Logger>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = logger;
    }

    /// Install a candidate if it is complete. Returns whether it was installed;
    /// on `false` the previous logger stays active.
    pub fn replace(&self, candidate: LoggerHooks) -> bool {
        match candidate.into_logger() {
            Some(logger) => {
                self.set(logger);
                true
            }
            None => false,
        }
    }
}

impl Default for LoggerSlot {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger))
    }
}

impl std::fmt::Debug for LoggerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerSlot").finish_non_exhaustive()
    }
}
