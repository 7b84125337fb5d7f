//! Pending-call registry — correlates replies with waiting callers.
//!
//! One [`PendingCalls`] is owned by each link. Entries are keyed by the
//! correlation id of the call that created them and are consumed exactly
//! once, except `listen` entries which stay registered (and are invoked on
//! every matching reply) until they are removed explicitly.
//!
//! Handlers are always invoked after the entry has been released from the
//! map, so a handler may freely issue new calls through the same registry.
//!
//! A `listen` entry that is ignored leaves a tombstone behind until the
//! peer acknowledges the `ignore`, so events already in flight for it can
//! be told apart from replies nobody asked for.

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tether_types::{CallKind, LinkError, LoggerSlot};
use tokio::runtime::Handle;
use tracing::debug;

/// Success continuation of a pending call.
pub type ResultHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Failure continuation of a pending call.
pub type ErrorHandler = Arc<dyn Fn(LinkError) + Send + Sync>;

/// Per-convention routing of flushed entries.
pub type FlushHandler = Arc<dyn Fn(&PendingCall, LinkError) + Send + Sync>;

/// A caller waiting for a reply.
#[derive(Clone)]
pub struct PendingCall {
    pub id: String,
    pub kind: CallKind,
    on_result: ResultHandler,
    on_error: ErrorHandler,
}

impl PendingCall {
    pub fn succeed(&self, value: Value) {
        (self.on_result)(value)
    }

    pub fn fail(&self, err: LinkError) {
        (self.on_error)(err)
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn default_flush_handlers() -> HashMap<CallKind, FlushHandler> {
    CallKind::ALL
        .into_iter()
        .map(|kind| {
            let handler: FlushHandler = Arc::new(|call: &PendingCall, err: LinkError| call.fail(err));
            (kind, handler)
        })
        .collect()
}

/// Correlation table from call id to waiting caller.
#[derive(Clone)]
pub struct PendingCalls {
    entries: Arc<DashMap<String, PendingCall>>,
    retired: Arc<DashSet<String>>,
    flush_handlers: Arc<RwLock<HashMap<CallKind, FlushHandler>>>,
    logger: LoggerSlot,
}

impl PendingCalls {
    pub fn new(logger: LoggerSlot) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            retired: Arc::new(DashSet::new()),
            flush_handlers: Arc::new(RwLock::new(default_flush_handlers())),
            logger,
        }
    }

    /// Register a waiting caller. Returns `false` (and keeps the existing
    /// entry) if `id` is already outstanding.
    pub fn register(
        &self,
        id: &str,
        kind: CallKind,
        on_result: ResultHandler,
        on_error: ErrorHandler,
    ) -> bool {
        match self.entries.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.logger
                    .get()
                    .error("rpc: duplicate correlation id", &[Value::String(id.to_string())]);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    id: id.to_string(),
                    kind,
                    on_result,
                    on_error,
                });
                true
            }
        }
    }

    /// Take the entry for a reply. A `listen` entry is only cloned when
    /// `keep_listen` is set.
    fn claim(&self, id: &str, keep_listen: bool) -> Option<PendingCall> {
        let entry = self.entries.get(id).map(|e| e.value().clone())?;
        if keep_listen && entry.kind == CallKind::Listen {
            return Some(entry);
        }
        self.entries.remove(id).map(|(_, call)| call)
    }

    /// Deliver a successful reply. Returns `false` if nothing was waiting.
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        match self.claim(id, true) {
            Some(call) => {
                call.succeed(value);
                true
            }
            None => false,
        }
    }

    /// Deliver a failure. Returns `false` if nothing was waiting.
    /// A failure ends a `listen` entry too.
    pub fn reject(&self, id: &str, err: LinkError) -> bool {
        match self.claim(id, false) {
            Some(call) => {
                call.fail(err);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without notifying it.
    pub fn remove(&self, id: &str) -> Option<PendingCall> {
        self.entries.remove(id).map(|(_, call)| call)
    }

    /// Drop a `listen` entry and remember its id until [`forget_retired`]
    /// is called for it.
    ///
    /// [`forget_retired`]: PendingCalls::forget_retired
    pub fn retire(&self, id: &str) -> Option<PendingCall> {
        self.retired.insert(id.to_string());
        self.remove(id)
    }

    /// Whether `id` was retired and not yet forgotten.
    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains(id)
    }

    pub fn forget_retired(&self, id: &str) {
        self.retired.remove(id);
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of outstanding entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Route flushed entries of `kind` through `handler`.
    pub fn set_flush_handler(&self, kind: CallKind, handler: FlushHandler) {
        let mut handlers = self.flush_handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(kind, handler);
    }

    /// Remove the flush routing for `kind`. Flushed entries of that kind are
    /// then reported through the logger instead.
    pub fn clear_flush_handler(&self, kind: CallKind) {
        let mut handlers = self.flush_handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&kind);
    }

    /// Remove every entry, routing each to the flush handler of its kind.
    /// Returns the number of entries removed.
    pub fn flush(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        self.retired.clear();
        let handlers = {
            let guard = self.flush_handlers.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        let mut flushed = 0;
        for id in ids {
            let Some(call) = self.remove(&id) else {
                continue;
            };
            flushed += 1;
            match handlers.get(&call.kind) {
                Some(handler) => handler(
                    &call,
                    LinkError::Flushed {
                        reason: reason.to_string(),
                    },
                ),
                None => self.logger.get().error(
                    &format!("rpc: flush: no error handler registered for {}", call.kind),
                    &[Value::String(call.id.clone())],
                ),
            }
        }
        debug!(flushed, reason, "pending calls flushed");
        flushed
    }

    /// Fail `id` with [`LinkError::AckTimeout`] if it is still pending after
    /// `after`. `listen` entries are never expired.
    pub fn expire_after(&self, id: &str, after: Duration, runtime: &Handle) {
        let registry = self.clone();
        let id = id.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let expired = match registry.entries.get(&id) {
                Some(entry) => entry.kind != CallKind::Listen,
                None => false,
            };
            if expired {
                if let Some(call) = registry.remove(&id) {
                    debug!(uid = %id, "call expired without acknowledgement");
                    call.fail(LinkError::AckTimeout {
                        uid: id.clone(),
                        waited_ms: after.as_millis() as u64,
                    });
                }
            }
        });
    }
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tether_types::LoggerHooks;

    fn counting_logger() -> (LoggerSlot, Arc<AtomicUsize>) {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let slot = LoggerSlot::default();
        assert!(slot.replace(
            LoggerHooks::new()
                .with_log(|_, _| {})
                .with_info(|_, _| {})
                .with_assert(|_, _| {})
                .with_warn(|_, _| {})
                .with_error(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
        ));
        (slot, errors)
    }

    type Seen = Arc<Mutex<Vec<Result<Value, String>>>>;

    fn recorder() -> (ResultHandler, ErrorHandler, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let ok = seen.clone();
        let err = seen.clone();
        (
            Arc::new(move |v: Value| ok.lock().unwrap().push(Ok(v))),
            Arc::new(move |e: LinkError| err.lock().unwrap().push(Err(e.to_string()))),
            seen,
        )
    }

    #[test]
    fn test_resolve_consumes_once() {
        let registry = PendingCalls::new(LoggerSlot::default());
        let (ok, err, seen) = recorder();
        assert!(registry.register("a", CallKind::Invoke, ok, err));
        assert_eq!(registry.count(), 1);

        assert!(registry.resolve("a", Value::from(1)));
        assert!(!registry.resolve("a", Value::from(2)));
        assert!(!registry.reject("a", LinkError::Destroyed));
        assert_eq!(registry.count(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![Ok(Value::from(1))]);
    }

    #[test]
    fn test_listen_entries_persist() {
        let registry = PendingCalls::new(LoggerSlot::default());
        let (ok, err, seen) = recorder();
        registry.register("l", CallKind::Listen, ok, err);

        for n in 0..3 {
            assert!(registry.resolve("l", Value::from(n)));
        }
        assert_eq!(registry.count(), 1);
        assert_eq!(seen.lock().unwrap().len(), 3);

        assert!(registry.remove("l").is_some());
        assert!(!registry.resolve("l", Value::from(9)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_reject_ends_listen_entry() {
        let registry = PendingCalls::new(LoggerSlot::default());
        let (ok, err, seen) = recorder();
        registry.register("l", CallKind::Listen, ok, err);
        assert!(registry.resolve("l", Value::from(1)));

        assert!(registry.reject("l", LinkError::Destroyed));
        assert_eq!(registry.count(), 0);
        assert!(!registry.resolve("l", Value::from(2)));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_retired_ids_are_remembered_until_forgotten() {
        let registry = PendingCalls::new(LoggerSlot::default());
        let (ok, err, seen) = recorder();
        registry.register("l", CallKind::Listen, ok, err);

        assert!(registry.retire("l").is_some());
        assert!(!registry.contains("l"));
        assert!(registry.is_retired("l"));
        assert!(!registry.resolve("l", Value::from(1)));

        registry.forget_retired("l");
        assert!(!registry.is_retired("l"));

        registry.retire("gone");
        registry.flush("bye");
        assert!(!registry.is_retired("gone"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (logger, errors) = counting_logger();
        let registry = PendingCalls::new(logger);
        let (ok, err, _) = recorder();
        assert!(registry.register("d", CallKind::Promise, ok.clone(), err.clone()));
        assert!(!registry.register("d", CallKind::Promise, ok, err));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_flush_routes_every_entry() {
        let registry = PendingCalls::new(LoggerSlot::default());
        let (ok, err, seen) = recorder();
        for (id, kind) in [("1", CallKind::Invoke), ("2", CallKind::Callback), ("3", CallKind::Listen)] {
            registry.register(id, kind, ok.clone(), err.clone());
        }

        assert_eq!(registry.flush("bye"), 3);
        assert_eq!(registry.count(), 0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| r == &Err("rpc flush bye".to_string())));
    }

    #[test]
    fn test_flush_without_handler_is_logged() {
        let (logger, errors) = counting_logger();
        let registry = PendingCalls::new(logger);
        registry.clear_flush_handler(CallKind::Callback);
        let (ok, err, seen) = recorder();
        registry.register("p", CallKind::Promise, ok.clone(), err.clone());
        registry.register("c", CallKind::Callback, ok, err);

        assert_eq!(registry.flush("gone"), 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        // Only the promise entry reached its error handler.
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_custom_flush_handler() {
        let registry = PendingCalls::new(LoggerSlot::default());
        let routed = Arc::new(AtomicUsize::new(0));
        let counter = routed.clone();
        registry.set_flush_handler(
            CallKind::Invoke,
            Arc::new(move |_call: &PendingCall, _err: LinkError| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let (ok, err, seen) = recorder();
        registry.register("i", CallKind::Invoke, ok, err);
        registry.flush("x");
        assert_eq!(routed.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_may_reenter_registry() {
        let registry = PendingCalls::new(LoggerSlot::default());
        let inner = registry.clone();
        let (ok, err, seen) = recorder();
        let reenter: ResultHandler = Arc::new(move |_: Value| {
            inner.register("second", CallKind::Invoke, ok.clone(), err.clone());
        });
        registry.register("first", CallKind::Invoke, reenter, Arc::new(|_: LinkError| {}));
        assert!(registry.resolve("first", Value::Null));
        assert!(registry.contains("second"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_after_rejects_with_timeout() {
        let registry = PendingCalls::new(LoggerSlot::default());
        let (ok, err, seen) = recorder();
        registry.register("slow", CallKind::Promise, ok.clone(), err.clone());
        registry.register("sub", CallKind::Listen, ok, err);

        let runtime = Handle::current();
        registry.expire_after("slow", Duration::from_millis(50), &runtime);
        registry.expire_after("sub", Duration::from_millis(50), &runtime);
        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;

        assert!(!registry.contains("slow"));
        assert!(registry.contains("sub"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].as_ref().unwrap_err().contains("slow"));
    }
}
