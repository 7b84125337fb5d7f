//! Link engine — one configured RPC connection over a transport.
//!
//! A [`Link`] owns the readiness state machine
//! (`Created → Handshaking → Ready → Destroyed`), the local exposed
//! registry, the mirror of the peer's capabilities, the pending-call
//! registry and the listeners the peer has subscribed. Inbound messages are
//! dispatched one at a time from the transport's delivery callback; protocol
//! errors are reported through the active logger and never escape into the
//! transport.
//!
//! The handshake announces the local descriptor with an `expose` envelope
//! and retries (per the configured curve) until the peer acknowledges it.
//! Readiness is reached independently the first time the peer's own
//! descriptor arrives.

use crate::config::{LinkConfig, ValidatedConfig};
use crate::expose::{Continuation, Exposable, ExposedRegistry, Notifier, Procedure};
use crate::message::{decode_envelope, entry_uid, Envelope, EnvelopeType, Invocation};
use crate::pending::{PendingCall, PendingCalls};
use crate::procedure::{Outbox, RemoteProcedure};
use crate::retry::{retry_async, RetryOutcome, RetryPolicy};
use crate::tree::RemoteTree;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tether_types::{
    CallKind, Capability, ErrorCodec, LinkError, Logger, LoggerHooks, LoggerSlot, RpcError,
};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Created,
    Handshaking,
    Ready,
    /// Terminal.
    Destroyed,
}

/// Diagnostic snapshot of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Outstanding pending-call entries (including live subscriptions).
    pub result_callbacks: usize,
    /// Ids of the peer's active subscriptions on this side, sorted.
    pub listener_ids: Vec<String>,
    /// `on_ready` callbacks still waiting for readiness.
    pub ready_queue: usize,
    pub state: LinkState,
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    state: LinkState,
    handshake_failed_after: Option<u32>,
}

type ReadyCallback = Box<dyn FnOnce() + Send>;
type DestroyCallback = Box<dyn FnOnce(&str) + Send>;

struct ListenerEntry {
    path: String,
    active: Arc<AtomicBool>,
}

#[derive(Debug)]
enum HandshakeError {
    NotAcknowledged,
    Send(LinkError),
    Gone,
}

struct LinkInner {
    config: Arc<ValidatedConfig>,
    outbox: Arc<Outbox>,
    logger: LoggerSlot,
    exposed: RwLock<ExposedRegistry>,
    /// Extra leaves announced on top of the exposed registry.
    advertised: Capability,
    remote: RemoteTree,
    listeners: DashMap<String, ListenerEntry>,
    progress: watch::Sender<Progress>,
    ready_queue: Mutex<Vec<ReadyCallback>>,
    on_destroy: Mutex<Vec<(u64, DestroyCallback)>>,
    next_callback_id: AtomicU64,
    destroy_reason: Mutex<Option<String>>,
    handshake_uid: String,
    handshake_acked: watch::Sender<bool>,
    reannounced: AtomicBool,
    handshake_task: Mutex<Option<JoinHandle<()>>>,
}

/// A bidirectional RPC link. Cheap to clone; clones share the link.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

// ---------------------------------------------------------------------------
// Construction & handshake
// ---------------------------------------------------------------------------

impl Link {
    /// Validate `config`, expose `local`, attach to the transport and start
    /// the handshake. `advertise` adds leaves to the announced descriptor
    /// beyond what `local` provides.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        config: LinkConfig,
        local: impl Into<Exposable>,
        advertise: Option<Capability>,
    ) -> Result<Link, LinkError> {
        let runtime = Handle::try_current().map_err(|e| LinkError::NoRuntime(e.to_string()))?;
        let config = config.validate()?;
        let settings = config.settings();

        let logger = LoggerSlot::new(config.logger());
        let pending = PendingCalls::new(logger.clone());
        let outbox = Arc::new(Outbox::new(
            config.transport(),
            config.uid(),
            pending,
            config.promise_adapter(),
            logger.clone(),
            runtime.clone(),
            settings.use_acks,
            config.max_ack_delay(),
            config.default_kind(),
        ));

        let mut exposed = ExposedRegistry::new();
        exposed.expose(local.into(), false);

        let handshake_uid = outbox.next_uid();
        let (progress, _) = watch::channel(Progress {
            state: LinkState::Created,
            handshake_failed_after: None,
        });
        let (handshake_acked, _) = watch::channel(false);

        let inner = Arc::new(LinkInner {
            config: config.clone(),
            outbox,
            logger,
            exposed: RwLock::new(exposed),
            advertised: advertise.unwrap_or_default(),
            remote: RemoteTree::new(),
            listeners: DashMap::new(),
            progress,
            ready_queue: Mutex::new(Vec::new()),
            on_destroy: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(0),
            destroy_reason: Mutex::new(None),
            handshake_uid,
            handshake_acked,
            reannounced: AtomicBool::new(false),
            handshake_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        config.transport().on(Arc::new(move |raw: String| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_inbound(&raw);
            }
        }));

        let _ = inner.progress.send_if_modified(|p| {
            if p.state == LinkState::Created {
                p.state = LinkState::Handshaking;
                true
            } else {
                false
            }
        });

        let policy = RetryPolicy::from_settings(settings);
        let task = runtime.spawn(handshake(
            Arc::downgrade(&inner),
            policy,
            config.handshake_window(),
            inner.handshake_acked.subscribe(),
        ));
        *inner
            .handshake_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        info!(handshake = %inner.handshake_uid, "link created");
        Ok(Link { inner })
    }
}

async fn handshake(
    weak: Weak<LinkInner>,
    policy: RetryPolicy,
    window: Duration,
    acked: watch::Receiver<bool>,
) {
    let outcome = retry_async(
        &policy,
        |attempt| {
            let weak = weak.clone();
            let mut acked = acked.clone();
            async move {
                if *acked.borrow() {
                    return Ok(());
                }
                {
                    let inner = weak.upgrade().ok_or(HandshakeError::Gone)?;
                    debug!(attempt = attempt + 1, "announcing capabilities");
                    inner.announce().map_err(HandshakeError::Send)?;
                }
                match tokio::time::timeout(window, acked.wait_for(|done| *done)).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(_)) => Err(HandshakeError::Gone),
                    Err(_) => Err(HandshakeError::NotAcknowledged),
                }
            }
        },
        |err| !matches!(err, HandshakeError::Gone),
    )
    .await;

    match outcome {
        RetryOutcome::Success { attempts, .. } => {
            debug!(attempts, "handshake acknowledged");
        }
        RetryOutcome::Exhausted {
            last_error: HandshakeError::Gone,
            ..
        } => {}
        RetryOutcome::Exhausted {
            last_error,
            attempts,
        } => {
            let detail = match last_error {
                HandshakeError::Send(e) => e.to_string(),
                HandshakeError::NotAcknowledged | HandshakeError::Gone => {
                    "announcement not acknowledged".to_string()
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.logger.get().error(
                    &format!("rpc: {}", LinkError::HandshakeFailed { attempts }),
                    &[Value::String(detail)],
                );
                inner.progress.send_modify(|p| p.handshake_failed_after = Some(attempts));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

impl Link {
    /// The mirror of the peer's capabilities.
    pub fn remote(&self) -> RemoteTree {
        self.inner.remote.clone()
    }

    /// Shortcut for `remote().get(path)`.
    pub fn procedure(&self, path: &str) -> Option<RemoteProcedure> {
        self.inner.remote.get(path)
    }

    /// Resolves once the peer's descriptor has arrived. Fails if the
    /// handshake gave up first or the link is destroyed.
    pub fn ready(&self) -> BoxFuture<'static, Result<(), LinkError>> {
        let mut rx = self.inner.progress.subscribe();
        async move {
            loop {
                {
                    let progress = rx.borrow_and_update();
                    match progress.state {
                        LinkState::Ready => return Ok(()),
                        LinkState::Destroyed => return Err(LinkError::Destroyed),
                        LinkState::Created | LinkState::Handshaking => {
                            if let Some(attempts) = progress.handshake_failed_after {
                                return Err(LinkError::HandshakeFailed { attempts });
                            }
                        }
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(LinkError::Destroyed);
                }
            }
        }
        .boxed()
    }

    /// Run `callback` once the link is ready (immediately if it already is).
    /// Callbacks still queued when the link is destroyed are dropped.
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut queue = self
                .inner
                .ready_queue
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match self.inner.state() {
                LinkState::Ready => {}
                LinkState::Destroyed => return,
                LinkState::Created | LinkState::Handshaking => {
                    queue.push(Box::new(callback));
                    return;
                }
            }
        }
        run_guarded(&self.inner.logger, "ready callback", callback);
    }

    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    /// Expose more procedures and announce the new descriptor to the peer.
    /// Returns a snapshot of the exposed registry.
    pub fn expose(
        &self,
        item: impl Into<Exposable>,
        overwrite: bool,
    ) -> BTreeMap<String, CallKind> {
        if self.inner.outbox.is_closed() {
            return self.exposed();
        }
        let changed = self
            .inner
            .exposed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .expose(item.into(), overwrite);
        if !changed.is_empty() {
            debug!(paths = ?changed, "exposed");
            self.inner.announce_update();
        }
        self.exposed()
    }

    /// Read-only snapshot of the exposed registry.
    pub fn exposed(&self) -> BTreeMap<String, CallKind> {
        self.inner
            .exposed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    /// Install a logger assembled from hooks. Returns `false` and keeps the
    /// current logger if any hook is missing.
    pub fn set_logger(&self, candidate: LoggerHooks) -> bool {
        self.inner.logger.replace(candidate)
    }

    /// Install a complete logger.
    pub fn set_logger_impl(&self, logger: Arc<dyn Logger>) {
        self.inner.logger.set(logger)
    }

    /// Route pending calls of `kind` that are still waiting when the link
    /// is destroyed through `handler` instead of failing them directly.
    pub fn set_flush_handler<F>(&self, kind: CallKind, handler: F)
    where
        F: Fn(&PendingCall, LinkError) + Send + Sync + 'static,
    {
        self.inner.outbox.pending.set_flush_handler(kind, Arc::new(handler));
    }

    /// Remove the flush routing for `kind`. Calls of that kind still waiting
    /// at destroy are then reported through the logger and never settle.
    pub fn clear_flush_handler(&self, kind: CallKind) {
        self.inner.outbox.pending.clear_flush_handler(kind);
    }

    /// Send a logging-style error report to the peer, which forwards the
    /// values to its logger. Values that fail to serialize are replaced with
    /// a placeholder.
    pub fn report_error<T: Serialize>(&self, values: &[T]) -> Result<(), LinkError> {
        if self.inner.outbox.is_closed() {
            return Err(LinkError::Destroyed);
        }
        let logger = self.inner.logger.get();
        let include_stack = self.inner.config.settings().enable_stack_trace;
        let codec = ErrorCodec::new(logger.as_ref(), include_stack);
        let encoded = codec.encode_all(values.iter());
        self.inner
            .outbox
            .send(&Envelope::report(self.inner.config.message_key(), encoded))
    }

    pub fn status(&self) -> LinkStatus {
        let mut listener_ids: Vec<String> =
            self.inner.listeners.iter().map(|e| e.key().clone()).collect();
        listener_ids.sort();
        LinkStatus {
            result_callbacks: self.inner.outbox.pending.count(),
            listener_ids,
            ready_queue: self
                .inner
                .ready_queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            state: self.inner.state(),
        }
    }

    /// Register a teardown callback. It runs once with the destroy reason;
    /// immediately if the link is already destroyed. The returned function
    /// unregisters it.
    pub fn on_destroy(
        &self,
        callback: impl FnOnce(&str) + Send + 'static,
    ) -> impl FnOnce() + Send + 'static {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let already = {
            let mut callbacks = self
                .inner
                .on_destroy
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if self.inner.outbox.is_closed() {
                Some(callback)
            } else {
                callbacks.push((id, Box::new(callback)));
                None
            }
        };
        if let Some(callback) = already {
            let reason = self
                .inner
                .destroy_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or_default();
            run_guarded(&self.inner.logger, "destroy callback", || callback(&reason));
        }

        let weak = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .on_destroy
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|(registered, _)| *registered != id);
            }
        }
    }

    /// Tear the link down: reject every pending call with `reason`, clear
    /// the registries, detach from the transport and run the teardown
    /// callbacks. Returns `false` (and does nothing) if already destroyed.
    pub fn destroy(&self, reason: &str) -> bool {
        self.inner.destroy(reason)
    }
}

impl Drop for LinkInner {
    fn drop(&mut self) {
        if self.outbox.close() {
            if let Some(task) = self
                .handshake_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                task.abort();
            }
            self.outbox.pending.flush("link dropped");
            self.outbox.transport.off();
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("state", &self.inner.state())
            .field("remote", &self.inner.remote)
            .finish_non_exhaustive()
    }
}

fn run_guarded(logger: &LoggerSlot, what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        logger.get().error(&format!("rpc: {what} panicked"), &[]);
    }
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

impl LinkInner {
    fn state(&self) -> LinkState {
        self.progress.borrow().state
    }

    fn descriptor(&self) -> Capability {
        let mut descriptor = self
            .exposed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .descriptor();
        for path in self.advertised.leaf_paths() {
            descriptor.insert_path(&path);
        }
        descriptor
    }

    /// Send the handshake announcement.
    fn announce(&self) -> Result<(), LinkError> {
        if self.outbox.is_closed() {
            return Err(LinkError::Destroyed);
        }
        let envelope = Envelope::expose(&self.handshake_uid, &self.descriptor())?;
        self.outbox.send(&envelope)
    }

    /// Send an incremental announcement after a local `expose`.
    fn announce_update(&self) {
        let uid = self.outbox.next_uid();
        let envelope = match Envelope::expose(&uid, &self.descriptor()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.logger
                    .get()
                    .error("rpc: could not encode descriptor", &[Value::String(e.to_string())]);
                return;
            }
        };
        let ack = self.outbox.request(CallKind::Promise, &uid, &envelope);
        let logger = self.logger.clone();
        self.outbox.runtime.spawn(async move {
            if let Err(e) = ack.await {
                if !matches!(e, LinkError::Flushed { .. } | LinkError::Destroyed) {
                    logger.get().warn(&format!("rpc: expose not acknowledged: {e}"), &[]);
                }
            }
        });
    }

    fn mark_ready(&self) {
        let queued = {
            let mut queue = self.ready_queue.lock().unwrap_or_else(|e| e.into_inner());
            let became_ready = self.progress.send_if_modified(|p| {
                if matches!(p.state, LinkState::Created | LinkState::Handshaking) {
                    p.state = LinkState::Ready;
                    true
                } else {
                    false
                }
            });
            if !became_ready {
                return;
            }
            std::mem::take(&mut *queue)
        };
        info!("link ready");
        for callback in queued {
            run_guarded(&self.logger, "ready callback", callback);
        }
    }

    fn destroy(&self, reason: &str) -> bool {
        if !self.outbox.close() {
            return false;
        }
        *self.destroy_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());

        if let Some(task) = self
            .handshake_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        for entry in self.listeners.iter() {
            entry.value().active.store(false, Ordering::Release);
        }
        self.listeners.clear();
        self.exposed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.remote.clear();
        self.ready_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let flushed = self.outbox.pending.flush(reason);
        self.outbox.transport.off();
        self.progress.send_modify(|p| p.state = LinkState::Destroyed);

        let callbacks = std::mem::take(
            &mut *self.on_destroy.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for (_, callback) in callbacks {
            run_guarded(&self.logger, "destroy callback", || callback(reason));
        }
        info!(reason, flushed, "link destroyed");
        true
    }

    fn protocol_error(&self, message: &str, context: &[Value]) {
        self.logger.get().error(message, context);
    }

    fn handle_inbound(self: &Arc<Self>, raw: &str) {
        if self.outbox.is_closed() {
            debug!("message after destroy ignored");
            return;
        }
        let envelope = match decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.protocol_error(
                    &format!("rpc: malformed message: {e}"),
                    &[Value::String(raw.to_string())],
                );
                return;
            }
        };
        debug!(kind = envelope.kind.as_str(), uid = ?envelope.uid, "inbound");

        match envelope.kind {
            EnvelopeType::Expose => self.on_expose(&envelope),
            EnvelopeType::Invoke | EnvelopeType::Promise | EnvelopeType::Callback => {
                self.on_call(&envelope)
            }
            EnvelopeType::Listen => self.on_listen(&envelope),
            EnvelopeType::Ignore => self.on_ignore(&envelope),
            EnvelopeType::Results => self.on_results(&envelope),
            EnvelopeType::Error => self.on_error(&envelope),
        }
    }

    fn on_expose(self: &Arc<Self>, envelope: &Envelope) {
        let descriptor = match envelope.capability() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.protocol_error(&format!("rpc: malformed expose: {e}"), &[]);
                return;
            }
        };
        let outbox = self.outbox.clone();
        let added = self
            .remote
            .merge(&descriptor, &|path| RemoteProcedure::new(path, outbox.clone()));
        debug!(added, "remote capabilities merged");

        if let Some(uid) = &envelope.uid {
            self.reply(uid, Envelope::results(uid, Value::Bool(true)));
        }
        self.mark_ready();

        if !*self.handshake_acked.borrow() && !self.reannounced.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.announce() {
                warn!(error = %e, "eager re-announce failed");
            }
        }
    }

    fn call_invocations(&self, envelope: &Envelope) -> Option<Vec<(String, Invocation)>> {
        let invocations = match envelope.invocations() {
            Ok(invocations) => invocations,
            Err(e) => {
                self.protocol_error(
                    &format!("rpc: malformed {}: {e}", envelope.kind.as_str()),
                    &[],
                );
                return None;
            }
        };
        // The envelope uid stands in for a single invocation only; a batch
        // sharing one uid would answer several times under it.
        let fallback = if invocations.len() == 1 {
            envelope.uid.clone()
        } else {
            None
        };
        let mut out = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            match invocation.uid.clone().or_else(|| fallback.clone()) {
                Some(uid) => out.push((uid, invocation)),
                None => self.protocol_error(
                    &format!("rpc: {} of {} without uid", envelope.kind.as_str(), invocation.path),
                    &[],
                ),
            }
        }
        Some(out)
    }

    fn lookup(&self, path: &str) -> Option<Procedure> {
        self.exposed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    fn on_call(self: &Arc<Self>, envelope: &Envelope) {
        let Some(kind) = envelope.kind.call_kind() else {
            return;
        };
        let Some(calls) = self.call_invocations(envelope) else {
            return;
        };
        for (uid, invocation) in calls {
            let replier = Replier::new(self, kind, uid);
            match self.lookup(&invocation.path) {
                None => replier.fail(RpcError::new(format!(
                    "no such capability: {}",
                    invocation.path
                ))),
                Some(Procedure::Listen(_)) => replier.fail(RpcError::new(format!(
                    "{} can only be listened to",
                    invocation.path
                ))),
                Some(procedure) => execute(procedure, invocation.args, replier),
            }
        }
    }

    fn on_listen(self: &Arc<Self>, envelope: &Envelope) {
        let Some(calls) = self.call_invocations(envelope) else {
            return;
        };
        for (listener_id, invocation) in calls {
            let replier = Replier::new(self, CallKind::Listen, listener_id.clone());
            let Some(Procedure::Listen(handler)) = self.lookup(&invocation.path) else {
                replier.fail(RpcError::new(format!(
                    "no listen-capable capability: {}",
                    invocation.path
                )));
                continue;
            };

            let active = Arc::new(AtomicBool::new(true));
            self.listeners.insert(
                listener_id.clone(),
                ListenerEntry {
                    path: invocation.path.clone(),
                    active: active.clone(),
                },
            );
            let outbox = self.outbox.clone();
            let event_id = listener_id.clone();
            let notifier = Notifier::new(
                listener_id.clone(),
                active,
                Arc::new(move |value: Value| {
                    if outbox.is_closed() {
                        return;
                    }
                    if let Err(e) = outbox.send(&Envelope::results(&event_id, value)) {
                        outbox
                            .logger
                            .get()
                            .warn(&format!("rpc: event delivery failed: {e}"), &[]);
                    }
                }),
            );

            let outcome = catch_unwind(AssertUnwindSafe(|| handler(invocation.args, notifier)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(RpcError::from_panic(panic)),
            };
            if let Some(err) = failure {
                if let Some((_, entry)) = self.listeners.remove(&listener_id) {
                    entry.active.store(false, Ordering::Release);
                }
                replier.fail(err);
            } else {
                debug!(path = %invocation.path, listener = %listener_id, "listener added");
            }
        }
    }

    fn on_ignore(self: &Arc<Self>, envelope: &Envelope) {
        let Some(calls) = self.call_invocations(envelope) else {
            return;
        };
        for (uid, invocation) in calls {
            let Some(listener_id) = invocation.args.first().and_then(Value::as_str) else {
                self.protocol_error("rpc: ignore without a listener id", &[]);
                continue;
            };
            let removed = match self.listeners.remove(listener_id) {
                Some((_, entry)) => {
                    entry.active.store(false, Ordering::Release);
                    debug!(path = %entry.path, listener = %listener_id, "listener removed");
                    true
                }
                None => false,
            };
            self.reply(&uid, Envelope::results(&uid, Value::Bool(removed)));
        }
    }

    fn on_results(&self, envelope: &Envelope) {
        let entries = match envelope.reply_entries("results") {
            Ok(entries) => entries,
            Err(e) => {
                self.protocol_error(&format!("rpc: malformed results: {e}"), &[]);
                return;
            }
        };
        for entry in entries {
            let Some(uid) = entry_uid(entry) else {
                self.protocol_error("rpc: result entry without uid", &[entry.clone()]);
                continue;
            };
            if uid == self.handshake_uid {
                self.handshake_acked.send_replace(true);
                continue;
            }
            let result = entry.get("result").cloned().unwrap_or(Value::Null);
            if self.outbox.pending.resolve(uid, result) {
                continue;
            }
            if self.outbox.pending.is_retired(uid) {
                debug!(listener = %uid, "event for ignored listener dropped");
            } else {
                self.protocol_error(
                    &format!("rpc: no pending call for uid {uid}"),
                    &[Value::String(uid.to_string())],
                );
            }
        }
    }

    fn on_error(&self, envelope: &Envelope) {
        if let Some(values) = envelope.report_values(self.config.message_key()) {
            let context = match values {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            self.logger.get().error("rpc: remote error report", &context);
            return;
        }
        let entries = match envelope.reply_entries("error") {
            Ok(entries) => entries,
            Err(e) => {
                self.protocol_error(&format!("rpc: malformed error: {e}"), &[]);
                return;
            }
        };
        for entry in entries {
            let Some(uid) = entry_uid(entry) else {
                self.protocol_error("rpc: error entry without uid", &[entry.clone()]);
                continue;
            };
            let error = ErrorCodec::decode(entry.get("error").unwrap_or(&Value::Null));
            if uid == self.handshake_uid {
                warn!(error = %error, "peer rejected our announcement");
                continue;
            }
            if self.outbox.pending.reject(uid, LinkError::Remote(error)) {
                continue;
            }
            if self.outbox.pending.is_retired(uid) {
                debug!(listener = %uid, "failure for ignored listener dropped");
            } else {
                self.protocol_error(
                    &format!("rpc: no pending call for uid {uid}"),
                    &[Value::String(uid.to_string())],
                );
            }
        }
    }

    fn reply(&self, uid: &str, envelope: Envelope) {
        if let Err(e) = self.outbox.send(&envelope) {
            self.logger.get().warn(
                &format!("rpc: reply for {uid} not sent: {e}"),
                &[],
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Handler execution
// ---------------------------------------------------------------------------

/// Sends the single reply of one inbound call.
struct Replier {
    link: Weak<LinkInner>,
    kind: CallKind,
    uid: String,
    include_stack: bool,
}

impl Replier {
    fn new(link: &Arc<LinkInner>, kind: CallKind, uid: String) -> Self {
        Self {
            link: Arc::downgrade(link),
            kind,
            uid,
            include_stack: link.config.settings().enable_stack_trace,
        }
    }

    /// `callback` replies carry every success value; the other conventions
    /// carry the first.
    fn succeed(&self, values: Vec<Value>) {
        let result = match self.kind {
            CallKind::Callback => Value::Array(values),
            _ => values.into_iter().next().unwrap_or(Value::Null),
        };
        self.send(Envelope::results(&self.uid, result));
    }

    fn fail(&self, error: RpcError) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        let logger = link.logger.get();
        let encoded = ErrorCodec::new(logger.as_ref(), self.include_stack).encode(&error);
        self.send(Envelope::error(&self.uid, encoded));
    }

    fn finish(&self, outcome: Result<Vec<Value>, RpcError>) {
        match outcome {
            Ok(values) => self.succeed(values),
            Err(error) => self.fail(error),
        }
    }

    fn send(&self, envelope: Envelope) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        if link.outbox.is_closed() {
            debug!(uid = %self.uid, "reply dropped after destroy");
            return;
        }
        link.reply(&self.uid, envelope);
    }
}

fn execute(procedure: Procedure, args: Vec<Value>, replier: Replier) {
    match procedure {
        Procedure::Invoke(handler) => {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(args)));
            match outcome {
                Ok(result) => replier.finish(result.map(|v| vec![v])),
                Err(panic) => replier.fail(RpcError::from_panic(panic)),
            }
        }
        Procedure::Promise(handler) => {
            let future = match catch_unwind(AssertUnwindSafe(|| handler(args))) {
                Ok(future) => future,
                Err(panic) => {
                    replier.fail(RpcError::from_panic(panic));
                    return;
                }
            };
            let Some(runtime) = replier.link.upgrade().map(|l| l.outbox.runtime.clone()) else {
                return;
            };
            runtime.spawn(async move {
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => replier.finish(result.map(|v| vec![v])),
                    Err(panic) => replier.fail(RpcError::from_panic(panic)),
                }
            });
        }
        Procedure::Callback(handler) => {
            let replier = Arc::new(replier);
            let replied = Arc::new(AtomicBool::new(false));
            let continuation = {
                let replier = replier.clone();
                let replied = replied.clone();
                Continuation::new(move |outcome| {
                    if !replied.swap(true, Ordering::AcqRel) {
                        replier.finish(outcome);
                    }
                })
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(args, continuation))) {
                if !replied.swap(true, Ordering::AcqRel) {
                    replier.fail(RpcError::from_panic(panic));
                }
            }
        }
        Procedure::Listen(_) => {
            replier.fail(RpcError::new("listen procedures must be listened to"));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expose::Api;
    use crate::transport::memory;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tether_types::LinkSettings;

    fn fast_settings() -> LinkSettings {
        LinkSettings {
            create_wait_ms: 10,
            create_max_wait_ms: 50,
            ..Default::default()
        }
    }

    async fn linked(a_api: Api, b_api: Api) -> (Link, Link) {
        let (ta, tb) = memory::pair().unwrap();
        let a = Link::connect(
            LinkConfig::new(Arc::new(ta)).with_settings(fast_settings()),
            a_api,
            None,
        )
        .unwrap();
        let b = Link::connect(
            LinkConfig::new(Arc::new(tb)).with_settings(fast_settings()),
            b_api,
            None,
        )
        .unwrap();
        a.ready().await.unwrap();
        b.ready().await.unwrap();
        (a, b)
    }

    #[test]
    fn test_connect_requires_runtime() {
        struct Null;
        impl crate::transport::Transport for Null {
            fn on(&self, _: crate::transport::InboundHandler) {}
            fn emit(&self, _: String) -> Result<(), crate::transport::TransportError> {
                Ok(())
            }
        }
        let err = Link::connect(LinkConfig::new(Arc::new(Null)), Api::new(), None).unwrap_err();
        assert!(matches!(err, LinkError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn test_handshake_and_invoke() {
        let (a, b) = linked(
            Api::new().invoke("double", |args| {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(n * 2))
            }),
            Api::new(),
        )
        .await;

        assert_eq!(a.state(), LinkState::Ready);
        assert_eq!(b.remote().paths(), vec!["double"]);
        let result = b.procedure("double").unwrap().invoke(vec![json!(21)]).await;
        assert_eq!(result.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_on_ready_runs_once() {
        let (a, _b) = linked(Api::new(), Api::new()).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        a.on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(a.status().ready_queue, 0);
    }

    #[tokio::test]
    async fn test_destroy_is_one_shot() {
        let (a, _b) = linked(Api::new(), Api::new()).await;
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = reasons.clone();
        let _unregister = a.on_destroy(move |reason| sink.lock().unwrap().push(reason.to_string()));

        assert!(a.destroy("done"));
        assert!(!a.destroy("again"));
        assert_eq!(*reasons.lock().unwrap(), vec!["done"]);
        assert_eq!(a.state(), LinkState::Destroyed);
        assert_eq!(a.ready().await, Err(LinkError::Destroyed));
    }
}
