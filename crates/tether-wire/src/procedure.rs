//! Remote procedure proxy — the consumer's handle on one peer procedure.
//!
//! Every convention generates a fresh correlation id, registers one pending
//! entry and emits one envelope. Replies are matched by the link's inbound
//! dispatcher through the shared [`PendingCalls`].

use crate::message::Envelope;
use crate::pending::{ErrorHandler, PendingCalls, ResultHandler};
use crate::promise::{rejected, resolved, Promise, PromiseAdapter};
use crate::transport::Transport;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_types::{CallKind, LinkError, LoggerSlot, UidGenerator};
use tokio::runtime::Handle;
use tracing::debug;

/// Send side shared by the link and every proxy it creates.
pub(crate) struct Outbox {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) uid: Arc<dyn UidGenerator>,
    pub(crate) pending: PendingCalls,
    pub(crate) adapter: Arc<dyn PromiseAdapter>,
    pub(crate) logger: LoggerSlot,
    pub(crate) runtime: Handle,
    pub(crate) use_acks: bool,
    pub(crate) max_ack_delay: Duration,
    pub(crate) default_kind: CallKind,
    closed: AtomicBool,
}

impl Outbox {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        uid: Arc<dyn UidGenerator>,
        pending: PendingCalls,
        adapter: Arc<dyn PromiseAdapter>,
        logger: LoggerSlot,
        runtime: Handle,
        use_acks: bool,
        max_ack_delay: Duration,
        default_kind: CallKind,
    ) -> Self {
        Self {
            transport,
            uid,
            pending,
            adapter,
            logger,
            runtime,
            use_acks,
            max_ack_delay,
            default_kind,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn next_uid(&self) -> String {
        self.uid.uid()
    }

    /// Encode and emit one envelope.
    pub(crate) fn send(&self, envelope: &Envelope) -> Result<(), LinkError> {
        let raw = envelope.encode()?;
        self.transport
            .emit(raw)
            .map_err(|e| LinkError::Transport(e.to_string()))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Register a one-shot pending entry, emit `envelope`, and hand back the
    /// promise the entry settles.
    pub(crate) fn request(&self, kind: CallKind, uid: &str, envelope: &Envelope) -> Promise {
        self.request_then(kind, uid, envelope, Arc::new(|| {}))
    }

    /// Like [`request`](Outbox::request); `settled` runs once the entry is
    /// settled, before the promise is.
    pub(crate) fn request_then(
        &self,
        kind: CallKind,
        uid: &str,
        envelope: &Envelope,
        settled: Arc<dyn Fn() + Send + Sync>,
    ) -> Promise {
        if self.is_closed() {
            return rejected(LinkError::Destroyed);
        }
        let (promise, settle) = self.adapter.defer().into_parts();
        let on_error = settle.clone();
        let after_error = settled.clone();
        let registered = self.pending.register(
            uid,
            kind,
            Arc::new(move |value: Value| {
                settled();
                settle.resolve(value)
            }),
            Arc::new(move |err: LinkError| {
                after_error();
                on_error.reject(err)
            }),
        );
        if !registered {
            return rejected(LinkError::Config(format!("correlation id {uid} reused")));
        }

        match self.send(envelope) {
            Ok(()) => {
                if self.use_acks {
                    self.pending.expire_after(uid, self.max_ack_delay, &self.runtime);
                }
            }
            Err(e) => {
                self.pending.reject(uid, e);
            }
        }
        promise
    }
}

struct Inner {
    path: String,
    outbox: Arc<Outbox>,
}

/// Handle on one procedure exposed by the peer.
///
/// Cheap to clone; clones share identity (see [`RemoteProcedure::ptr_eq`]).
#[derive(Clone)]
pub struct RemoteProcedure {
    inner: Arc<Inner>,
}

impl RemoteProcedure {
    pub(crate) fn new(path: impl Into<String>, outbox: Arc<Outbox>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                outbox,
            }),
        }
    }

    /// Dotted path of the peer procedure.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Whether two handles are the same proxy.
    pub fn ptr_eq(&self, other: &RemoteProcedure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn dispatch(&self, kind: CallKind, args: Vec<Value>) -> Promise {
        let outbox = &self.inner.outbox;
        let uid = outbox.next_uid();
        debug!(path = %self.inner.path, %kind, uid = %uid, "remote call");
        let envelope = Envelope::call(kind, &uid, &self.inner.path, args);
        outbox.request(kind, &uid, &envelope)
    }

    /// Call a procedure and resolve with its return value.
    pub fn invoke(&self, args: Vec<Value>) -> Promise {
        self.dispatch(CallKind::Invoke, args)
    }

    /// Call a procedure whose result is produced asynchronously on the peer.
    pub fn promise(&self, args: Vec<Value>) -> Promise {
        self.dispatch(CallKind::Promise, args)
    }

    /// Call an error-first procedure; resolves with the array of success
    /// values.
    pub fn callback(&self, args: Vec<Value>) -> Promise {
        self.dispatch(CallKind::Callback, args)
    }

    /// Call using the link's default convention.
    pub fn call(&self, args: Vec<Value>) -> Promise {
        self.dispatch(self.inner.outbox.default_kind, args)
    }

    /// Subscribe to a listen-style procedure. `on_event` runs for every
    /// event until the returned listener id is passed to [`ignore`].
    /// Failures reported for the subscription are logged.
    ///
    /// [`ignore`]: RemoteProcedure::ignore
    pub fn listen<F>(&self, args: Vec<Value>, on_event: F) -> Result<String, LinkError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let logger = self.inner.outbox.logger.clone();
        let path = self.inner.path.clone();
        self.listen_with(args, on_event, move |err| {
            logger.get().warn(
                &format!("rpc: listener on {path} failed: {err}"),
                &[],
            );
        })
    }

    /// Like [`listen`](RemoteProcedure::listen) with an explicit error
    /// handler for the subscription.
    pub fn listen_with<F, E>(
        &self,
        args: Vec<Value>,
        on_event: F,
        on_error: E,
    ) -> Result<String, LinkError>
    where
        F: Fn(Value) + Send + Sync + 'static,
        E: Fn(LinkError) + Send + Sync + 'static,
    {
        let outbox = &self.inner.outbox;
        if outbox.is_closed() {
            return Err(LinkError::Destroyed);
        }
        let listener_id = outbox.next_uid();
        let on_result: ResultHandler = Arc::new(on_event);
        let on_error: ErrorHandler = Arc::new(on_error);
        if !outbox
            .pending
            .register(&listener_id, CallKind::Listen, on_result, on_error)
        {
            return Err(LinkError::Config(format!(
                "correlation id {listener_id} reused"
            )));
        }

        let envelope = Envelope::call(CallKind::Listen, &listener_id, &self.inner.path, args);
        if let Err(e) = outbox.send(&envelope) {
            outbox.pending.remove(&listener_id);
            return Err(e);
        }
        debug!(path = %self.inner.path, listener = %listener_id, "listening");
        Ok(listener_id)
    }

    /// Stop a subscription. The local entry is removed at once; the promise
    /// resolves with the peer's acknowledgement (`true` if it still knew the
    /// listener). Events that arrive for the listener before that
    /// acknowledgement are dropped quietly. Ignoring twice is harmless.
    pub fn ignore(&self, listener_id: &str) -> Promise {
        let outbox = &self.inner.outbox;
        if outbox.is_closed() {
            outbox.pending.remove(listener_id);
            return resolved(Value::Bool(false));
        }
        outbox.pending.retire(listener_id);
        let uid = outbox.next_uid();
        let envelope = Envelope::ignore(&uid, &self.inner.path, listener_id);
        let pending = outbox.pending.clone();
        let retired = listener_id.to_string();
        outbox.request_then(
            CallKind::Promise,
            &uid,
            &envelope,
            Arc::new(move || pending.forget_retired(&retired)),
        )
    }
}

impl std::fmt::Debug for RemoteProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcedure")
            .field("path", &self.inner.path)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{outbox, CaptureTransport};
    use super::*;
    use crate::message::EnvelopeType;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_invoke_registers_and_resolves() {
        let transport = Arc::new(CaptureTransport::default());
        let outbox = outbox(transport.clone(), false);
        let proc = RemoteProcedure::new("math.add", outbox.clone());

        let promise = proc.invoke(vec![json!(1), json!(2)]);
        assert_eq!(outbox.pending.count(), 1);

        let sent = transport.envelopes();
        assert_eq!(sent[0].kind, EnvelopeType::Invoke);
        let invocation = &sent[0].invocations().unwrap()[0];
        assert_eq!(invocation.path, "math.add");
        assert_eq!(invocation.args, vec![json!(1), json!(2)]);

        let uid = sent[0].uid.clone().unwrap();
        assert!(outbox.pending.resolve(&uid, json!(3)));
        assert_eq!(promise.await.unwrap(), json!(3));
        assert_eq!(outbox.pending.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_use_distinct_ids() {
        let transport = Arc::new(CaptureTransport::default());
        let outbox = outbox(transport.clone(), false);
        let proc = RemoteProcedure::new("f", outbox.clone());
        let _pending: Vec<Promise> = (0..50).map(|_| proc.call(vec![])).collect();

        let ids: HashSet<String> = transport
            .envelopes()
            .into_iter()
            .map(|e| {
                assert_eq!(e.kind, EnvelopeType::Promise);
                e.uid.unwrap()
            })
            .collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(outbox.pending.count(), 50);
    }

    #[tokio::test]
    async fn test_send_failure_rejects() {
        let transport = Arc::new(CaptureTransport::default());
        transport.fail.store(true, Ordering::SeqCst);
        let outbox = outbox(transport, false);
        let proc = RemoteProcedure::new("f", outbox.clone());
        let err = proc.promise(vec![]).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
        assert_eq!(outbox.pending.count(), 0);
        assert!(proc.listen(vec![], |_| {}).is_err());
        assert_eq!(outbox.pending.count(), 0);
    }

    #[tokio::test]
    async fn test_closed_outbox_rejects_with_destroyed() {
        let transport = Arc::new(CaptureTransport::default());
        let outbox = outbox(transport.clone(), false);
        assert!(outbox.close());
        assert!(!outbox.close());
        let proc = RemoteProcedure::new("f", outbox);
        assert_eq!(proc.callback(vec![]).await, Err(LinkError::Destroyed));
        assert_eq!(proc.listen(vec![], |_| {}), Err(LinkError::Destroyed));
        assert_eq!(proc.ignore("x").await.unwrap(), json!(false));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listen_entry_persists_until_ignored() {
        let transport = Arc::new(CaptureTransport::default());
        let outbox = outbox(transport.clone(), false);
        let proc = RemoteProcedure::new("cat.purr", outbox.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = proc
            .listen(vec![], move |v| sink.lock().unwrap().push(v))
            .unwrap();
        assert!(!listener.is_empty());

        outbox.pending.resolve(&listener, json!("a"));
        outbox.pending.resolve(&listener, json!("b"));
        assert_eq!(*events.lock().unwrap(), vec![json!("a"), json!("b")]);

        let ack = proc.ignore(&listener);
        assert!(!outbox.pending.contains(&listener));
        assert!(!outbox.pending.resolve(&listener, json!("c")));
        assert!(outbox.pending.is_retired(&listener));

        let sent = transport.envelopes();
        let ignore = sent.last().unwrap();
        assert_eq!(ignore.kind, EnvelopeType::Ignore);
        assert_eq!(ignore.invocations().unwrap()[0].args, vec![json!(listener)]);
        outbox.pending.resolve(ignore.uid.as_deref().unwrap(), json!(true));
        assert_eq!(ack.await.unwrap(), json!(true));
        assert!(!outbox.pending.is_retired(&listener));
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ack_timeout_when_enabled() {
        let transport = Arc::new(CaptureTransport::default());
        let outbox = outbox(transport, true);
        let proc = RemoteProcedure::new("slow", outbox.clone());
        let err = proc.invoke(vec![]).await.unwrap_err();
        assert!(matches!(err, LinkError::AckTimeout { waited_ms: 30, .. }));
        assert_eq!(outbox.pending.count(), 0);
    }
}
