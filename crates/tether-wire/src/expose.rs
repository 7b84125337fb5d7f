//! Exposed registry — the local side's callable surface.
//!
//! Procedures are registered under dotted paths together with the strategy
//! used to run them. The registry is built from an [`Exposable`] (usually an
//! [`Api`] tree); plain values found while walking contribute nothing.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_types::capability::PATH_SEPARATOR;
use tether_types::{CallKind, Capability, RpcError};
use tracing::warn;

/// Synchronous handler: returns its value directly.
pub type InvokeFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync>;

/// Asynchronous handler: returns a future of its value.
pub type PromiseFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Error-first continuation handler.
pub type CallbackFn = Arc<dyn Fn(Vec<Value>, Continuation) + Send + Sync>;

/// Subscription handler: keeps the notifier and pushes events through it.
pub type ListenFn = Arc<dyn Fn(Vec<Value>, Notifier) -> Result<(), RpcError> + Send + Sync>;

/// An exposed procedure tagged with its invocation strategy.
#[derive(Clone)]
pub enum Procedure {
    Invoke(InvokeFn),
    Promise(PromiseFn),
    Callback(CallbackFn),
    Listen(ListenFn),
}

impl Procedure {
    pub fn invoke<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        Procedure::Invoke(Arc::new(f))
    }

    pub fn promise<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Procedure::Promise(Arc::new(move |args| f(args).boxed()))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>, Continuation) + Send + Sync + 'static,
    {
        Procedure::Callback(Arc::new(f))
    }

    pub fn listen<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>, Notifier) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        Procedure::Listen(Arc::new(f))
    }

    pub fn kind(&self) -> CallKind {
        match self {
            Procedure::Invoke(_) => CallKind::Invoke,
            Procedure::Promise(_) => CallKind::Promise,
            Procedure::Callback(_) => CallKind::Callback,
            Procedure::Listen(_) => CallKind::Listen,
        }
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Procedure::{:?}", self.kind())
    }
}

type Finisher = Box<dyn FnOnce(Result<Vec<Value>, RpcError>) + Send>;

/// Completion handle passed to callback-style procedures.
///
/// Must be finished exactly once. Dropping it unfinished replies to the
/// caller with an error so the call never hangs.
pub struct Continuation {
    finisher: Option<Finisher>,
}

impl Continuation {
    pub(crate) fn new(finisher: impl FnOnce(Result<Vec<Value>, RpcError>) + Send + 'static) -> Self {
        Self {
            finisher: Some(Box::new(finisher)),
        }
    }

    /// Error-first completion: `Err` fails the call, `Ok` resolves it with
    /// the success values.
    pub fn finish(mut self, outcome: Result<Vec<Value>, RpcError>) {
        if let Some(finisher) = self.finisher.take() {
            finisher(outcome);
        }
    }

    pub fn ok(self, values: Vec<Value>) {
        self.finish(Ok(values))
    }

    pub fn err(self, error: RpcError) {
        self.finish(Err(error))
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        // A panicking handler is answered by the dispatcher instead.
        if std::thread::panicking() {
            return;
        }
        if let Some(finisher) = self.finisher.take() {
            finisher(Err(RpcError::new("callback dropped without completing")));
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("pending", &self.finisher.is_some())
            .finish()
    }
}

/// Event sink handed to listen-style procedures.
#[derive(Clone)]
pub struct Notifier {
    listener_id: String,
    active: Arc<AtomicBool>,
    deliver: Arc<dyn Fn(Value) + Send + Sync>,
}

impl Notifier {
    pub(crate) fn new(
        listener_id: String,
        active: Arc<AtomicBool>,
        deliver: Arc<dyn Fn(Value) + Send + Sync>,
    ) -> Self {
        Self {
            listener_id,
            active,
            deliver,
        }
    }

    /// Push one event to the subscriber. Returns `false` once the
    /// subscriber has ignored the listener or the link is gone.
    pub fn notify(&self, value: Value) -> bool {
        if !self.is_active() {
            return false;
        }
        (self.deliver)(value);
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("listener_id", &self.listener_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Anything that can be handed to `expose`.
#[derive(Debug, Clone)]
pub enum Exposable {
    /// A nested object of members.
    Namespace(Api),
    /// A bare procedure.
    Procedure(Procedure),
    /// A plain value; exposes nothing.
    Value(Value),
}

impl From<Api> for Exposable {
    fn from(api: Api) -> Self {
        Exposable::Namespace(api)
    }
}

impl From<Procedure> for Exposable {
    fn from(procedure: Procedure) -> Self {
        Exposable::Procedure(procedure)
    }
}

impl From<Value> for Exposable {
    fn from(value: Value) -> Self {
        Exposable::Value(value)
    }
}

/// Builder for a nested local capability object.
///
/// ```ignore
/// let api = Api::new()
///     .invoke("add", |args| Ok(json!(sum(&args))))
///     .namespace("cat", Api::new().listen("purr", |_, notifier| { ... }));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Api {
    members: BTreeMap<String, Exposable>,
}

impl Api {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(mut self, name: impl Into<String>, member: impl Into<Exposable>) -> Self {
        self.members.insert(name.into(), member.into());
        self
    }

    pub fn invoke<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.member(name, Procedure::invoke(f))
    }

    pub fn promise<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.member(name, Procedure::promise(f))
    }

    pub fn callback<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Continuation) + Send + Sync + 'static,
    {
        self.member(name, Procedure::callback(f))
    }

    pub fn listen<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Notifier) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.member(name, Procedure::listen(f))
    }

    pub fn namespace(self, name: impl Into<String>, api: Api) -> Self {
        self.member(name, api)
    }

    pub fn value(self, name: impl Into<String>, value: Value) -> Self {
        self.member(name, value)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Dotted path to procedure mapping for one link.
#[derive(Debug, Default)]
pub struct ExposedRegistry {
    procedures: BTreeMap<String, Procedure>,
}

impl ExposedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every procedure reachable from `item`.
    ///
    /// Only a namespace at the top level contributes; anything else is a
    /// no-op. Existing paths are kept unless `overwrite` is set. Returns the
    /// paths that were added or replaced.
    pub fn expose(&mut self, item: Exposable, overwrite: bool) -> Vec<String> {
        let mut changed = Vec::new();
        if let Exposable::Namespace(api) = item {
            self.walk(None, api, overwrite, &mut changed);
        }
        changed
    }

    fn walk(&mut self, prefix: Option<&str>, api: Api, overwrite: bool, changed: &mut Vec<String>) {
        for (name, member) in api.members {
            if name.is_empty() || name.contains(PATH_SEPARATOR) {
                warn!(name = %name, "skipping member with an invalid name");
                continue;
            }
            let path = match prefix {
                Some(prefix) => format!("{prefix}{PATH_SEPARATOR}{name}"),
                None => name,
            };
            match member {
                Exposable::Namespace(nested) => self.walk(Some(&path), nested, overwrite, changed),
                Exposable::Procedure(procedure) => {
                    if self.insert(&path, procedure, overwrite) {
                        changed.push(path);
                    }
                }
                Exposable::Value(_) => {}
            }
        }
    }

    fn insert(&mut self, path: &str, procedure: Procedure, overwrite: bool) -> bool {
        if self.procedures.contains_key(path) {
            if !overwrite {
                return false;
            }
            self.procedures.insert(path.to_string(), procedure);
            return true;
        }
        if self.shadows(path) {
            warn!(path = %path, "path collides with an exposed namespace or procedure");
            return false;
        }
        self.procedures.insert(path.to_string(), procedure);
        true
    }

    /// Whether `path` would turn an existing leaf into a namespace or the
    /// other way round.
    fn shadows(&self, path: &str) -> bool {
        let as_namespace = format!("{path}{PATH_SEPARATOR}");
        let nested_under_existing = path
            .match_indices(PATH_SEPARATOR)
            .any(|(idx, _)| self.procedures.contains_key(&path[..idx]));
        let has_children = self
            .procedures
            .range(as_namespace.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&as_namespace));
        nested_under_existing || has_children
    }

    pub fn get(&self, path: &str) -> Option<&Procedure> {
        self.procedures.get(path)
    }

    /// Read-only copy of the registry: each path and its strategy.
    pub fn snapshot(&self) -> BTreeMap<String, CallKind> {
        self.procedures
            .iter()
            .map(|(path, procedure)| (path.clone(), procedure.kind()))
            .collect()
    }

    /// The capability descriptor announced to the peer.
    pub fn descriptor(&self) -> Capability {
        Capability::from_paths(self.procedures.keys().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    pub fn clear(&mut self) {
        self.procedures.clear();
    }
}
