//! Deferred-result construction.
//!
//! Every `promise`, `callback` and `ignore` call hands its caller a
//! [`Promise`]. How that future is produced is pluggable through
//! [`PromiseAdapter`]; the default [`OneshotAdapter`] backs each one with a
//! tokio oneshot channel.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tether_types::LinkError;
use tokio::sync::oneshot;

/// The future returned by asynchronous calls.
pub type Promise = BoxFuture<'static, Result<Value, LinkError>>;

/// A promise together with the two functions that settle it.
pub struct Deferred {
    pub resolve: Box<dyn FnOnce(Value) + Send>,
    pub reject: Box<dyn FnOnce(LinkError) + Send>,
    pub promise: Promise,
}

/// Settle-once handlers shared between success and failure paths.
pub(crate) struct Settle {
    resolve: Mutex<Option<Box<dyn FnOnce(Value) + Send>>>,
    reject: Mutex<Option<Box<dyn FnOnce(LinkError) + Send>>>,
}

impl Settle {
    /// Resolve unless already settled.
    pub(crate) fn resolve(&self, value: Value) {
        if let Some(f) = self.take() {
            (f.0)(value);
        }
    }

    /// Reject unless already settled.
    pub(crate) fn reject(&self, err: LinkError) {
        if let Some(f) = self.take() {
            (f.1)(err);
        }
    }

    #[allow(clippy::type_complexity)]
    fn take(
        &self,
    ) -> Option<(
        Box<dyn FnOnce(Value) + Send>,
        Box<dyn FnOnce(LinkError) + Send>,
    )> {
        let mut resolve = self.resolve.lock().unwrap_or_else(|e| e.into_inner());
        let mut reject = self.reject.lock().unwrap_or_else(|e| e.into_inner());
        Some((resolve.take()?, reject.take()?))
    }
}

impl Deferred {
    /// Split into the promise and a shared settle-once handle.
    pub(crate) fn into_parts(self) -> (Promise, Arc<Settle>) {
        let settle = Arc::new(Settle {
            resolve: Mutex::new(Some(self.resolve)),
            reject: Mutex::new(Some(self.reject)),
        });
        (self.promise, settle)
    }
}

/// Factory for deferred results.
pub trait PromiseAdapter: Send + Sync {
    fn defer(&self) -> Deferred;
}

/// Default adapter backed by `tokio::sync::oneshot`.
///
/// Dropping both settle functions without calling either resolves the
/// promise with [`LinkError::Canceled`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OneshotAdapter;

impl PromiseAdapter for OneshotAdapter {
    fn defer(&self) -> Deferred {
        let (tx, rx) = oneshot::channel::<Result<Value, LinkError>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_err = tx.clone();
        Deferred {
            resolve: Box::new(move |value| {
                let sender = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(value));
                }
            }),
            reject: Box::new(move |err| {
                let sender = tx_err.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(sender) = sender {
                    let _ = sender.send(Err(err));
                }
            }),
            promise: rx
                .map(|outcome| outcome.unwrap_or(Err(LinkError::Canceled)))
                .boxed(),
        }
    }
}

/// An already-fulfilled promise.
pub fn resolved(value: Value) -> Promise {
    futures::future::ready(Ok(value)).boxed()
}

/// An already-failed promise.
pub fn rejected(err: LinkError) -> Promise {
    futures::future::ready(Err(err)).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_oneshot_resolves() {
        let deferred = OneshotAdapter.defer();
        (deferred.resolve)(json!("ok"));
        assert_eq!(deferred.promise.await.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_oneshot_rejects() {
        let deferred = OneshotAdapter.defer();
        (deferred.reject)(LinkError::Destroyed);
        assert_eq!(deferred.promise.await, Err(LinkError::Destroyed));
    }

    #[tokio::test]
    async fn test_dropped_deferred_is_canceled() {
        let deferred = OneshotAdapter.defer();
        drop(deferred.resolve);
        drop(deferred.reject);
        assert_eq!(deferred.promise.await, Err(LinkError::Canceled));
    }

    #[tokio::test]
    async fn test_settles_at_most_once() {
        let (promise, settle) = OneshotAdapter.defer().into_parts();
        settle.resolve(json!(1));
        settle.reject(LinkError::Destroyed);
        settle.resolve(json!(2));
        assert_eq!(promise.await.unwrap(), json!(1));
    }

    #[test]
    fn test_ready_helpers_need_no_runtime() {
        let value = tokio_test::assert_ok!(tokio_test::block_on(resolved(json!(null))));
        assert_eq!(value, Value::Null);
        let err = tokio_test::assert_err!(tokio_test::block_on(rejected(LinkError::Canceled)));
        assert_eq!(err, LinkError::Canceled);
    }
}
