//! Wire-safe error projection and its codec.
//!
//! Errors cross the link as a small tagged JSON object:
//!
//! ```json
//! { "_rpcError": true, "message": "boom", "stack": "..." }
//! ```
//!
//! Encoding is total: anything that fails to serialize is logged through the
//! active logger and replaced with [`UNSERIALIZABLE`]. Decoding is lossy on
//! purpose; only `message`, `stack` and `data` survive the trip.

use crate::logger::Logger;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use thiserror::Error;

/// Stand-in for a value that could not be serialized.
pub const UNSERIALIZABLE: &str = "[unserializable]";

/// Field that marks an object as an encoded [`RpcError`].
pub const RPC_ERROR_TAG: &str = "_rpcError";

/// Serializable projection of a failure raised by an exposed procedure.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RpcError {
    #[serde(rename = "_rpcError", default)]
    tagged: bool,
    /// Human-readable failure message.
    pub message: String,
    /// Source chain and backtrace, when stack traces are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Optional structured detail supplied by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            tagged: true,
            message: message.into(),
            stack: None,
            data: None,
        }
    }

    /// Attach structured detail.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Project any error, recording its source chain (and a backtrace when
    /// `RUST_BACKTRACE` enables one) as the stack.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut lines = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            lines.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            lines.push(backtrace.to_string());
        }

        let mut projected = Self::new(err.to_string());
        if !lines.is_empty() {
            projected.stack = Some(lines.join("\n"));
        }
        projected
    }

    /// Project a panic payload caught around a handler.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(format!("handler panicked: {detail}"))
    }
}

/// Encoder/decoder for errors and best-effort values crossing the link.
pub struct ErrorCodec<'a> {
    logger: &'a dyn Logger,
    include_stack: bool,
}

impl<'a> ErrorCodec<'a> {
    pub fn new(logger: &'a dyn Logger, include_stack: bool) -> Self {
        Self {
            logger,
            include_stack,
        }
    }

    /// Encode an error for the wire. Never fails.
    pub fn encode(&self, err: &RpcError) -> Value {
        let mut encoded = json!({
            RPC_ERROR_TAG: true,
            "message": err.message,
        });
        if self.include_stack {
            if let Some(stack) = &err.stack {
                encoded["stack"] = Value::String(stack.clone());
            }
        }
        if let Some(data) = &err.data {
            encoded["data"] = data.clone();
        }
        encoded
    }

    /// Serialize an arbitrary value, substituting [`UNSERIALIZABLE`] (and
    /// logging the failure) when serialization itself errors.
    pub fn to_wire<T: Serialize + ?Sized>(&self, value: &T) -> Value {
        match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                self.logger.error(
                    "rpc: could not serialize value, sending placeholder",
                    &[Value::String(e.to_string())],
                );
                Value::String(UNSERIALIZABLE.to_string())
            }
        }
    }

    /// Encode a batch leaf by leaf; one bad leaf does not affect the others.
    pub fn encode_all<'v, T, I>(&self, values: I) -> Value
    where
        T: Serialize + 'v,
        I: IntoIterator<Item = &'v T>,
    {
        Value::Array(values.into_iter().map(|v| self.to_wire(v)).collect())
    }

    /// Reconstruct an error from whatever the peer sent.
    pub fn decode(value: &Value) -> RpcError {
        match value {
            Value::Object(map) => {
                let message = match map.get("message") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => value.to_string(),
                };
                let mut err = RpcError::new(message);
                err.stack = map.get("stack").and_then(Value::as_str).map(str::to_string);
                err.data = map.get("data").cloned();
                err
            }
            Value::String(s) => RpcError::new(s.clone()),
            other => RpcError::new(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::{Error as _, Serializer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLogger {
        errors: AtomicUsize,
    }

    impl Logger for CountingLogger {
        fn log(&self, _: &str, _: &[Value]) {}
        fn info(&self, _: &str, _: &[Value]) {}
        fn assert(&self, _: bool, _: &str) {}
        fn warn(&self, _: &str, _: &[Value]) {}
        fn error(&self, _: &str, _: &[Value]) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    enum Leaf {
        Text(&'static str),
        Cyclic,
    }

    impl Serialize for Leaf {
        fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
            match self {
                Leaf::Text(t) => s.serialize_str(t),
                Leaf::Cyclic => Err(S::Error::custom("cycle detected")),
            }
        }
    }

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_encode_decode_keeps_message() {
        let logger = CountingLogger::default();
        let codec = ErrorCodec::new(&logger, false);
        let wire = codec.encode(&RpcError::new("boom"));
        assert_eq!(wire[RPC_ERROR_TAG], true);
        assert_eq!(ErrorCodec::decode(&wire).message, "boom");
    }

    #[test]
    fn test_stack_only_sent_when_enabled() {
        let logger = CountingLogger::default();
        let err = RpcError::from_error(&Outer(std::io::Error::other("disk gone")));
        assert!(err.stack.as_deref().unwrap_or("").contains("disk gone"));

        let without = ErrorCodec::new(&logger, false).encode(&err);
        assert!(without.get("stack").is_none());

        let with = ErrorCodec::new(&logger, true).encode(&err);
        assert!(with["stack"].as_str().unwrap().contains("caused by: disk gone"));
    }

    #[test]
    fn test_unserializable_leaf_is_replaced_and_logged() {
        let logger = CountingLogger::default();
        let codec = ErrorCodec::new(&logger, false);
        let batch = [Leaf::Text("blah"), Leaf::Cyclic, Leaf::Text("craig")];
        let encoded = codec.encode_all(batch.iter());
        assert_eq!(encoded, json!(["blah", UNSERIALIZABLE, "craig"]));
        assert_eq!(logger.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_is_lossy_but_total() {
        assert_eq!(ErrorCodec::decode(&json!("plain")).message, "plain");
        assert_eq!(ErrorCodec::decode(&json!(42)).message, "42");
        assert_eq!(ErrorCodec::decode(&Value::Null).message, "null");
        let odd = ErrorCodec::decode(&json!({"message": 7, "stack": "s"}));
        assert_eq!(odd.message, "7");
        assert_eq!(odd.stack.as_deref(), Some("s"));
    }

    #[test]
    fn test_from_panic_payloads() {
        let from_str = RpcError::from_panic(Box::new("bad"));
        assert_eq!(from_str.message, "handler panicked: bad");
        let from_string = RpcError::from_panic(Box::new(String::from("worse")));
        assert_eq!(from_string.message, "handler panicked: worse");
        let other = RpcError::from_panic(Box::new(12u8));
        assert!(other.message.contains("non-string"));
    }
}
