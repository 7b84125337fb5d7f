//! Wire dialect — envelope types and their JSON encoding.
//!
//! Every unit on the wire is one UTF-8 JSON text:
//!
//! ```json
//! { "type": "invoke", "uid": "3f2a-1", "payload": [{ "fn": "math.add", "args": [1, 2] }] }
//! { "type": "results", "uid": "3f2a-1", "payload": { "results": [{ "uid": "3f2a-1", "result": 3 }] } }
//! ```
//!
//! The decoder also accepts the keyed shorthand where the dialect word is the
//! top-level key (`{"results": [...]}`); reply payloads then are the object
//! itself and invocation payloads are the value under the key.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_types::{CallKind, Capability};
use thiserror::Error;

/// The dialect vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    /// Capability descriptor announcement.
    Expose,
    Invoke,
    Promise,
    Callback,
    Listen,
    /// Remove a listener.
    Ignore,
    /// Successful replies.
    Results,
    /// Failed replies, or a logging-style report.
    Error,
}

impl EnvelopeType {
    const ALL: [EnvelopeType; 8] = [
        EnvelopeType::Expose,
        EnvelopeType::Invoke,
        EnvelopeType::Promise,
        EnvelopeType::Callback,
        EnvelopeType::Listen,
        EnvelopeType::Ignore,
        EnvelopeType::Results,
        EnvelopeType::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::Expose => "expose",
            EnvelopeType::Invoke => "invoke",
            EnvelopeType::Promise => "promise",
            EnvelopeType::Callback => "callback",
            EnvelopeType::Listen => "listen",
            EnvelopeType::Ignore => "ignore",
            EnvelopeType::Results => "results",
            EnvelopeType::Error => "error",
        }
    }

    /// The call convention this envelope requests, if it is a call.
    pub fn call_kind(self) -> Option<CallKind> {
        match self {
            EnvelopeType::Invoke => Some(CallKind::Invoke),
            EnvelopeType::Promise => Some(CallKind::Promise),
            EnvelopeType::Callback => Some(CallKind::Callback),
            EnvelopeType::Listen => Some(CallKind::Listen),
            _ => None,
        }
    }

    fn is_reply(self) -> bool {
        matches!(self, EnvelopeType::Results | EnvelopeType::Error)
    }
}

impl From<CallKind> for EnvelopeType {
    fn from(kind: CallKind) -> Self {
        match kind {
            CallKind::Invoke => EnvelopeType::Invoke,
            CallKind::Promise => EnvelopeType::Promise,
            CallKind::Callback => EnvelopeType::Callback,
            CallKind::Listen => EnvelopeType::Listen,
        }
    }
}

/// One wire-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Correlation id; absent on logging-style reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// One call descriptor inside an invocation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Dotted path of the target procedure.
    #[serde(rename = "fn")]
    pub path: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Per-descriptor correlation id. A lone descriptor may use the
    /// envelope's instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Errors from decoding or validating an inbound envelope.
#[derive(Debug, Error)]
pub enum DialectError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not an object")]
    NotObject,
    #[error("message has no recognised dialect type")]
    UnknownType,
    #[error("'{0}' is missing")]
    Missing(&'static str),
    #[error("'{0}' is not an array")]
    NotArray(&'static str),
    #[error("'{0}' is empty")]
    Empty(&'static str),
    #[error("malformed {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
}

impl Envelope {
    pub fn new(kind: EnvelopeType, uid: Option<String>, payload: Value) -> Self {
        Self { kind, uid, payload }
    }

    /// Capability announcement.
    pub fn expose(uid: &str, descriptor: &Capability) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            EnvelopeType::Expose,
            Some(uid.to_string()),
            serde_json::to_value(descriptor)?,
        ))
    }

    /// A single call of `path` using `kind`'s convention.
    pub fn call(kind: CallKind, uid: &str, path: &str, args: Vec<Value>) -> Self {
        let invocation = Invocation {
            path: path.to_string(),
            args,
            uid: None,
        };
        Self::new(
            kind.into(),
            Some(uid.to_string()),
            json!([invocation]),
        )
    }

    /// Remove `listener_id` from the listen-capable procedure at `path`.
    pub fn ignore(uid: &str, path: &str, listener_id: &str) -> Self {
        let invocation = Invocation {
            path: path.to_string(),
            args: vec![Value::String(listener_id.to_string())],
            uid: None,
        };
        Self::new(
            EnvelopeType::Ignore,
            Some(uid.to_string()),
            json!([invocation]),
        )
    }

    /// Successful reply for `uid`.
    pub fn results(uid: &str, result: Value) -> Self {
        Self::new(
            EnvelopeType::Results,
            Some(uid.to_string()),
            json!({ "results": [{ "uid": uid, "result": result }] }),
        )
    }

    /// Failed reply for `uid`; `error` is an encoded `RpcError`.
    pub fn error(uid: &str, error: Value) -> Self {
        Self::new(
            EnvelopeType::Error,
            Some(uid.to_string()),
            json!({ "error": [{ "uid": uid, "error": error }] }),
        )
    }

    /// Logging-style report: values wrapped under `message_key`, no uid.
    pub fn report(message_key: &str, values: Value) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert(message_key.to_string(), values);
        Self::new(EnvelopeType::Error, None, Value::Object(payload))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The descriptor carried by an `expose` envelope.
    pub fn capability(&self) -> Result<Capability, DialectError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| DialectError::Malformed {
            field: "descriptor",
            reason: e.to_string(),
        })
    }

    /// Call descriptors of an invocation, `listen` or `ignore` envelope.
    pub fn invocations(&self) -> Result<Vec<Invocation>, DialectError> {
        let Value::Array(items) = &self.payload else {
            return Err(DialectError::NotArray("payload"));
        };
        if items.is_empty() {
            return Err(DialectError::Empty("payload"));
        }
        items
            .iter()
            .map(|item| {
                serde_json::from_value(item.clone()).map_err(|e| DialectError::Malformed {
                    field: "invocation",
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Reply entries under `field` (`results` or `error`). Must be a
    /// non-empty array; entries are validated one by one by the caller.
    pub fn reply_entries(&self, field: &'static str) -> Result<&[Value], DialectError> {
        let entries = self.payload.get(field).ok_or(DialectError::Missing(field))?;
        let Value::Array(items) = entries else {
            return Err(DialectError::NotArray(field));
        };
        if items.is_empty() {
            return Err(DialectError::Empty(field));
        }
        Ok(items)
    }

    /// Values of a logging-style report, if this envelope is one.
    pub fn report_values(&self, message_key: &str) -> Option<&Value> {
        if self.kind != EnvelopeType::Error || self.payload.get("error").is_some() {
            return None;
        }
        self.payload.get(message_key)
    }
}

/// Correlation id of one reply entry.
pub fn entry_uid(entry: &Value) -> Option<&str> {
    entry.get("uid").and_then(Value::as_str)
}

/// Decode one raw inbound message.
pub fn decode_envelope(raw: &str) -> Result<Envelope, DialectError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(map) = value else {
        return Err(DialectError::NotObject);
    };

    if map.contains_key("type") {
        return serde_json::from_value(Value::Object(map)).map_err(|e| DialectError::Malformed {
            field: "envelope",
            reason: e.to_string(),
        });
    }

    let kind = EnvelopeType::ALL
        .into_iter()
        .find(|kind| map.contains_key(kind.as_str()))
        .ok_or(DialectError::UnknownType)?;
    let uid = map.get("uid").and_then(Value::as_str).map(str::to_string);
    let payload = if kind.is_reply() {
        Value::Object(map)
    } else {
        map.get(kind.as_str()).cloned().unwrap_or(Value::Null)
    };
    Ok(Envelope::new(kind, uid, payload))
}
