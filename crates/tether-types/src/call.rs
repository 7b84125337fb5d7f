//! Invocation conventions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four ways a remote procedure can be called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Synchronous on the exposing side; resolves with the return value.
    Invoke,
    /// The exposing side returns a future; resolves with its output.
    #[default]
    Promise,
    /// Error-first continuation; resolves with the array of success values.
    Callback,
    /// Persistent subscription, delivered until ignored.
    Listen,
}

impl CallKind {
    pub const ALL: [CallKind; 4] = [
        CallKind::Invoke,
        CallKind::Promise,
        CallKind::Callback,
        CallKind::Listen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Invoke => "invoke",
            CallKind::Promise => "promise",
            CallKind::Callback => "callback",
            CallKind::Listen => "listen",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown call kind '{s}'"))
    }
}
