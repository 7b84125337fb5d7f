//! Link settings — the serializable half of a link's configuration.
//!
//! Runtime hooks (transport, logger, identifier generator, promise adapter)
//! are attached in `tether-wire`; everything here can be loaded from TOML or
//! JSON by the host and is validated before a link is created.

use crate::call::CallKind;
use crate::error::LinkError;
use serde::{Deserialize, Serialize};

/// Default outer key for logging-style reports.
pub const DEFAULT_MESSAGE: &str = "message";

/// How the wait between handshake attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCurve {
    /// `wait * 2^attempt`.
    #[default]
    Exponential,
    /// `wait * (attempt + 1)`.
    Linear,
    /// `wait` every time.
    Constant,
}

impl RetryCurve {
    /// Delay before retry number `attempt` (0-indexed), capped at `max_ms`.
    pub fn delay_ms(self, base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
        let raw = match self {
            RetryCurve::Exponential => {
                base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
            }
            RetryCurve::Linear => base_ms.saturating_mul(u64::from(attempt) + 1),
            RetryCurve::Constant => base_ms,
        };
        raw.min(max_ms)
    }
}

/// Tunables of one link. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Outer key wrapping values of logging-style `error` reports.
    pub message: String,
    /// Convention used by `RemoteProcedure::call`.
    pub default_async_type: CallKind,
    /// Maximum number of `expose` announcements during the handshake.
    pub create_retry: u32,
    /// Growth of the wait between announcements.
    pub create_retry_curve: RetryCurve,
    /// Initial wait (and acknowledgement window) per announcement, in ms.
    pub create_wait_ms: u64,
    /// Upper bound for any single wait between announcements, in ms.
    pub create_max_wait_ms: u64,
    /// How long a call may stay pending before it may be failed, in ms.
    pub max_ack_delay_ms: u64,
    /// Include source chains / backtraces in encoded errors.
    pub enable_stack_trace: bool,
    /// Enforce `max_ack_delay_ms` on every non-listen call.
    pub use_acks: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            message: DEFAULT_MESSAGE.to_string(),
            default_async_type: CallKind::Promise,
            create_retry: 5,
            create_retry_curve: RetryCurve::Exponential,
            create_wait_ms: 100,
            create_max_wait_ms: 5_000,
            max_ack_delay_ms: 5_000,
            enable_stack_trace: false,
            use_acks: false,
        }
    }
}

/// Keys the dialect already uses inside reply payloads.
const RESERVED_KEYS: [&str; 2] = ["results", "error"];

impl LinkSettings {
    /// Validate the settings.
    ///
    /// - `message` must be non-empty and must not shadow a dialect key.
    /// - `create_retry` must be at least 1.
    /// - `create_wait_ms` and `max_ack_delay_ms` must be non-zero.
    /// - `create_max_wait_ms` must not be below `create_wait_ms`.
    /// - `default_async_type` cannot be `listen` (it needs an event handler).
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.message.is_empty() {
            return Err(LinkError::Config("message key must not be empty".into()));
        }
        if RESERVED_KEYS.contains(&self.message.as_str()) {
            return Err(LinkError::Config(format!(
                "message key '{}' collides with a dialect field",
                self.message
            )));
        }
        if self.create_retry == 0 {
            return Err(LinkError::Config("create_retry must be at least 1".into()));
        }
        if self.create_wait_ms == 0 {
            return Err(LinkError::Config("create_wait_ms must be non-zero".into()));
        }
        if self.create_max_wait_ms < self.create_wait_ms {
            return Err(LinkError::Config(format!(
                "create_max_wait_ms ({}) is below create_wait_ms ({})",
                self.create_max_wait_ms, self.create_wait_ms
            )));
        }
        if self.max_ack_delay_ms == 0 {
            return Err(LinkError::Config("max_ack_delay_ms must be non-zero".into()));
        }
        if self.default_async_type == CallKind::Listen {
            return Err(LinkError::Config(
                "default_async_type cannot be 'listen'".into(),
            ));
        }
        Ok(())
    }
}
