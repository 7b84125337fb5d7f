//! Link configuration — settings plus the runtime hooks a link needs.

use crate::promise::{OneshotAdapter, PromiseAdapter};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tether_types::{
    CallKind, LinkError, LinkSettings, Logger, SequentialUid, TracingLogger, UidGenerator,
};

/// Everything needed to create a link. Only the transport is required.
#[derive(Clone, Default)]
pub struct LinkConfig {
    pub settings: LinkSettings,
    pub transport: Option<Arc<dyn Transport>>,
    /// Correlation id generator; defaults to [`SequentialUid`].
    pub uid: Option<Arc<dyn UidGenerator>>,
    /// Initial logger; defaults to [`TracingLogger`].
    pub logger: Option<Arc<dyn Logger>>,
    /// Deferred factory; defaults to [`OneshotAdapter`].
    pub promise_adapter: Option<Arc<dyn PromiseAdapter>>,
}

impl LinkConfig {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            ..Default::default()
        }
    }

    pub fn with_settings(mut self, settings: LinkSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_uid(mut self, uid: Arc<dyn UidGenerator>) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_promise_adapter(mut self, adapter: Arc<dyn PromiseAdapter>) -> Self {
        self.promise_adapter = Some(adapter);
        self
    }

    /// Check the configuration and freeze it.
    pub fn validate(self) -> Result<Arc<ValidatedConfig>, LinkError> {
        let transport = self
            .transport
            .ok_or_else(|| LinkError::Config("transport is required".into()))?;
        self.settings.validate()?;
        Ok(Arc::new(ValidatedConfig {
            settings: self.settings,
            transport,
            uid: self.uid.unwrap_or_else(|| Arc::new(SequentialUid::new())),
            logger: self.logger.unwrap_or_else(|| Arc::new(TracingLogger)),
            promise_adapter: self
                .promise_adapter
                .unwrap_or_else(|| Arc::new(OneshotAdapter)),
        }))
    }
}

impl std::fmt::Debug for LinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkConfig")
            .field("settings", &self.settings)
            .field("transport", &self.transport.is_some())
            .field("uid", &self.uid.is_some())
            .field("logger", &self.logger.is_some())
            .field("promise_adapter", &self.promise_adapter.is_some())
            .finish()
    }
}

/// A validated, immutable configuration.
pub struct ValidatedConfig {
    settings: LinkSettings,
    transport: Arc<dyn Transport>,
    uid: Arc<dyn UidGenerator>,
    logger: Arc<dyn Logger>,
    promise_adapter: Arc<dyn PromiseAdapter>,
}

impl ValidatedConfig {
    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn uid(&self) -> Arc<dyn UidGenerator> {
        Arc::clone(&self.uid)
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        Arc::clone(&self.logger)
    }

    pub fn promise_adapter(&self) -> Arc<dyn PromiseAdapter> {
        Arc::clone(&self.promise_adapter)
    }

    pub fn message_key(&self) -> &str {
        &self.settings.message
    }

    pub fn default_kind(&self) -> CallKind {
        self.settings.default_async_type
    }

    pub fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.settings.max_ack_delay_ms)
    }

    pub fn handshake_window(&self) -> Duration {
        Duration::from_millis(self.settings.create_wait_ms)
    }
}

impl std::fmt::Debug for ValidatedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedConfig")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
