//! Client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SluiceError;
use crate::persistor::{Persistor, DEFAULT_SAVE_DELAY};
use crate::state::Settings;

/// Called with every error the pipeline swallowed.
pub type ErrorHandler = Arc<dyn Fn(&SluiceError) + Send + Sync>;

/// Configuration for a [`Client`](crate::Client).
///
/// ```ignore
/// let config = ClientConfig::new("write-key")
///     .with_persistor(Arc::new(MemoryPersistor::new()))
///     .with_default_settings(settings)
///     .with_error_handler(|err| eprintln!("{err}"));
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub write_key: String,
    /// Backend for the client's stores. Stores stay in memory without one.
    pub persistor: Option<Arc<dyn Persistor>>,
    pub store_save_delay: Duration,
    /// Integration settings used when none were saved.
    pub default_settings: Settings,
    /// Log every processed event at `info` instead of `debug`.
    pub debug: bool,
    pub error_handler: Option<ErrorHandler>,
}

impl ClientConfig {
    pub fn new(write_key: impl Into<String>) -> Self {
        Self {
            write_key: write_key.into(),
            persistor: None,
            store_save_delay: DEFAULT_SAVE_DELAY,
            default_settings: Settings::new(),
            debug: false,
            error_handler: None,
        }
    }

    /// Load the serializable part of the configuration from JSON:
    /// `write_key`, `save_delay_ms`, `default_settings` and `debug`.
    pub fn from_json(json: &str) -> Result<Self, SluiceError> {
        let file: ConfigFile = serde_json::from_str(json)?;
        let mut config = Self::new(file.write_key);
        if let Some(ms) = file.save_delay_ms {
            config.store_save_delay = Duration::from_millis(ms);
        }
        config.default_settings = file.default_settings;
        config.debug = file.debug;
        Ok(config)
    }

    pub fn with_persistor(mut self, persistor: Arc<dyn Persistor>) -> Self {
        self.persistor = Some(persistor);
        self
    }

    pub fn with_save_delay(mut self, save_delay: Duration) -> Self {
        self.store_save_delay = save_delay;
        self
    }

    pub fn with_default_settings(mut self, settings: Settings) -> Self {
        self.default_settings = settings;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&SluiceError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("write_key", &self.write_key)
            .field("persisted", &self.persistor.is_some())
            .field("store_save_delay", &self.store_save_delay)
            .field("default_settings", &self.default_settings)
            .field("debug", &self.debug)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    write_key: String,
    #[serde(default)]
    save_delay_ms: Option<u64>,
    #[serde(default)]
    default_settings: Settings,
    #[serde(default)]
    debug: bool,
}
