//! Persistor contract and persistence configuration for stores.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::SluiceError;

/// Debounce window between the last state change and the write.
pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_millis(1000);

/// Durable key-value backend for store state.
///
/// Supplied by the host; stores only hold a shared reference. State travels
/// as JSON so one persistor can serve stores of any state type.
#[async_trait]
pub trait Persistor: Send + Sync {
    /// Read the state saved under `key`, or `None` if nothing was saved.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Save `state` under `key`, replacing any previous value.
    async fn set(&self, key: &str, state: Value) -> Result<()>;
}

#[async_trait]
impl<P: Persistor + ?Sized> Persistor for Arc<P> {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, state: Value) -> Result<()> {
        (**self).set(key, state).await
    }
}

type OnInitialized<T> = Box<dyn FnOnce(&T) + Send>;

/// Receives persistor failures. Dispatch callers never see them.
pub type PersistenceErrorHandler = Arc<dyn Fn(SluiceError) + Send + Sync>;

/// How a [`Store`](crate::Store) persists itself.
pub struct PersistenceConfig<T> {
    pub store_id: String,
    pub save_delay: Duration,
    pub persistor: Arc<dyn Persistor>,
    pub(crate) on_initialized: Option<OnInitialized<T>>,
    pub(crate) on_error: Option<PersistenceErrorHandler>,
}

impl<T> PersistenceConfig<T> {
    pub fn new(store_id: impl Into<String>, persistor: Arc<dyn Persistor>) -> Self {
        Self {
            store_id: store_id.into(),
            save_delay: DEFAULT_SAVE_DELAY,
            persistor,
            on_initialized: None,
            on_error: None,
        }
    }

    pub fn with_save_delay(mut self, save_delay: Duration) -> Self {
        self.save_delay = save_delay;
        self
    }

    /// Called once with the restored (or freshly saved) state after the
    /// initial load.
    pub fn on_initialized(mut self, callback: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_initialized = Some(Box::new(callback));
        self
    }

    /// Called with every failed read, write or serialization of this store's
    /// state, after it was logged.
    pub fn on_error(mut self, handler: impl Fn(SluiceError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }
}

/// Merge `overlay` into `base`. Objects merge key by key, recursively;
/// anything else in `overlay` replaces what `base` had.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
