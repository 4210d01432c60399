//! # Sluice
//!
//! A client-side event pipeline: applications emit semantic events, plugins
//! enrich, filter and gate them, and destinations deliver them to external
//! analytics vendors. State the pipeline depends on (settings, filters,
//! context, user info) lives in serialized, observable, optionally persisted
//! stores.
//!
//! ## Core Concepts
//!
//! - [`Store`] = serialized state. Every change is an [`Action`] applied in
//!   dispatch order by a single pump.
//! - [`Plugin`] = a unit of processing, placed by its [`PluginType`].
//! - [`DestinationPlugin`] = a vendor [`Destination`] plus its own plugins.
//! - [`Client`] = owns the [`Timeline`], the stores and the plugins.
//!
//! ## Architecture
//!
//! ```text
//! track() / identify() / ...
//!     │
//!     ▼ process()
//! Client ── stamp ids ──► Timeline
//!                            │
//!                            ├─► before      (InjectUserInfo, InjectContext, Consent, filters)
//!                            ├─► enrichment  (Session, ...)
//!                            │
//!                            ├─► destination A ──► own before (filter, consent) ──► vendor SDK
//!                            ├─► destination B ──► own before (filter, consent) ──► vendor SDK
//!                            │
//!                            └─► after       (observers)
//!
//! Store<Settings> ──subscribe──► plugin.update()
//! BridgeRegistry  ──dispatch───► Store<Context> / Store<UserInfo> / ...
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Dispatch order is program order** - actions apply in the order
//!    `dispatch` was called, whatever their latency
//! 2. **One pump per store** - state is only written by the store's pump
//! 3. **Failed actions are no-ops** - no state change, no notification
//! 4. **Destinations are isolated** - one failing destination never stops
//!    the others or the `after` stage
//! 5. **Plugins never own the client** - they hold a [`WeakClient`]
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sluice_core::{Client, ClientConfig, DestinationFiltersPlugin};
//!
//! let client = Client::new(ClientConfig::new("write-key"));
//! client.add(Arc::new(DestinationFiltersPlugin::new()));
//! client.add_destination(MyVendor::new(), Some(vendor_settings)).await;
//! client.init().await?;
//!
//! client.track("Order Completed", properties).await;
//! ```

// Core modules
mod bridge;
mod client;
mod config;
mod destination;
mod error;
mod event;
mod persistor;
mod plugin;
mod state;
mod store;
mod sync;
mod timeline;

// Plugins
mod consent;
mod enrichment;
pub mod filters;
mod session;
mod waiting;


// Re-export store types
pub use persistor::{
    deep_merge, PersistenceConfig, PersistenceErrorHandler, Persistor, DEFAULT_SAVE_DELAY,
};
pub use store::{Action, State, Store, Unsubscribe, DEFAULT_STORE_ID};

// Re-export bridge types
pub use bridge::{ActionCreator, BridgeRegistry, BridgeStore};

// Re-export event types
pub use event::{apply_raw_event_data, Event, EventKind, EventType, JsonMap};
pub use state::{Context, DestinationFilters, Settings, UserInfo};

// Re-export pipeline types
pub use client::{
    Client, WeakClient, ADD_CONTEXT_ACTION, SET_FILTERS_ACTION, SET_SETTINGS_ACTION,
    SET_USER_INFO_ACTION,
};
pub use config::{ClientConfig, ErrorHandler};
pub use destination::{Destination, DestinationPlugin};
pub use plugin::{ClientSlot, Plugin, PluginType, UpdateType};
pub use timeline::{ErrorReporter, Timeline};

// Re-export error types
pub use error::{ErrorKind, SluiceError};

// Re-export plugins
pub use consent::{
    CategoryConsentProvider, CategoryListener, ConsentCallback, ConsentFilterPlugin,
    ConsentManager, ConsentPlugin, ConsentState, ConsentStatus, ManagedConsentProvider,
    CONSENT_PREFERENCE_EVENT,
};
pub use enrichment::{InjectContext, InjectUserInfo};
pub use filters::{apply_rule, DestinationFiltersPlugin, RoutingRule};
pub use session::{SessionPlugin, DEFAULT_SESSION_TIMEOUT};
pub use waiting::WaitingPlugin;

// Re-export commonly used external types
pub use async_trait::async_trait;
