//! Plugin contract.
//!
//! A plugin's [`PluginType`] decides where the timeline runs it:
//!
//! - `Before`: first, for every event. May drop the event.
//! - `Enrichment`: after `Before`. May attach data or drop the event.
//! - `Destination`: fan-out; each destination gets its own copy.
//! - `After`: observes the final event. Return values are ignored.
//! - `Utility`: never run by the timeline. Used by plugins that only attach
//!   other plugins to destinations.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::client::{Client, WeakClient};
use crate::destination::DestinationPlugin;
use crate::event::Event;
use crate::state::Settings;
use crate::sync::{read, write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginType {
    Before,
    Enrichment,
    Destination,
    After,
    Utility,
}

impl PluginType {
    /// Stage order used when listing plugins.
    pub const ALL: [PluginType; 5] = [
        PluginType::Before,
        PluginType::Enrichment,
        PluginType::Utility,
        PluginType::Destination,
        PluginType::After,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Before => 0,
            Self::Enrichment => 1,
            Self::Destination => 2,
            Self::After => 3,
            Self::Utility => 4,
        }
    }
}

/// Whether a settings update is the first one a plugin sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Initial,
    Refresh,
}

/// A stage-tagged unit of event processing.
///
/// Returning `Ok(None)` from [`execute`](Plugin::execute) drops the event for
/// the rest of the walk. Returning an error is logged and reported, and the
/// walk continues with the event as it was before this plugin ran.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn plugin_type(&self) -> PluginType;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once when the plugin is added to a client. Plugins that call
    /// back into the client keep the handle in a [`ClientSlot`].
    fn configure(&self, _client: &Client) {}

    /// Called with the integration settings when the plugin is added and on
    /// every settings change.
    fn update(&self, _settings: &Settings, _update_type: UpdateType) {}

    async fn execute(&self, event: Event) -> Result<Option<Event>> {
        Ok(Some(event))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn reset(&self) {}

    fn shutdown(&self) {}

    fn as_destination(&self) -> Option<&DestinationPlugin> {
        None
    }
}

/// Address of the plugin's allocation, used to find it again for removal.
pub(crate) fn plugin_addr(plugin: &Arc<dyn Plugin>) -> usize {
    Arc::as_ptr(plugin) as *const () as usize
}

/// Non-owning back-reference from a plugin to the client it belongs to.
#[derive(Debug, Default)]
pub struct ClientSlot {
    client: RwLock<Option<WeakClient>>,
}

impl ClientSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, client: &Client) {
        *write(&self.client) = Some(client.downgrade());
    }

    /// The client, if the plugin was configured and the client still exists.
    pub fn get(&self) -> Option<Client> {
        read(&self.client).as_ref().and_then(WeakClient::upgrade)
    }
}
