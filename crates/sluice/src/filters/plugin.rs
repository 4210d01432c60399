//! The plugin that keeps routing rules in step with the filter store.
//!
//! One workspace instance sits in the `before` stage. Each destination gets
//! its own keyed instance, installed as the destination is loaded. Every
//! instance re-reads its rule whenever the filter store changes.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use super::{apply_rule, RoutingRule};
use crate::client::Client;
use crate::event::Event;
use crate::plugin::{Plugin, PluginType};
use crate::state::DestinationFilters;
use crate::store::Unsubscribe;
use crate::sync::{lock, read, write};

/// Filter store key of the rule applied to every destination.
pub const WORKSPACE_FILTER_KEY: &str = "";

/// Applies routing rules from the client's filter store.
///
/// Added to a client, it applies the workspace rule in the shared `before`
/// stage and installs a keyed instance into every destination, present or
/// added later, which applies that destination's rule.
#[derive(Debug, Default)]
pub struct DestinationFiltersPlugin {
    key: Option<String>,
    rule: Arc<RwLock<Option<RoutingRule>>>,
    watch: Mutex<Option<Unsubscribe>>,
}

impl DestinationFiltersPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance applying the rule stored under `key`.
    pub fn for_destination(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    fn filter_key(&self) -> &str {
        self.key.as_deref().unwrap_or(WORKSPACE_FILTER_KEY)
    }

    fn filter(&self, event: Event) -> Option<Event> {
        match read(&self.rule).as_ref() {
            Some(rule) => apply_rule(rule, event),
            None => Some(event),
        }
    }
}

#[async_trait]
impl Plugin for DestinationFiltersPlugin {
    fn plugin_type(&self) -> PluginType {
        PluginType::Before
    }

    fn name(&self) -> &str {
        "DestinationFilters"
    }

    fn configure(&self, client: &Client) {
        if self.key.is_none() {
            client.on_plugin_loaded(|plugin| {
                if let Some(destination) = plugin.as_destination() {
                    destination.add(Arc::new(DestinationFiltersPlugin::for_destination(
                        destination.key(),
                    )));
                }
            });
        }

        let key = self.filter_key().to_string();
        *write(&self.rule) = client.filters().get_state().get(&key).cloned();

        let rule = Arc::clone(&self.rule);
        let unsubscribe = client.filters().subscribe(move |filters: &DestinationFilters| {
            *write(&rule) = filters.get(&key).cloned();
        });
        if let Some(previous) = lock(&self.watch).replace(unsubscribe) {
            previous.unsubscribe();
        }
    }

    async fn execute(&self, event: Event) -> Result<Option<Event>> {
        Ok(self.filter(event))
    }

    fn shutdown(&self) {
        if let Some(watch) = lock(&self.watch).take() {
            watch.unsubscribe();
        }
    }
}
