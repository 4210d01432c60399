//! Destinations: the end of the pipeline for one external vendor.
//!
//! A [`Destination`] adapter owns the vendor call. Wrapping it in a
//! [`DestinationPlugin`] gives it a key, a private sub-timeline (filters,
//! consent gates) and the enable check against settings and per-event
//! `integrations`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::client::Client;
use crate::error::SluiceError;
use crate::event::{Event, EventType};
use crate::plugin::{ClientSlot, Plugin, PluginType, UpdateType};
use crate::state::Settings;
use crate::timeline::Timeline;

/// Vendor adapter. Handlers receive events that already went through the
/// shared pipeline and the destination's own plugins.
#[async_trait]
pub trait Destination: Send + Sync + 'static {
    /// Settings key, also used by `integrations`, filters and consent.
    fn key(&self) -> &str;

    fn configure(&self, _client: &Client) {}

    fn update(&self, _settings: &Settings, _update_type: UpdateType) {}

    async fn track(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn identify(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn screen(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn group(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn alias(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn reset(&self) {}
}

#[async_trait]
impl<D: Destination + ?Sized> Destination for Arc<D> {
    fn key(&self) -> &str {
        (**self).key()
    }

    fn configure(&self, client: &Client) {
        (**self).configure(client)
    }

    fn update(&self, settings: &Settings, update_type: UpdateType) {
        (**self).update(settings, update_type)
    }

    async fn track(&self, event: Event) -> Result<()> {
        (**self).track(event).await
    }

    async fn identify(&self, event: Event) -> Result<()> {
        (**self).identify(event).await
    }

    async fn screen(&self, event: Event) -> Result<()> {
        (**self).screen(event).await
    }

    async fn group(&self, event: Event) -> Result<()> {
        (**self).group(event).await
    }

    async fn alias(&self, event: Event) -> Result<()> {
        (**self).alias(event).await
    }

    async fn flush(&self) -> Result<()> {
        (**self).flush().await
    }

    fn reset(&self) {
        (**self).reset()
    }
}

/// A destination adapter plus its private plugins.
pub struct DestinationPlugin {
    key: String,
    adapter: Box<dyn Destination>,
    timeline: Timeline,
    client: ClientSlot,
}

impl DestinationPlugin {
    pub fn new(adapter: impl Destination) -> Self {
        Self {
            key: adapter.key().to_string(),
            adapter: Box::new(adapter),
            timeline: Timeline::new(),
            client: ClientSlot::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Add a plugin to this destination only. It is configured right away if
    /// the destination already belongs to a client.
    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        self.timeline.add(Arc::clone(&plugin));
        if let Some(client) = self.client.get() {
            plugin.configure(&client);
            client.watch_settings(&plugin);
        }
    }

    pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
        if let Some(client) = self.client.get() {
            client.unwatch_settings(plugin);
        }
        self.timeline.remove(plugin)
    }

    pub fn plugins(&self, plugin_type: Option<PluginType>) -> Vec<Arc<dyn Plugin>> {
        self.timeline.plugins(plugin_type)
    }

    /// Enabled when settings exist for the key and the event did not opt out
    /// through `integrations`.
    fn is_enabled(&self, client: Option<&Client>, event: &Event) -> bool {
        let has_settings = client.is_some_and(|client| {
            client.settings().get_state().contains_key(&self.key)
        });
        has_settings && event.is_integration_enabled(&self.key)
    }

    fn report(&self, err: SluiceError) {
        if let Some(client) = self.client.get() {
            client.report_internal_error(err, false);
        }
    }

    async fn deliver(&self, event: Event) -> Result<()> {
        match event.event_type() {
            EventType::Track => self.adapter.track(event).await,
            EventType::Identify => self.adapter.identify(event).await,
            EventType::Screen => self.adapter.screen(event).await,
            EventType::Group => self.adapter.group(event).await,
            EventType::Alias => self.adapter.alias(event).await,
        }
    }
}

#[async_trait]
impl Plugin for DestinationPlugin {
    fn plugin_type(&self) -> PluginType {
        PluginType::Destination
    }

    fn name(&self) -> &str {
        &self.key
    }

    fn configure(&self, client: &Client) {
        self.client.set(client);
        self.adapter.configure(client);
        self.timeline.apply(|plugin| {
            plugin.configure(client);
            client.watch_settings(plugin);
        });
    }

    fn update(&self, settings: &Settings, update_type: UpdateType) {
        self.adapter.update(settings, update_type);
    }

    async fn execute(&self, event: Event) -> Result<Option<Event>> {
        let client = self.client.get();
        if !self.is_enabled(client.as_ref(), &event) {
            return Ok(None);
        }

        let report = |err: SluiceError| self.report(err);
        let Some(event) = self
            .timeline
            .apply_stage(PluginType::Before, event, &report)
            .await
        else {
            return Ok(None);
        };
        let Some(event) = self
            .timeline
            .apply_stage(PluginType::Enrichment, event, &report)
            .await
        else {
            return Ok(None);
        };

        self.deliver(event.clone()).await?;

        Ok(self
            .timeline
            .apply_stage(PluginType::After, event, &report)
            .await)
    }

    async fn flush(&self) -> Result<()> {
        self.adapter.flush().await
    }

    fn reset(&self) {
        self.adapter.reset();
        self.timeline.apply(|plugin| plugin.reset());
    }

    fn shutdown(&self) {
        self.timeline.apply(|plugin| plugin.shutdown());
    }

    fn as_destination(&self) -> Option<&DestinationPlugin> {
        Some(self)
    }
}

impl std::fmt::Debug for DestinationPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationPlugin")
            .field("key", &self.key)
            .field("timeline", &self.timeline)
            .finish()
    }
}
