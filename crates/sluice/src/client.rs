//! The pipeline owner.
//!
//! A [`Client`] owns the timeline, the state stores and the plugin-loaded
//! observers. Plugins only ever hold a [`WeakClient`], so dropping the last
//! `Client` handle tears the whole pipeline down.
//!
//! Events processed before [`Client::init`] completes are stamped and kept
//! in arrival order, then replayed once the stores are loaded and the
//! built-in plugins are in place.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeRegistry, BridgeStore};
use crate::config::ClientConfig;
use crate::destination::{Destination, DestinationPlugin};
use crate::enrichment::{InjectContext, InjectUserInfo};
use crate::error::SluiceError;
use crate::event::{apply_raw_event_data, Event, JsonMap};
use crate::persistor::{deep_merge, PersistenceConfig};
use crate::plugin::{plugin_addr, Plugin, PluginType, UpdateType};
use crate::state::{Context, DestinationFilters, Settings, UserInfo};
use crate::store::{Action, State, Store, Unsubscribe};
use crate::sync::lock;
use crate::timeline::Timeline;

/// Bridge action merging its payload into the context store.
pub const ADD_CONTEXT_ACTION: &str = "add-context";
/// Bridge action merging its payload into the user info store.
pub const SET_USER_INFO_ACTION: &str = "set-user-info";
/// Bridge action replacing the integration settings.
pub const SET_SETTINGS_ACTION: &str = "set-settings";
/// Bridge action replacing the destination filters.
pub const SET_FILTERS_ACTION: &str = "set-filters";

type PluginObserver = Arc<dyn Fn(&Arc<dyn Plugin>) + Send + Sync>;

#[derive(Default)]
struct Startup {
    ready: bool,
    plugins: Vec<Arc<dyn Plugin>>,
    events: Vec<Event>,
}

struct ClientInner {
    config: ClientConfig,
    timeline: Timeline,
    settings: Store<Settings>,
    filters: Store<DestinationFilters>,
    context: Store<Context>,
    user_info: Store<UserInfo>,
    observers: Mutex<Vec<PluginObserver>>,
    settings_watch: Mutex<HashMap<usize, Unsubscribe>>,
    startup: Mutex<Startup>,
    init_started: AtomicBool,
}

/// Handle to the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Non-owning client handle held by plugins.
#[derive(Clone, Default)]
pub struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

impl fmt::Debug for WeakClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakClient")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("write_key", &self.inner.config.write_key)
            .field("timeline", &self.inner.timeline)
            .finish()
    }
}

fn open_store<T>(
    config: &ClientConfig,
    name: &str,
    initial: T,
    client: &Weak<ClientInner>,
) -> Store<T>
where
    T: State + Serialize + DeserializeOwned,
{
    match &config.persistor {
        Some(persistor) => {
            let client = client.clone();
            Store::persisted(
                initial,
                PersistenceConfig::new(
                    format!("{}-{}", config.write_key, name),
                    Arc::clone(persistor),
                )
                .with_save_delay(config.store_save_delay)
                .on_error(move |err| {
                    if let Some(inner) = client.upgrade() {
                        Client { inner }.report_internal_error(err, false);
                    }
                }),
            )
        }
        None => Store::new(initial),
    }
}

impl Client {
    /// Build a client. Persisted stores start loading right away, so this
    /// must be called from within a tokio runtime when a persistor is set.
    pub fn new(config: ClientConfig) -> Self {
        let inner = Arc::new_cyclic(|client| {
            let settings = open_store(
                &config,
                "settings",
                config.default_settings.clone(),
                client,
            );
            let filters = open_store(&config, "filters", DestinationFilters::new(), client);
            let context = open_store(&config, "context", Context::new(), client);
            let user_info = open_store(&config, "userInfo", UserInfo::anonymous(), client);

            ClientInner {
                config,
                timeline: Timeline::new(),
                settings,
                filters,
                context,
                user_info,
                observers: Mutex::new(Vec::new()),
                settings_watch: Mutex::new(HashMap::new()),
                startup: Mutex::new(Startup::default()),
                init_started: AtomicBool::new(false),
            }
        });

        Self { inner }
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn settings(&self) -> &Store<Settings> {
        &self.inner.settings
    }

    pub fn filters(&self) -> &Store<DestinationFilters> {
        &self.inner.filters
    }

    pub fn context(&self) -> &Store<Context> {
        &self.inner.context
    }

    pub fn user_info(&self) -> &Store<UserInfo> {
        &self.inner.user_info
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.inner.startup).ready
    }

    /// Wait for persisted state, install the built-in plugins, then add the
    /// plugins and replay the events that arrived before now.
    pub async fn init(&self) -> Result<(), SluiceError> {
        if self.inner.init_started.swap(true, Ordering::SeqCst) {
            return Err(SluiceError::Initialization(
                "client already initialized".into(),
            ));
        }

        futures::join!(
            self.inner.settings.wait_initialized(),
            self.inner.filters.wait_initialized(),
            self.inner.context.wait_initialized(),
            self.inner.user_info.wait_initialized(),
        );

        self.add_now(Arc::new(InjectUserInfo::new()));
        self.add_now(Arc::new(InjectContext::new()));

        loop {
            let (plugins, events) = {
                let mut startup = lock(&self.inner.startup);
                if startup.plugins.is_empty() && startup.events.is_empty() {
                    startup.ready = true;
                    break;
                }
                (
                    std::mem::take(&mut startup.plugins),
                    std::mem::take(&mut startup.events),
                )
            };

            for plugin in plugins {
                self.add_now(plugin);
            }
            if !events.is_empty() {
                debug!(count = events.len(), "replaying events queued before init");
            }
            for event in events {
                self.run_timeline(event).await;
            }
        }

        info!(write_key = %self.inner.config.write_key, "client ready");
        Ok(())
    }

    /// Add a plugin. Before [`init`](Self::init) completes it is queued.
    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        {
            let mut startup = lock(&self.inner.startup);
            if !startup.ready {
                startup.plugins.push(plugin);
                return;
            }
        }
        self.add_now(plugin);
    }

    /// Wrap `adapter` in a [`DestinationPlugin`] and add it. Explicit
    /// `settings` are stored under the destination key first.
    pub async fn add_destination(
        &self,
        adapter: impl Destination,
        settings: Option<JsonMap>,
    ) -> Arc<DestinationPlugin> {
        let destination = Arc::new(DestinationPlugin::new(adapter));
        if let Some(settings) = settings {
            let key = destination.key().to_string();
            self.inner
                .settings
                .dispatch(Action::map(move |mut all: Settings| {
                    all.insert(key, Value::Object(settings));
                    all
                }))
                .await;
        }
        self.add(Arc::clone(&destination) as Arc<dyn Plugin>);
        destination
    }

    fn add_now(&self, plugin: Arc<dyn Plugin>) {
        plugin.configure(self);
        self.watch_settings(&plugin);

        // Holding the observer lock while inserting gives every observer each
        // plugin exactly once; see `on_plugin_loaded`.
        let observers = {
            let observers = lock(&self.inner.observers);
            self.inner.timeline.add(Arc::clone(&plugin));
            observers.clone()
        };
        debug!(plugin = %plugin.name(), "plugin added");

        for observer in observers {
            observer(&plugin);
        }
    }

    pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
        let addr = plugin_addr(plugin);
        lock(&self.inner.startup)
            .plugins
            .retain(|queued| plugin_addr(queued) != addr);
        self.unwatch_settings(plugin);
        self.inner.timeline.remove(plugin)
    }

    /// Plugins of one type, or all in the order before, enrichment, utility,
    /// destination, after.
    pub fn get_plugins(&self, plugin_type: Option<PluginType>) -> Vec<Arc<dyn Plugin>> {
        self.inner.timeline.plugins(plugin_type)
    }

    /// Call `callback` for every plugin already added and every plugin added
    /// from now on.
    pub fn on_plugin_loaded(&self, callback: impl Fn(&Arc<dyn Plugin>) + Send + Sync + 'static) {
        let callback: PluginObserver = Arc::new(callback);
        let present = {
            let mut observers = lock(&self.inner.observers);
            observers.push(Arc::clone(&callback));
            self.inner.timeline.plugins(None)
        };
        for plugin in &present {
            callback(plugin);
        }
    }

    /// Deliver settings to `plugin` now (if any) and on every change.
    ///
    /// The subscription is registered before the current settings are read,
    /// so a change landing in between is never missed. `Initial` goes out
    /// exactly once, ahead of any `Refresh`.
    pub(crate) fn watch_settings(&self, plugin: &Arc<dyn Plugin>) {
        let delivered = Arc::new(Mutex::new(false));

        let target = Arc::downgrade(plugin);
        let seen = Arc::clone(&delivered);
        let unsubscribe = self.inner.settings.subscribe(move |settings: &Settings| {
            if let Some(plugin) = target.upgrade() {
                let mut delivered = lock(&seen);
                let update_type = if *delivered {
                    UpdateType::Refresh
                } else {
                    UpdateType::Initial
                };
                *delivered = true;
                plugin.update(settings, update_type);
            }
        });

        let previous = lock(&self.inner.settings_watch).insert(plugin_addr(plugin), unsubscribe);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }

        let mut delivered = lock(&delivered);
        if !*delivered {
            let current = self.inner.settings.get_state();
            if !current.is_empty() {
                plugin.update(&current, UpdateType::Initial);
                *delivered = true;
            }
        }
    }

    pub(crate) fn unwatch_settings(&self, plugin: &Arc<dyn Plugin>) {
        let watch = lock(&self.inner.settings_watch).remove(&plugin_addr(plugin));
        if let Some(watch) = watch {
            watch.unsubscribe();
        }
    }

    /// Stamp `event` and run it through the timeline. Before `init` completes
    /// the stamped event is queued and `None` is returned.
    pub async fn process(&self, event: Event) -> Option<Event> {
        let event = apply_raw_event_data(event, &self.inner.user_info.get_state());
        {
            let mut startup = lock(&self.inner.startup);
            if !startup.ready {
                debug!(message_id = %event.message_id, "client not ready, queueing event");
                startup.events.push(event);
                return None;
            }
        }
        self.run_timeline(event).await
    }

    async fn run_timeline(&self, event: Event) -> Option<Event> {
        let report = |err: SluiceError| self.report_internal_error(err, false);
        let processed = self.inner.timeline.process(event, &report).await;

        if let Some(event) = &processed {
            let event_type = event.event_type().as_str();
            if self.inner.config.debug {
                info!(message_id = %event.message_id, "{event_type} event saved");
            } else {
                debug!(message_id = %event.message_id, "{event_type} event saved");
            }
        }
        processed
    }

    pub async fn track(&self, event: impl Into<String>, properties: JsonMap) {
        self.process(Event::track(event, properties)).await;
    }

    pub async fn screen(&self, name: impl Into<String>, properties: JsonMap) {
        self.process(Event::screen(name, properties)).await;
    }

    pub async fn identify(&self, user_id: Option<String>, traits: JsonMap) {
        self.process(Event::identify(user_id, traits)).await;
    }

    pub async fn group(&self, group_id: impl Into<String>, traits: JsonMap) {
        self.process(Event::group(group_id, traits)).await;
    }

    pub async fn alias(&self, new_user_id: impl Into<String>) {
        let user = self.inner.user_info.get_state();
        let previous_id = user.user_id.unwrap_or(user.anonymous_id);
        self.process(Event::alias(new_user_id, previous_id)).await;
    }

    /// Flush every plugin concurrently. Failures are reported, not returned.
    pub async fn flush(&self) {
        let plugins = self.inner.timeline.plugins(None);
        let flushes = plugins.iter().map(|plugin| async move {
            (plugin.name().to_string(), plugin.flush().await)
        });

        for (name, result) in join_all(flushes).await {
            if let Err(err) = result {
                self.report_internal_error(SluiceError::Flush(format!("{name}: {err:#}")), false);
            }
        }
    }

    /// Forget the current user. A new anonymous id is generated unless
    /// `reset_anonymous_id` is false.
    pub async fn reset(&self, reset_anonymous_id: bool) {
        self.inner
            .user_info
            .dispatch(Action::map(move |current: UserInfo| UserInfo {
                anonymous_id: if reset_anonymous_id {
                    Uuid::new_v4().to_string()
                } else {
                    current.anonymous_id
                },
                user_id: None,
                traits: JsonMap::new(),
            }))
            .await;

        self.inner.timeline.apply(|plugin| {
            if std::panic::catch_unwind(AssertUnwindSafe(|| plugin.reset())).is_err() {
                self.report_internal_error(
                    SluiceError::Reset(format!("{} panicked during reset", plugin.name())),
                    false,
                );
            }
        });
    }

    /// Shut plugins down and stop delivering settings to them.
    pub fn shutdown(&self) {
        self.inner.timeline.apply(|plugin| plugin.shutdown());

        let watches: Vec<Unsubscribe> = lock(&self.inner.settings_watch)
            .drain()
            .map(|(_, watch)| watch)
            .collect();
        for watch in watches {
            watch.unsubscribe();
        }
    }

    /// Register the client's stores with `registry` under the external
    /// action keys.
    pub fn register_bridge(&self, registry: &BridgeRegistry) {
        registry.register_store(BridgeStore::new(self.inner.context.clone()).action(
            ADD_CONTEXT_ACTION,
            |payload| {
                Action::new(move |context: Context| {
                    anyhow::ensure!(payload.is_object(), "context payload must be an object");
                    let mut merged = Value::Object(context);
                    deep_merge(&mut merged, payload);
                    match merged {
                        Value::Object(context) => Ok(context),
                        _ => anyhow::bail!("context is no longer an object"),
                    }
                })
            },
        ));

        registry.register_store(BridgeStore::new(self.inner.user_info.clone()).action(
            SET_USER_INFO_ACTION,
            |payload| {
                Action::new(move |user: UserInfo| {
                    let mut merged = serde_json::to_value(&user)?;
                    deep_merge(&mut merged, payload);
                    Ok(serde_json::from_value(merged)?)
                })
            },
        ));

        registry.register_store(BridgeStore::new(self.inner.settings.clone()).action(
            SET_SETTINGS_ACTION,
            |payload| {
                Action::new(move |_: Settings| match payload {
                    Value::Object(settings) => Ok(settings),
                    _ => anyhow::bail!("settings payload must be an object"),
                })
            },
        ));

        registry.register_store(BridgeStore::new(self.inner.filters.clone()).action(
            SET_FILTERS_ACTION,
            |payload| Action::new(move |_: DestinationFilters| Ok(serde_json::from_value(payload)?)),
        ));
    }

    /// Log `err` and hand it to the configured error handler.
    pub fn report_internal_error(&self, err: SluiceError, fatal: bool) {
        if fatal {
            error!(kind = ?err.kind(), error = %err, "fatal internal error");
        } else {
            warn!(kind = ?err.kind(), error = %err, "internal error");
        }

        if let Some(handler) = &self.inner.config.error_handler {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&err))).is_err() {
                warn!("error handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<Event>>,
        updates: Mutex<Vec<UpdateType>>,
        settings: Mutex<Vec<Settings>>,
    }

    #[async_trait]
    impl Plugin for Collect {
        fn plugin_type(&self) -> PluginType {
            PluginType::After
        }

        fn update(&self, settings: &Settings, update_type: UpdateType) {
            self.updates.lock().unwrap().push(update_type);
            self.settings.lock().unwrap().push(settings.clone());
        }

        async fn execute(&self, event: Event) -> Result<Option<Event>> {
            self.events.lock().unwrap().push(event.clone());
            Ok(Some(event))
        }
    }

    fn names(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| event.name().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn events_before_init_are_replayed_in_order() {
        let client = Client::new(ClientConfig::new("key"));
        let collect = Arc::new(Collect::default());
        client.add(collect.clone());

        assert!(client.process(Event::track("first", JsonMap::new())).await.is_none());
        client.track("second", JsonMap::new()).await;
        assert!(client.get_plugins(None).is_empty());

        client.init().await.unwrap();
        client.track("third", JsonMap::new()).await;

        assert_eq!(
            names(&collect.events.lock().unwrap()),
            vec!["first", "second", "third"]
        );
        assert!(client.init().await.is_err());
    }

    #[tokio::test]
    async fn built_ins_run_before_user_plugins() {
        let client = Client::new(ClientConfig::new("key"));
        client.init().await.unwrap();
        client.add(Arc::new(Collect::default()));

        let names: Vec<String> = client
            .get_plugins(None)
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect();
        assert!(names[0].ends_with("InjectUserInfo"));
        assert!(names[1].ends_with("InjectContext"));
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn settings_updates_are_initial_then_refresh() {
        let client = Client::new(ClientConfig::new("key"));
        client.init().await.unwrap();
        let collect = Arc::new(Collect::default());
        client.add(collect.clone());
        assert!(collect.updates.lock().unwrap().is_empty());

        client
            .settings()
            .dispatch(Action::map(|mut s: Settings| {
                s.insert("A".into(), json!({}));
                s
            }))
            .await;
        client
            .settings()
            .dispatch(Action::map(|mut s: Settings| {
                s.insert("B".into(), json!({}));
                s
            }))
            .await;

        assert_eq!(
            *collect.updates.lock().unwrap(),
            vec![UpdateType::Initial, UpdateType::Refresh]
        );

        let plugin: Arc<dyn Plugin> = collect.clone();
        assert!(client.remove(&plugin));
        client
            .settings()
            .dispatch(Action::map(|_: Settings| Settings::new()))
            .await;
        assert_eq!(collect.updates.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plugin_added_during_a_settings_change_sees_the_latest_settings() {
        let mut defaults = Settings::new();
        defaults.insert("A".into(), json!({}));
        let client = Client::new(ClientConfig::new("key").with_default_settings(defaults));
        client.init().await.unwrap();

        for round in 0..20 {
            let collect = Arc::new(Collect::default());
            let key = format!("B{round}");
            let pending = client.settings().dispatch(Action::map(move |mut s: Settings| {
                s.insert(key, json!({}));
                s
            }));
            client.add(collect.clone());
            pending.await;

            let updates = collect.updates.lock().unwrap().clone();
            assert_eq!(updates.first(), Some(&UpdateType::Initial));
            assert_eq!(
                updates.iter().filter(|u| **u == UpdateType::Initial).count(),
                1
            );
            let latest = collect.settings.lock().unwrap().last().cloned().unwrap();
            assert!(latest.contains_key(&format!("B{round}")));
        }
    }

    #[tokio::test]
    async fn plugin_loaded_observers_see_each_plugin_once() {
        let client = Client::new(ClientConfig::new("key"));
        client.init().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.on_plugin_loaded(move |plugin| sink.lock().unwrap().push(plugin_addr(plugin)));
        let collect: Arc<dyn Plugin> = Arc::new(Collect::default());
        client.add(Arc::clone(&collect));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last(), Some(&plugin_addr(&collect)));
    }

    #[tokio::test]
    async fn identify_and_reset_update_user_info() {
        let client = Client::new(ClientConfig::new("key"));
        client.init().await.unwrap();
        let anonymous_id = client.user_info().get_state().anonymous_id;

        let traits = match json!({ "plan": "pro" }) {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        client.identify(Some("user-1".into()), traits).await;
        let user = client.user_info().get_state();
        assert_eq!(user.user_id.as_deref(), Some("user-1"));
        assert_eq!(user.traits["plan"], "pro");

        client.reset(false).await;
        let user = client.user_info().get_state();
        assert_eq!(user.user_id, None);
        assert!(user.traits.is_empty());
        assert_eq!(user.anonymous_id, anonymous_id);

        client.reset(true).await;
        assert_ne!(client.user_info().get_state().anonymous_id, anonymous_id);
    }

    #[tokio::test]
    async fn bridge_actions_reach_client_stores() {
        let client = Client::new(ClientConfig::new("key"));
        let registry = BridgeRegistry::new();
        client.register_bridge(&registry);

        registry
            .on_store_action(ADD_CONTEXT_ACTION, json!({ "device": { "model": "Pixel" } }))
            .await;
        registry
            .on_store_action(ADD_CONTEXT_ACTION, json!({ "device": { "id": "d-1" } }))
            .await;
        registry
            .on_store_action(
                SET_FILTERS_ACTION,
                json!({ "Braze": { "matchers": [{ "type": "all" }], "transformers": [[{ "type": "drop" }]] } }),
            )
            .await;
        registry
            .on_store_action(SET_SETTINGS_ACTION, json!("not an object"))
            .await;

        assert_eq!(
            Value::Object(client.context().get_state()),
            json!({ "device": { "model": "Pixel", "id": "d-1" } })
        );
        assert!(client.filters().get_state().contains_key("Braze"));
        assert!(client.settings().get_state().is_empty());
    }
}
