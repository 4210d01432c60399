//! Test doubles for Sluice.
//!
//! - [`RecordingPersistor`] / [`FlakyPersistor`]: persistor backends that
//!   record writes or fail on demand.
//! - [`RecordingDestination`]: a destination adapter that keeps everything
//!   it was handed.
//! - [`RecordingPlugin`]: a plugin at any stage that records what passed.
//! - [`MockConsentManager`]: a consent SDK whose statuses tests can flip.
//! - [`eventually`]: wait for a condition driven by background tasks.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use sluice_core::{
    CategoryListener, ConsentManager, ConsentStatus, Destination, Event, Persistor, Plugin,
    PluginType, Settings, UpdateType,
};

// ---------------------------------------------------------------------------
// Persistors
// ---------------------------------------------------------------------------

/// In-memory persistor that remembers every write.
#[derive(Debug, Default)]
pub struct RecordingPersistor {
    saved: Mutex<HashMap<String, Value>>,
    writes: Mutex<Vec<(String, Value)>>,
}

impl RecordingPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a previous run saved `value` under `key`.
    pub fn with_saved(self, key: impl Into<String>, value: Value) -> Self {
        self.saved.lock().unwrap().insert(key.into(), value);
        self
    }

    pub fn saved(&self, key: &str) -> Option<Value> {
        self.saved.lock().unwrap().get(key).cloned()
    }

    /// Every `set` call, in order.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_for(&self, key: &str) -> Vec<Value> {
        self.writes()
            .into_iter()
            .filter(|(written, _)| written == key)
            .map(|(_, value)| value)
            .collect()
    }
}

#[async_trait]
impl Persistor for RecordingPersistor {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.saved(key))
    }

    async fn set(&self, key: &str, state: Value) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), state.clone()));
        self.saved.lock().unwrap().insert(key.to_string(), state);
        Ok(())
    }
}

/// Persistor whose reads and/or writes fail.
#[derive(Debug, Default)]
pub struct FlakyPersistor {
    fail_reads: bool,
    fail_writes: bool,
    attempts: AtomicUsize,
}

impl FlakyPersistor {
    pub fn failing_reads() -> Self {
        Self {
            fail_reads: true,
            ..Self::default()
        }
    }

    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_reads: true,
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Number of `get` and `set` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Persistor for FlakyPersistor {
    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads {
            bail!("storage unavailable");
        }
        Ok(None)
    }

    async fn set(&self, _key: &str, _state: Value) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            bail!("disk full");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Destinations and plugins
// ---------------------------------------------------------------------------

/// Destination adapter that records delivered events.
#[derive(Debug)]
pub struct RecordingDestination {
    key: String,
    fail_with: Option<String>,
    events: Mutex<Vec<Event>>,
    updates: Mutex<Vec<UpdateType>>,
    flushes: AtomicUsize,
    resets: AtomicUsize,
}

impl RecordingDestination {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fail_with: None,
            events: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    /// Every handler records the event, then fails with `message`.
    pub fn failing(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::new(key)
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Track event names, in delivery order.
    pub fn event_names(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|event| event.name().map(str::to_string))
            .collect()
    }

    pub fn updates(&self) -> Vec<UpdateType> {
        self.updates.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    fn record(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        match &self.fail_with {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Destination for RecordingDestination {
    fn key(&self) -> &str {
        &self.key
    }

    fn update(&self, _settings: &Settings, update_type: UpdateType) {
        self.updates.lock().unwrap().push(update_type);
    }

    async fn track(&self, event: Event) -> Result<()> {
        self.record(event)
    }

    async fn identify(&self, event: Event) -> Result<()> {
        self.record(event)
    }

    async fn screen(&self, event: Event) -> Result<()> {
        self.record(event)
    }

    async fn group(&self, event: Event) -> Result<()> {
        self.record(event)
    }

    async fn alias(&self, event: Event) -> Result<()> {
        self.record(event)
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Plugin that records every event it sees and passes it on.
#[derive(Debug)]
pub struct RecordingPlugin {
    plugin_type: PluginType,
    events: Mutex<Vec<Event>>,
}

impl RecordingPlugin {
    pub fn new(plugin_type: PluginType) -> Self {
        Self {
            plugin_type,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|event| event.name().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    fn name(&self) -> &str {
        "Recording"
    }

    async fn execute(&self, event: Event) -> Result<Option<Event>> {
        self.events.lock().unwrap().push(event.clone());
        Ok(Some(event))
    }
}

// ---------------------------------------------------------------------------
// Consent
// ---------------------------------------------------------------------------

/// Consent SDK double. Statuses start as given; [`push_change`] flips one
/// and notifies the listeners registered for that category.
///
/// [`push_change`]: MockConsentManager::push_change
#[derive(Default)]
pub struct MockConsentManager {
    statuses: Mutex<BTreeMap<String, ConsentStatus>>,
    listeners: Mutex<HashMap<String, Vec<CategoryListener>>>,
    broadcast: Mutex<Vec<String>>,
    stops: AtomicUsize,
    lookups: AtomicUsize,
    fail_lookups: bool,
}

impl MockConsentManager {
    pub fn new(statuses: impl IntoIterator<Item = (&'static str, ConsentStatus)>) -> Self {
        Self {
            statuses: Mutex::new(
                statuses
                    .into_iter()
                    .map(|(category, status)| (category.to_string(), status))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// Every status lookup fails.
    pub fn failing() -> Self {
        Self {
            fail_lookups: true,
            ..Self::default()
        }
    }

    pub fn push_change(&self, category: &str, status: ConsentStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(category.to_string(), status);
        let listeners = self
            .listeners
            .lock()
            .unwrap()
            .get(category)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(category, status);
        }
    }

    pub fn broadcast_allowed_values(&self) -> Vec<String> {
        self.broadcast.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of per-category status lookups.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsentManager for MockConsentManager {
    async fn get_consent_status_for_category(&self, category: &str) -> Result<ConsentStatus> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups {
            bail!("consent SDK not initialized");
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(category)
            .copied()
            .unwrap_or(ConsentStatus::Unknown))
    }

    fn set_broadcast_allowed_values(&self, categories: &[String]) {
        *self.broadcast.lock().unwrap() = categories.to_vec();
    }

    fn listen_for_consent_changes(&self, category: &str, listener: CategoryListener) {
        self.listeners
            .lock()
            .unwrap()
            .entry(category.to_string())
            .or_default()
            .push(listener);
    }

    fn stop_listening_for_consent_changes(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().clear();
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Poll `condition` until it holds, yielding to background tasks between
/// checks. Panics after two seconds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
