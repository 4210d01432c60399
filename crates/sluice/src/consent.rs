//! Consent gating.
//!
//! A [`CategoryConsentProvider`] answers "which consent categories are
//! granted right now" and pushes aggregate changes. [`ConsentPlugin`] stamps
//! that answer on every event except the preference event itself, and
//! installs a [`ConsentFilterPlugin`] into each destination, which drops
//! events unless every category the destination is tagged with is granted.
//! The preference event therefore runs through the pipeline but never
//! reaches a vendor.
//!
//! ```text
//! ConsentManager ──changes──► ManagedConsentProvider ──► on change: track "Segment Consent Preference"
//!        ▲                             │
//!        └── initial fetch ────────────┘ get_consent_status()
//!                                      ▼
//! event ──► ConsentPlugin (stamps context.consent) ──► destination ──► ConsentFilterPlugin
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::{Client, WeakClient};
use crate::error::SluiceError;
use crate::event::{Event, JsonMap};
use crate::plugin::{ClientSlot, Plugin, PluginType, UpdateType};
use crate::state::Settings;
use crate::store::Store;
use crate::sync::{read, write};

/// Event tracked whenever the aggregate consent changes.
pub const CONSENT_PREFERENCE_EVENT: &str = "Segment Consent Preference";

/// Category id to granted.
pub type ConsentState = BTreeMap<String, bool>;

/// Status a consent management SDK reports for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentStatus {
    Granted,
    Denied,
    Unknown,
}

impl ConsentStatus {
    pub fn is_granted(self) -> bool {
        self == ConsentStatus::Granted
    }
}

pub type CategoryListener = Arc<dyn Fn(&str, ConsentStatus) + Send + Sync>;

pub type ConsentCallback = Arc<dyn Fn(&ConsentState) + Send + Sync>;

/// Boundary to a third-party consent management SDK.
#[async_trait]
pub trait ConsentManager: Send + Sync + 'static {
    async fn get_consent_status_for_category(&self, category: &str) -> Result<ConsentStatus>;

    fn set_broadcast_allowed_values(&self, categories: &[String]);

    fn listen_for_consent_changes(&self, category: &str, listener: CategoryListener);

    fn stop_listening_for_consent_changes(&self);
}

/// Aggregated consent for a fixed set of categories.
#[async_trait]
pub trait CategoryConsentProvider: Send + Sync + 'static {
    fn set_applicable_categories(&self, categories: &[String]);

    /// Latest known status of every applicable category. Failures are the
    /// caller's to handle; nothing is assumed granted.
    async fn get_consent_status(&self) -> Result<ConsentState>;

    /// Replace the callback run on every actual change of the aggregate.
    fn on_consent_change(&self, callback: ConsentCallback);

    fn shutdown(&self) {}
}

type InitialFetch = Shared<BoxFuture<'static, Result<ConsentState, String>>>;

#[derive(Default)]
struct Aggregate {
    initial: Option<InitialFetch>,
    latest: Option<ConsentState>,
}

/// [`CategoryConsentProvider`] over a [`ConsentManager`].
///
/// The initial per-category statuses are fetched once; pushed changes are
/// overlaid on them. Changes are applied one at a time by a worker task, and
/// the change callback only runs when the aggregate actually differs from
/// what was last reported.
pub struct ManagedConsentProvider<M> {
    manager: Arc<M>,
    aggregate: Arc<RwLock<Aggregate>>,
    callback: Arc<RwLock<Option<ConsentCallback>>>,
}

impl<M: ConsentManager> ManagedConsentProvider<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self {
            manager,
            aggregate: Arc::default(),
            callback: Arc::default(),
        }
    }
}

async fn fetch_initial<M: ConsentManager>(
    manager: Arc<M>,
    categories: Vec<String>,
) -> Result<ConsentState, String> {
    let lookups = categories.iter().map(|category| {
        let manager = Arc::clone(&manager);
        async move {
            let status = manager.get_consent_status_for_category(category).await?;
            Ok::<_, anyhow::Error>((category.clone(), status.is_granted()))
        }
    });

    join_all(lookups)
        .await
        .into_iter()
        .collect::<Result<ConsentState>>()
        .map_err(|err| format!("{err:#}"))
}

async fn apply_changes(
    initial: InitialFetch,
    aggregate: Arc<RwLock<Aggregate>>,
    callback: Arc<RwLock<Option<ConsentCallback>>>,
    mut changes: mpsc::UnboundedReceiver<(String, bool)>,
) {
    let base = match initial.await {
        Ok(statuses) => statuses,
        Err(err) => {
            warn!(error = %err, "initial consent fetch failed, tracking changes only");
            ConsentState::new()
        }
    };
    let mut last_seen = base.clone();

    while let Some((category, granted)) = changes.recv().await {
        let latest = {
            let mut aggregate = write(&aggregate);
            let mut latest = base.clone();
            if let Some(previous) = &aggregate.latest {
                latest.extend(previous.iter().map(|(k, v)| (k.clone(), *v)));
            }
            latest.insert(category, granted);
            aggregate.latest = Some(latest.clone());
            latest
        };

        if latest == last_seen {
            debug!("consent change left the aggregate unchanged");
            continue;
        }
        last_seen = latest.clone();

        let notify = read(&callback).clone();
        if let Some(notify) = notify {
            notify(&latest);
        }
    }
}

#[async_trait]
impl<M: ConsentManager> CategoryConsentProvider for ManagedConsentProvider<M> {
    /// Must be called from within a tokio runtime.
    fn set_applicable_categories(&self, categories: &[String]) {
        let initial: InitialFetch =
            fetch_initial(Arc::clone(&self.manager), categories.to_vec())
                .boxed()
                .shared();
        tokio::spawn(initial.clone());

        let (changes, pending) = mpsc::unbounded_channel();
        {
            let mut aggregate = write(&self.aggregate);
            aggregate.initial = Some(initial.clone());
            aggregate.latest = None;
        }
        tokio::spawn(apply_changes(
            initial,
            Arc::clone(&self.aggregate),
            Arc::clone(&self.callback),
            pending,
        ));

        self.manager.stop_listening_for_consent_changes();
        self.manager.set_broadcast_allowed_values(categories);
        for category in categories {
            let changes = changes.clone();
            let owned = category.clone();
            self.manager.listen_for_consent_changes(
                category,
                Arc::new(move |_: &str, status: ConsentStatus| {
                    let _ = changes.send((owned.clone(), status.is_granted()));
                }),
            );
        }
    }

    async fn get_consent_status(&self) -> Result<ConsentState> {
        let initial = {
            let aggregate = read(&self.aggregate);
            if let Some(latest) = &aggregate.latest {
                return Ok(latest.clone());
            }
            aggregate.initial.clone()
        };

        match initial {
            Some(initial) => initial.await.map_err(|err| anyhow!(err)),
            None => Err(anyhow!("no applicable consent categories set")),
        }
    }

    fn on_consent_change(&self, callback: ConsentCallback) {
        *write(&self.callback) = Some(callback);
    }

    fn shutdown(&self) {
        self.manager.stop_listening_for_consent_changes();
    }
}

/// Reads `<key>.consentSettings.categories` from integration settings.
fn destination_categories(settings: &Settings, key: &str) -> Vec<String> {
    settings
        .get(key)
        .and_then(|destination| destination.pointer("/consentSettings/categories"))
        .and_then(Value::as_array)
        .map(|categories| {
            categories
                .iter()
                .filter_map(|category| category.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Stamps consent on events and gates every destination on it.
pub struct ConsentPlugin {
    provider: Arc<dyn CategoryConsentProvider>,
    categories: Vec<String>,
    client: ClientSlot,
}

impl ConsentPlugin {
    pub fn new(provider: Arc<dyn CategoryConsentProvider>, categories: Vec<String>) -> Self {
        Self {
            provider,
            categories,
            client: ClientSlot::new(),
        }
    }
}

fn track_preferences(client: WeakClient, preferences: &ConsentState) {
    let Some(client) = client.upgrade() else {
        return;
    };
    let properties = match json!({ "consent": { "categoryPreferences": preferences } }) {
        Value::Object(properties) => properties,
        _ => JsonMap::new(),
    };
    tokio::spawn(async move {
        client.track(CONSENT_PREFERENCE_EVENT, properties).await;
    });
}

#[async_trait]
impl Plugin for ConsentPlugin {
    fn plugin_type(&self) -> PluginType {
        PluginType::Before
    }

    fn name(&self) -> &str {
        "Consent"
    }

    fn configure(&self, client: &Client) {
        self.client.set(client);

        let settings: Store<Settings> = client.settings().clone();
        client.on_plugin_loaded(move |plugin| {
            if let Some(destination) = plugin.as_destination() {
                let categories = destination_categories(&settings.get_state(), destination.key());
                destination.add(Arc::new(ConsentFilterPlugin::new(destination.key(), categories)));
            }
        });

        self.provider.set_applicable_categories(&self.categories);

        let weak = client.downgrade();
        self.provider
            .on_consent_change(Arc::new(move |preferences: &ConsentState| {
                track_preferences(weak.clone(), preferences);
            }));
    }

    async fn execute(&self, mut event: Event) -> Result<Option<Event>> {
        // Preference changes are for the pipeline only; unstamped, every
        // consent-gated destination blocks them.
        if event.name() == Some(CONSENT_PREFERENCE_EVENT) {
            return Ok(Some(event));
        }

        match self.provider.get_consent_status().await {
            Ok(preferences) => {
                event.context.insert(
                    "consent".into(),
                    json!({ "categoryPreferences": preferences }),
                );
            }
            Err(err) => {
                // Unstamped events are not granted anything downstream.
                warn!(error = %err, "consent status unavailable, event left unstamped");
                if let Some(client) = self.client.get() {
                    client.report_internal_error(SluiceError::Consent(format!("{err:#}")), false);
                }
            }
        }
        Ok(Some(event))
    }

    fn shutdown(&self) {
        self.provider.shutdown();
    }
}

/// Drops events for one destination unless every category it is tagged with
/// is granted in `context.consent.categoryPreferences`. A destination with no
/// categories, or an event with no preferences, is blocked.
#[derive(Debug)]
pub struct ConsentFilterPlugin {
    key: String,
    categories: RwLock<Vec<String>>,
}

impl ConsentFilterPlugin {
    pub fn new(key: impl Into<String>, categories: Vec<String>) -> Self {
        Self {
            key: key.into(),
            categories: RwLock::new(categories),
        }
    }

    pub fn categories(&self) -> Vec<String> {
        read(&self.categories).clone()
    }

    fn allows(&self, event: &Event) -> bool {
        let Some(preferences) = event
            .context
            .get("consent")
            .and_then(|consent| consent.get("categoryPreferences"))
            .and_then(Value::as_object)
        else {
            return false;
        };

        let categories = read(&self.categories);
        !categories.is_empty()
            && categories
                .iter()
                .all(|category| preferences.get(category) == Some(&Value::Bool(true)))
    }
}

#[async_trait]
impl Plugin for ConsentFilterPlugin {
    fn plugin_type(&self) -> PluginType {
        PluginType::Before
    }

    fn name(&self) -> &str {
        "ConsentFilter"
    }

    fn update(&self, settings: &Settings, _update_type: UpdateType) {
        *write(&self.categories) = destination_categories(settings, &self.key);
    }

    async fn execute(&self, event: Event) -> Result<Option<Event>> {
        if self.allows(&event) {
            Ok(Some(event))
        } else {
            debug!(destination = %self.key, "event blocked by consent");
            Ok(None)
        }
    }
}
