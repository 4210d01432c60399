//! Routes externally originated actions into stores.
//!
//! A native host emits `(key, payload)` pairs. Each key maps to an ordered
//! list of `(store, action creator)` registrations; an incoming action is
//! dispatched to every registrant in registration order, one after another.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::store::{Action, State, Store};

/// Builds a store action from an external payload.
pub type ActionCreator<T> = Arc<dyn Fn(Value) -> Action<T> + Send + Sync>;

/// A store together with the external action keys it answers to.
pub struct BridgeStore<T: State> {
    store: Store<T>,
    actions: Vec<(String, ActionCreator<T>)>,
}

impl<T: State> BridgeStore<T> {
    pub fn new(store: Store<T>) -> Self {
        Self {
            store,
            actions: Vec::new(),
        }
    }

    pub fn action(
        mut self,
        key: impl Into<String>,
        creator: impl Fn(Value) -> Action<T> + Send + Sync + 'static,
    ) -> Self {
        self.actions.push((key.into(), Arc::new(creator)));
        self
    }
}

trait StoreAction: Send + Sync {
    fn dispatch(&self, payload: Value) -> BoxFuture<'static, ()>;
}

struct BoundAction<T: State> {
    store: Store<T>,
    creator: ActionCreator<T>,
}

impl<T: State> StoreAction for BoundAction<T> {
    fn dispatch(&self, payload: Value) -> BoxFuture<'static, ()> {
        let dispatched = self.store.dispatch((self.creator)(payload));
        async move {
            dispatched.await;
        }
        .boxed()
    }
}

/// Table of external action keys. Construct one at startup and share it by
/// reference with whatever registers or forwards actions.
#[derive(Default)]
pub struct BridgeRegistry {
    actions: DashMap<String, Vec<Arc<dyn StoreAction>>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the store's action creators to their keys.
    pub fn register_store<T: State>(&self, bridge: BridgeStore<T>) {
        let BridgeStore { store, actions } = bridge;
        for (key, creator) in actions {
            let bound: Arc<dyn StoreAction> = Arc::new(BoundAction {
                store: store.clone(),
                creator,
            });
            self.actions.entry(key).or_default().push(bound);
        }
    }

    /// Dispatch `payload` to every registrant of `key`, awaiting each before
    /// moving on to the next. Unknown keys are ignored.
    pub async fn on_store_action(&self, key: &str, payload: Value) {
        // Clone the list so no map guard is held across an await.
        let registrants = match self.actions.get(key) {
            Some(registrants) => registrants.clone(),
            None => {
                debug!(action = %key, "no store registered for bridge action");
                return;
            }
        };

        for registrant in registrants {
            registrant.dispatch(payload.clone()).await;
        }
    }

    pub fn registrant_count(&self, key: &str) -> usize {
        self.actions.get(key).map_or(0, |registrants| registrants.len())
    }
}

impl fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.actions.iter().map(|entry| entry.key().clone()).collect();
        f.debug_struct("BridgeRegistry").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn actions_reach_every_registrant_in_order() {
        let registry = BridgeRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first: Store<Vec<String>> = Store::new(Vec::new());
        let second: Store<Vec<String>> = Store::new(Vec::new());

        for (name, store) in [("first", &first), ("second", &second)] {
            let order = Arc::clone(&order);
            registry.register_store(BridgeStore::new(store.clone()).action(
                "deep-link",
                move |payload| {
                    let order = Arc::clone(&order);
                    Action::future(move |mut urls: Vec<String>| async move {
                        order.lock().unwrap().push(name);
                        urls.push(payload["url"].as_str().unwrap_or_default().to_string());
                        Ok(urls)
                    })
                },
            ));
        }

        registry
            .on_store_action("deep-link", json!({ "url": "app://home" }))
            .await;

        assert_eq!(registry.registrant_count("deep-link"), 2);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(first.get_state(), vec!["app://home".to_string()]);
        assert_eq!(second.get_state(), vec!["app://home".to_string()]);
    }

    #[tokio::test]
    async fn unknown_keys_are_ignored() {
        let registry = BridgeRegistry::new();
        let store: Store<u32> = Store::new(0);
        registry.register_store(
            BridgeStore::new(store.clone()).action("increment", |_| Action::map(|n: u32| n + 1)),
        );

        registry.on_store_action("decrement", json!(null)).await;
        registry.on_store_action("increment", json!(null)).await;

        assert_eq!(store.get_state(), 1);
        assert_eq!(registry.registrant_count("decrement"), 0);
    }
}
