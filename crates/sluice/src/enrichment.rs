//! Built-in `before` plugins every client installs on init.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::client::Client;
use crate::event::{Event, EventKind};
use crate::plugin::{ClientSlot, Plugin, PluginType};
use crate::state::UserInfo;
use crate::store::Action;

/// Records identify and alias calls in the user info store and stamps every
/// event with the current user.
#[derive(Debug, Default)]
pub struct InjectUserInfo {
    client: ClientSlot,
}

impl InjectUserInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for InjectUserInfo {
    fn plugin_type(&self) -> PluginType {
        PluginType::Before
    }

    fn name(&self) -> &str {
        "InjectUserInfo"
    }

    fn configure(&self, client: &Client) {
        self.client.set(client);
    }

    async fn execute(&self, mut event: Event) -> Result<Option<Event>> {
        let Some(client) = self.client.get() else {
            return Ok(Some(event));
        };

        // Identify and alias write to the store first, without a fence, so a
        // later event's fenced read already sees the new user.
        match &mut event.kind {
            EventKind::Identify { traits } => {
                let user_id = event.user_id.clone();
                let new_traits = traits.clone();
                let user = client
                    .user_info()
                    .dispatch(Action::map(move |mut state: UserInfo| {
                        if user_id.is_some() {
                            state.user_id = user_id;
                        }
                        state.traits.extend(new_traits);
                        state
                    }))
                    .await;

                let mut merged = user.traits;
                merged.extend(std::mem::take(traits));
                *traits = merged;
                event.anonymous_id = user.anonymous_id;
                event.user_id = event.user_id.or(user.user_id);
            }
            EventKind::Alias { previous_id } => {
                let new_user_id = event.user_id.clone();
                let (prior, prior_rx) = oneshot::channel();
                let user = client
                    .user_info()
                    .dispatch(Action::map(move |mut state: UserInfo| {
                        let _ = prior.send(
                            state
                                .user_id
                                .clone()
                                .unwrap_or_else(|| state.anonymous_id.clone()),
                        );
                        state.user_id = new_user_id;
                        state
                    }))
                    .await;

                if let Ok(prior) = prior_rx.await {
                    *previous_id = prior;
                }
                event.anonymous_id = user.anonymous_id;
            }
            _ => {
                let user = client.user_info().get_state_safe().await;
                event.anonymous_id = user.anonymous_id;
                event.user_id = user.user_id;
            }
        }

        Ok(Some(event))
    }
}

/// Merges the context store into every event's context. Stored values win.
#[derive(Debug, Default)]
pub struct InjectContext {
    client: ClientSlot,
}

impl InjectContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for InjectContext {
    fn plugin_type(&self) -> PluginType {
        PluginType::Before
    }

    fn name(&self) -> &str {
        "InjectContext"
    }

    fn configure(&self, client: &Client) {
        self.client.set(client);
    }

    async fn execute(&self, mut event: Event) -> Result<Option<Event>> {
        if let Some(client) = self.client.get() {
            let context = client.context().get_state_safe().await;
            event.context.extend(context);
        }
        Ok(Some(event))
    }
}
