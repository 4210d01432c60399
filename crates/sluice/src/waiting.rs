//! A gate that holds events back until something asynchronous is ready.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::client::Client;
use crate::event::Event;
use crate::plugin::{ClientSlot, Plugin, PluginType};
use crate::sync::lock;

#[derive(Debug)]
struct Gate {
    paused: bool,
    buffer: Vec<Event>,
}

/// Buffers every event while paused. [`resume`](WaitingPlugin::resume)
/// sends the buffered events back through the client in arrival order.
///
/// Starts paused.
#[derive(Debug)]
pub struct WaitingPlugin {
    plugin_type: PluginType,
    gate: Mutex<Gate>,
    client: ClientSlot,
}

impl Default for WaitingPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitingPlugin {
    pub fn new() -> Self {
        Self::with_type(PluginType::Before)
    }

    /// Gate at another stage, for instance inside a destination.
    pub fn with_type(plugin_type: PluginType) -> Self {
        Self {
            plugin_type,
            gate: Mutex::new(Gate {
                paused: true,
                buffer: Vec::new(),
            }),
            client: ClientSlot::new(),
        }
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.gate).paused
    }

    pub fn buffered(&self) -> usize {
        lock(&self.gate).buffer.len()
    }

    /// Start buffering again. Events already released are not replayed.
    pub fn pause(&self) {
        lock(&self.gate).paused = true;
    }

    /// Stop buffering and re-process what was held. Calling it while not
    /// paused does nothing.
    pub async fn resume(&self) {
        let held = {
            let mut gate = lock(&self.gate);
            if !gate.paused {
                return;
            }
            gate.paused = false;
            std::mem::take(&mut gate.buffer)
        };

        if held.is_empty() {
            return;
        }
        let Some(client) = self.client.get() else {
            warn!(count = held.len(), "waiting plugin resumed without a client, dropping held events");
            return;
        };

        debug!(count = held.len(), "releasing held events");
        for event in held {
            let message_id = event.message_id.clone();
            if AssertUnwindSafe(client.process(event))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(message_id = %message_id, "held event panicked while re-processing");
            }
        }
    }
}

#[async_trait]
impl Plugin for WaitingPlugin {
    fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    fn name(&self) -> &str {
        "WaitingPlugin"
    }

    fn configure(&self, client: &Client) {
        self.client.set(client);
    }

    async fn execute(&self, event: Event) -> Result<Option<Event>> {
        let mut gate = lock(&self.gate);
        if gate.paused {
            gate.buffer.push(event);
            return Ok(None);
        }
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ClientConfig;
    use crate::error::ErrorKind;
    use crate::event::JsonMap;

    #[derive(Default)]
    struct Seen(Mutex<Vec<String>>);

    #[async_trait]
    impl Plugin for Seen {
        fn plugin_type(&self) -> PluginType {
            PluginType::After
        }

        fn name(&self) -> &str {
            "Seen"
        }

        async fn execute(&self, event: Event) -> Result<Option<Event>> {
            if let Some(name) = event.name() {
                self.0.lock().unwrap().push(name.to_string());
            }
            Ok(Some(event))
        }
    }

    /// Fails on "Bad", panics on "Boom".
    struct Faulty;

    #[async_trait]
    impl Plugin for Faulty {
        fn plugin_type(&self) -> PluginType {
            PluginType::Enrichment
        }

        fn name(&self) -> &str {
            "Faulty"
        }

        async fn execute(&self, event: Event) -> Result<Option<Event>> {
            match event.name() {
                Some("Bad") => anyhow::bail!("cannot enrich"),
                Some("Boom") => panic!("enrichment blew up"),
                _ => Ok(Some(event)),
            }
        }
    }

    async fn gated_client(config: ClientConfig) -> (Client, Arc<WaitingPlugin>, Arc<Seen>) {
        let client = Client::new(config);
        client.init().await.unwrap();
        let waiting = Arc::new(WaitingPlugin::new());
        let seen = Arc::new(Seen::default());
        client.add(waiting.clone());
        client.add(seen.clone());
        (client, waiting, seen)
    }

    #[tokio::test]
    async fn pause_after_resume_buffers_again() {
        let (client, waiting, seen) = gated_client(ClientConfig::new("key")).await;

        client.track("first", JsonMap::new()).await;
        assert_eq!(waiting.buffered(), 1);
        waiting.resume().await;
        assert!(!waiting.is_paused());

        waiting.pause();
        client.track("second", JsonMap::new()).await;
        assert_eq!(waiting.buffered(), 1);
        assert_eq!(*seen.0.lock().unwrap(), vec!["first"]);

        waiting.resume().await;
        client.track("third", JsonMap::new()).await;
        assert_eq!(*seen.0.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(waiting.buffered(), 0);
    }

    #[tokio::test]
    async fn failing_held_event_does_not_stop_the_drain() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let config = ClientConfig::new("key")
            .with_error_handler(move |err| sink.lock().unwrap().push(err.kind()));
        let (client, waiting, seen) = gated_client(config).await;
        client.add(Arc::new(Faulty));

        for name in ["one", "Bad", "two", "Boom", "three"] {
            client.track(name, JsonMap::new()).await;
        }
        assert_eq!(waiting.buffered(), 5);

        waiting.resume().await;

        assert_eq!(*seen.0.lock().unwrap(), vec!["one", "Bad", "two", "Boom", "three"]);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![ErrorKind::PluginError, ErrorKind::PluginError]
        );
    }

    #[tokio::test]
    async fn resume_while_running_is_a_no_op() {
        let (client, waiting, seen) = gated_client(ClientConfig::new("key")).await;
        waiting.resume().await;
        waiting.resume().await;

        client.track("live", JsonMap::new()).await;
        assert_eq!(*seen.0.lock().unwrap(), vec!["live"]);
    }
}
