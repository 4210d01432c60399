//! Session tracking for destinations that group events into sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::event::Event;
use crate::plugin::{Plugin, PluginType, UpdateType};
use crate::state::Settings;
use crate::sync::lock;

/// Idle time after which the next event starts a new session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
struct Session {
    id: Option<i64>,
    last_event: Option<Instant>,
}

impl Session {
    /// New id: the current time in milliseconds, kept strictly increasing.
    fn start(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let id = match self.id {
            Some(previous) => now.max(previous + 1),
            None => now,
        };
        self.id = Some(id);
        id
    }
}

/// Stamps `integrations[key].session_id` on every event once settings for
/// `key` exist.
pub struct SessionPlugin {
    key: String,
    timeout: Duration,
    active: AtomicBool,
    session: Mutex<Session>,
}

impl SessionPlugin {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            timeout: DEFAULT_SESSION_TIMEOUT,
            active: AtomicBool::new(false),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session_id(&self) -> Option<i64> {
        lock(&self.session).id
    }

    /// Current session id, starting a new session when none exists or the
    /// previous event is older than the timeout. The check and the start
    /// happen under one lock.
    fn touch(&self) -> i64 {
        let now = Instant::now();
        let mut session = lock(&self.session);

        let expired = session
            .last_event
            .map_or(true, |last| now.duration_since(last) > self.timeout);
        let id = match session.id {
            Some(id) if !expired => id,
            _ => {
                let id = session.start();
                debug!(key = %self.key, session_id = id, "session started");
                id
            }
        };
        session.last_event = Some(now);
        id
    }
}

#[async_trait]
impl Plugin for SessionPlugin {
    fn plugin_type(&self) -> PluginType {
        PluginType::Enrichment
    }

    fn name(&self) -> &str {
        "Session"
    }

    fn update(&self, settings: &Settings, _update_type: UpdateType) {
        self.active
            .store(settings.contains_key(&self.key), Ordering::SeqCst);
    }

    async fn execute(&self, mut event: Event) -> Result<Option<Event>> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(Some(event));
        }

        let session_id = self.touch();
        match event.integrations.get_mut(&self.key) {
            Some(Value::Object(options)) => {
                options.insert("session_id".into(), json!(session_id));
            }
            _ => {
                event
                    .integrations
                    .insert(self.key.clone(), json!({ "session_id": session_id }));
            }
        }
        Ok(Some(event))
    }

    fn reset(&self) {
        let mut session = lock(&self.session);
        session.start();
        session.last_event = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::JsonMap;
    use std::sync::Arc;

    fn active(key: &str) -> SessionPlugin {
        let plugin = SessionPlugin::new(key);
        let mut settings = Settings::new();
        settings.insert(key.into(), json!({}));
        plugin.update(&settings, UpdateType::Initial);
        plugin
    }

    async fn session_of(plugin: &SessionPlugin) -> i64 {
        let event = plugin
            .execute(Event::track("Tapped", JsonMap::new()))
            .await
            .unwrap()
            .unwrap();
        event.integrations["Amplitude"]["session_id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn inactive_without_settings() {
        let plugin = SessionPlugin::new("Amplitude");
        let event = plugin
            .execute(Event::track("Tapped", JsonMap::new()))
            .await
            .unwrap()
            .unwrap();
        assert!(event.integrations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_session_only_after_timeout() {
        let plugin = active("Amplitude").with_timeout(Duration::from_secs(60));

        let first = session_of(&plugin).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(session_of(&plugin).await, first);

        tokio::time::advance(Duration::from_secs(61)).await;
        let second = session_of(&plugin).await;
        assert!(second > first);
    }

    #[tokio::test]
    async fn reset_starts_a_new_session() {
        let plugin = active("Amplitude");
        let first = session_of(&plugin).await;
        plugin.reset();
        assert!(session_of(&plugin).await > first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_events_share_one_session() {
        let plugin = Arc::new(active("Amplitude"));
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let plugin = Arc::clone(&plugin);
                tokio::spawn(async move { session_of(&plugin).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }
}
