//! Staged plugin pipeline.
//!
//! ```text
//! event ──► before* ──► enrichment* ──┬──► destination A (own copy) ──┐
//!                                     ├──► destination B (own copy) ──┼──► after*
//!                                     └──► ...                        ┘
//! ```
//!
//! `before` and `enrichment` plugins run one after another in the order they
//! were added, each seeing the previous plugin's output. Destinations run
//! concurrently on their own copies; a failing destination never affects the
//! others. `after` plugins see the event that was handed to destinations.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use futures::FutureExt;
use tracing::warn;

use crate::error::SluiceError;
use crate::event::Event;
use crate::plugin::{plugin_addr, Plugin, PluginType};
use crate::sync::{read, write};

/// Receives failures the pipeline swallowed.
pub type ErrorReporter<'a> = dyn Fn(SluiceError) + Send + Sync + 'a;

/// Plugins bucketed by [`PluginType`].
#[derive(Default)]
pub struct Timeline {
    buckets: RwLock<[Vec<Arc<dyn Plugin>>; 5]>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        let index = plugin.plugin_type().index();
        write(&self.buckets)[index].push(plugin);
    }

    /// Remove this exact plugin instance. Returns whether it was present.
    pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
        let addr = plugin_addr(plugin);
        let mut buckets = write(&self.buckets);
        let bucket = &mut buckets[plugin.plugin_type().index()];
        let before = bucket.len();
        bucket.retain(|candidate| plugin_addr(candidate) != addr);
        bucket.len() != before
    }

    /// Plugins of one type, or all of them in stage order.
    pub fn plugins(&self, plugin_type: Option<PluginType>) -> Vec<Arc<dyn Plugin>> {
        let buckets = read(&self.buckets);
        match plugin_type {
            Some(plugin_type) => buckets[plugin_type.index()].clone(),
            None => PluginType::ALL
                .iter()
                .flat_map(|plugin_type| buckets[plugin_type.index()].iter().cloned())
                .collect(),
        }
    }

    /// Call `f` on every plugin, in stage order.
    pub fn apply(&self, mut f: impl FnMut(&Arc<dyn Plugin>)) {
        for plugin in self.plugins(None) {
            f(&plugin);
        }
    }

    /// Run `event` through the whole pipeline. Returns the event as the
    /// `after` stage saw it, or `None` if a `before`/`enrichment` plugin
    /// dropped it.
    pub async fn process(&self, event: Event, report: &ErrorReporter<'_>) -> Option<Event> {
        let event = self.apply_stage(PluginType::Before, event, report).await?;
        let event = self.apply_stage(PluginType::Enrichment, event, report).await?;
        self.fan_out(&event, report).await;
        self.apply_stage(PluginType::After, event.clone(), report).await;
        Some(event)
    }

    /// Run the plugins of one sequential stage. Destinations are handled by
    /// [`process`](Self::process) and are skipped here.
    pub async fn apply_stage(
        &self,
        stage: PluginType,
        event: Event,
        report: &ErrorReporter<'_>,
    ) -> Option<Event> {
        let plugins = self.plugins(Some(stage));
        let mut current = event;
        for plugin in plugins {
            let output = run_plugin(&plugin, current.clone(), report).await;
            match stage {
                // Side effects only.
                PluginType::After => {}
                _ => current = output?,
            }
        }
        Some(current)
    }

    async fn fan_out(&self, event: &Event, report: &ErrorReporter<'_>) {
        let destinations = self.plugins(Some(PluginType::Destination));
        let deliveries = destinations.iter().map(|plugin| {
            let copy = event.clone();
            async move {
                let key = match plugin.as_destination() {
                    Some(destination) => destination.key().to_string(),
                    None => plugin.name().to_string(),
                };
                match AssertUnwindSafe(plugin.execute(copy)).catch_unwind().await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        warn!(destination = %key, error = %err, "destination failed to execute");
                        report(SluiceError::destination(key, err));
                    }
                    Err(_) => {
                        warn!(destination = %key, "destination panicked");
                        report(SluiceError::destination(key, anyhow::anyhow!("destination panicked")));
                    }
                }
            }
        });
        join_all(deliveries).await;
    }
}

/// Execute one plugin. On error or panic the input event carries on.
async fn run_plugin(
    plugin: &Arc<dyn Plugin>,
    event: Event,
    report: &ErrorReporter<'_>,
) -> Option<Event> {
    let fallback = event.clone();
    match AssertUnwindSafe(plugin.execute(event)).catch_unwind().await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!(plugin = %plugin.name(), error = %err, "plugin failed to execute");
            report(SluiceError::plugin(plugin.name(), err));
            Some(fallback)
        }
        Err(_) => {
            warn!(plugin = %plugin.name(), "plugin panicked");
            report(SluiceError::plugin(plugin.name(), anyhow::anyhow!("plugin panicked")));
            Some(fallback)
        }
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets = read(&self.buckets);
        let mut debug = f.debug_struct("Timeline");
        for plugin_type in PluginType::ALL {
            let names: Vec<&str> = buckets[plugin_type.index()]
                .iter()
                .map(|plugin| plugin.name())
                .collect();
            debug.field(&format!("{plugin_type:?}").to_lowercase(), &names);
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::JsonMap;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    struct Tagger {
        stage: PluginType,
        tag: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Tagger {
        fn plugin_type(&self) -> PluginType {
            self.stage
        }

        fn name(&self) -> &str {
            self.tag
        }

        async fn execute(&self, mut event: Event) -> Result<Option<Event>> {
            self.seen.lock().unwrap().push(self.tag.to_string());
            event.context.insert(self.tag.into(), Value::Bool(true));
            Ok(Some(event))
        }
    }

    struct Failing(PluginType);

    #[async_trait]
    impl Plugin for Failing {
        fn plugin_type(&self) -> PluginType {
            self.0
        }

        async fn execute(&self, mut event: Event) -> Result<Option<Event>> {
            event.context.insert("corrupted".into(), Value::Bool(true));
            anyhow::bail!("cannot enrich")
        }
    }

    struct Dropper;

    #[async_trait]
    impl Plugin for Dropper {
        fn plugin_type(&self) -> PluginType {
            PluginType::Before
        }

        async fn execute(&self, _event: Event) -> Result<Option<Event>> {
            Ok(None)
        }
    }

    fn tagger(stage: PluginType, tag: &'static str, seen: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Plugin> {
        Arc::new(Tagger {
            stage,
            tag,
            seen: Arc::clone(seen),
        })
    }

    fn no_report() -> impl Fn(SluiceError) + Send + Sync {
        |_| {}
    }

    #[tokio::test]
    async fn stages_run_in_order_regardless_of_insertion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let timeline = Timeline::new();
        timeline.add(tagger(PluginType::After, "after", &seen));
        timeline.add(tagger(PluginType::Enrichment, "enrich", &seen));
        timeline.add(tagger(PluginType::Before, "before-1", &seen));
        timeline.add(tagger(PluginType::Before, "before-2", &seen));
        timeline.add(tagger(PluginType::Utility, "utility", &seen));

        let out = timeline
            .process(Event::track("Tapped", JsonMap::new()), &no_report())
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["before-1", "before-2", "enrich", "after"]);
        // After plugins only observe.
        assert!(out.context.contains_key("enrich"));
        assert!(!out.context.contains_key("after"));
    }

    #[tokio::test]
    async fn dropped_event_skips_later_stages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let timeline = Timeline::new();
        timeline.add(Arc::new(Dropper));
        timeline.add(tagger(PluginType::Enrichment, "enrich", &seen));
        timeline.add(tagger(PluginType::After, "after", &seen));

        let out = timeline
            .process(Event::track("Tapped", JsonMap::new()), &no_report())
            .await;

        assert!(out.is_none());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_plugin_is_reported_and_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        // The reporter borrows a local instead of owning a shared handle.
        let reported = Mutex::new(Vec::new());
        let report = |err: SluiceError| reported.lock().unwrap().push(err.kind());

        let timeline = Timeline::new();
        timeline.add(Arc::new(Failing(PluginType::Before)));
        timeline.add(tagger(PluginType::Enrichment, "enrich", &seen));

        let out = timeline
            .process(Event::track("Tapped", JsonMap::new()), &report)
            .await
            .unwrap();

        assert!(!out.context.contains_key("corrupted"));
        assert!(out.context.contains_key("enrich"));
        assert_eq!(*reported.lock().unwrap(), vec![crate::ErrorKind::PluginError]);
    }

    #[tokio::test]
    async fn remove_matches_the_instance() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let timeline = Timeline::new();
        let first = tagger(PluginType::Before, "same", &seen);
        let second = tagger(PluginType::Before, "same", &seen);
        timeline.add(Arc::clone(&first));
        timeline.add(Arc::clone(&second));

        assert!(timeline.remove(&first));
        assert!(!timeline.remove(&first));

        let remaining = timeline.plugins(Some(PluginType::Before));
        assert_eq!(remaining.len(), 1);
        assert_eq!(plugin_addr(&remaining[0]), plugin_addr(&second));
    }

    #[test]
    fn listing_follows_stage_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let timeline = Timeline::new();
        timeline.add(tagger(PluginType::After, "a", &seen));
        timeline.add(tagger(PluginType::Utility, "u", &seen));
        timeline.add(tagger(PluginType::Enrichment, "e", &seen));
        timeline.add(tagger(PluginType::Before, "b", &seen));

        let names: Vec<String> = timeline
            .plugins(None)
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect();
        assert_eq!(names, vec!["b", "e", "u", "a"]);
    }
}
