//! Destination filters: routing rules matched against events and applied per
//! destination.
//!
//! A [`RoutingRule`] pairs each matcher with a chain of transformers. Every
//! matcher is tested against the event as it arrived; each one that fires
//! runs its chain over a single working copy of the event. A chain that
//! turns the copy into anything other than an object drops the event.
//!
//! ```text
//! event ──► matcher[0]? ──► chain[0] ──┐
//!       ──► matcher[1]? ──► chain[1] ──┼──► working copy ──► Some(event) | None
//!       ──► ...                        ┘
//! ```

mod fql;
mod plugin;
mod transform;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::warn;

use crate::event::Event;

pub use plugin::{DestinationFiltersPlugin, WORKSPACE_FILTER_KEY};

/// Decides whether a rule's transformers apply to an event.
///
/// `{"type": "all"}` matches every event. `{"type": "fql", "ir": "..."}`
/// evaluates a JSON-encoded expression; see [`Matcher::matches`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ir: String,
}

impl Matcher {
    pub fn all() -> Self {
        Self {
            kind: "all".into(),
            ir: String::new(),
        }
    }

    pub fn fql(ir: impl Into<String>) -> Self {
        Self {
            kind: "fql".into(),
            ir: ir.into(),
        }
    }

    /// Unknown matcher types and malformed expressions never match.
    pub fn matches(&self, event: &Value) -> bool {
        match self.kind.as_str() {
            "all" => true,
            "fql" => match serde_json::from_str::<Value>(&self.ir) {
                Ok(ir) => fql::evaluate(&ir, event),
                Err(err) => {
                    warn!(error = %err, "unparseable filter expression");
                    false
                }
            },
            _ => false,
        }
    }
}

/// One step of a transformer chain. `config` carries the operation's
/// arguments (`drop`, `allow`, `sample`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformer {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TransformerConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Object path (`""` for the event root) to the fields removed from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop: Option<BTreeMap<String, Vec<String>>>,
    /// Object path to the only fields kept in it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<SampleConfig>,
}

/// Keep roughly `percent` (0.0 to 1.0) of events, chosen by hashing the
/// value at `path` so the same event always gets the same verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    pub percent: f64,
    #[serde(default = "SampleConfig::default_path")]
    pub path: String,
}

impl SampleConfig {
    fn default_path() -> String {
        "messageId".into()
    }
}

impl Transformer {
    pub fn drop() -> Self {
        Self {
            kind: "drop".into(),
            config: None,
        }
    }

    pub fn drop_properties(path: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            kind: "drop_properties".into(),
            config: Some(TransformerConfig {
                drop: Some(field_map(path, fields)),
                ..Default::default()
            }),
        }
    }

    pub fn allow_properties(path: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            kind: "allow_properties".into(),
            config: Some(TransformerConfig {
                allow: Some(field_map(path, fields)),
                ..Default::default()
            }),
        }
    }

    pub fn sample(percent: f64) -> Self {
        Self {
            kind: "sample".into(),
            config: Some(TransformerConfig {
                sample: Some(SampleConfig {
                    percent,
                    path: SampleConfig::default_path(),
                }),
                ..Default::default()
            }),
        }
    }
}

fn field_map(path: impl Into<String>, fields: &[&str]) -> BTreeMap<String, Vec<String>> {
    let fields = fields.iter().map(|field| field.to_string()).collect();
    std::iter::once((path.into(), fields)).collect()
}

pub type TransformerChain = SmallVec<[Transformer; 2]>;

/// Matchers paired index by index with transformer chains.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(default)]
    pub transformers: Vec<TransformerChain>,
}

impl RoutingRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, matcher: Matcher, chain: impl IntoIterator<Item = Transformer>) -> Self {
        self.matchers.push(matcher);
        self.transformers.push(chain.into_iter().collect());
        self
    }
}

/// Run `rule` over `event`.
///
/// Returns the event untouched when no matcher fires, the transformed copy
/// when at least one does, and `None` when a transformer dropped it.
pub fn apply_rule(rule: &RoutingRule, event: Event) -> Option<Event> {
    if rule.matchers.is_empty() {
        return Some(event);
    }

    let original = match event.to_value() {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "event could not be encoded for filtering");
            return Some(event);
        }
    };

    let mut working: Option<Value> = None;
    for (index, matcher) in rule.matchers.iter().enumerate() {
        if !matcher.matches(&original) {
            continue;
        }

        let copy = working.take().unwrap_or_else(|| original.clone());
        let chain = rule.transformers.get(index).map_or(&[][..], |chain| &chain[..]);
        working = Some(transform::apply_chain(chain, copy)?);
    }

    match working {
        None => Some(event),
        Some(mut transformed) => {
            restore_envelope(&original, &mut transformed);
            decode_filtered(event, transformed)
        }
    }
}

/// Envelope keys a rule may strip without the event losing its identity.
const ENVELOPE_KEYS: [&str; 8] = [
    "type",
    "messageId",
    "timestamp",
    "anonymousId",
    "event",
    "name",
    "groupId",
    "previousId",
];

/// Put back envelope keys the transformers removed. Payload fields
/// (properties, traits, context) stay as the rule left them.
fn restore_envelope(original: &Value, transformed: &mut Value) {
    let (Value::Object(original), Value::Object(transformed)) = (original, transformed) else {
        return;
    };
    for key in ENVELOPE_KEYS {
        if transformed.contains_key(key) {
            continue;
        }
        if let Some(value) = original.get(key) {
            transformed.insert(key.to_string(), value.clone());
        }
    }
}

fn decode_filtered(event: Event, transformed: Value) -> Option<Event> {
    match Event::from_value(transformed) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(
                message_id = %event.message_id,
                error = %err,
                "filtered event is no longer a valid event, dropping it"
            );
            None
        }
    }
}
