//! Semantic telemetry events.
//!
//! The JSON shape (`camelCase` keys, a `"type"` tag) is what routing rules
//! match against and transform, so [`Event::to_value`] and
//! [`Event::from_value`] are part of the contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::state::UserInfo;

pub type JsonMap = Map<String, Value>;

/// Discriminant of an [`EventKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Track,
    Identify,
    Screen,
    Group,
    Alias,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Identify => "identify",
            Self::Screen => "screen",
            Self::Group => "group",
            Self::Alias => "alias",
        }
    }
}

/// Variant-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventKind {
    Track {
        event: String,
        #[serde(default)]
        properties: JsonMap,
    },
    Identify {
        #[serde(default)]
        traits: JsonMap,
    },
    Screen {
        name: String,
        #[serde(default)]
        properties: JsonMap,
    },
    Group {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(default)]
        traits: JsonMap,
    },
    Alias {
        #[serde(rename = "previousId", default)]
        previous_id: String,
    },
}

/// An event plus its envelope.
///
/// Events are shared along the pipeline by value; a destination that wants
/// to change one works on its own clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub anonymous_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub context: JsonMap,
    #[serde(default)]
    pub integrations: JsonMap,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// A fresh event. Identity fields are left empty for
    /// [`apply_raw_event_data`] to fill in.
    pub fn new(kind: EventKind) -> Self {
        Self {
            message_id: String::new(),
            timestamp: Utc::now(),
            anonymous_id: String::new(),
            user_id: None,
            context: JsonMap::new(),
            integrations: JsonMap::new(),
            kind,
        }
    }

    pub fn track(event: impl Into<String>, properties: JsonMap) -> Self {
        Self::new(EventKind::Track {
            event: event.into(),
            properties,
        })
    }

    pub fn screen(name: impl Into<String>, properties: JsonMap) -> Self {
        Self::new(EventKind::Screen {
            name: name.into(),
            properties,
        })
    }

    pub fn identify(user_id: Option<String>, traits: JsonMap) -> Self {
        let mut event = Self::new(EventKind::Identify { traits });
        event.user_id = user_id;
        event
    }

    pub fn group(group_id: impl Into<String>, traits: JsonMap) -> Self {
        Self::new(EventKind::Group {
            group_id: group_id.into(),
            traits,
        })
    }

    /// Alias the current user to `new_user_id`. `previous_id` is the id being
    /// replaced (prior user id, or anonymous id).
    pub fn alias(new_user_id: impl Into<String>, previous_id: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::Alias {
            previous_id: previous_id.into(),
        });
        event.user_id = Some(new_user_id.into());
        event
    }

    pub fn event_type(&self) -> EventType {
        match self.kind {
            EventKind::Track { .. } => EventType::Track,
            EventKind::Identify { .. } => EventType::Identify,
            EventKind::Screen { .. } => EventType::Screen,
            EventKind::Group { .. } => EventType::Group,
            EventKind::Alias { .. } => EventType::Alias,
        }
    }

    /// Event name of a track, or the screen name of a screen.
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Track { event, .. } => Some(event),
            EventKind::Screen { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn properties(&self) -> Option<&JsonMap> {
        match &self.kind {
            EventKind::Track { properties, .. } | EventKind::Screen { properties, .. } => {
                Some(properties)
            }
            _ => None,
        }
    }

    pub fn traits(&self) -> Option<&JsonMap> {
        match &self.kind {
            EventKind::Identify { traits } | EventKind::Group { traits, .. } => Some(traits),
            _ => None,
        }
    }

    /// `false` when the caller disabled delivery to `key` through
    /// `integrations`.
    pub fn is_integration_enabled(&self, key: &str) -> bool {
        !matches!(self.integrations.get(key), Some(Value::Bool(false)))
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// Stamp the envelope fields the pipeline relies on.
///
/// Only missing fields are filled, so an event re-entering the pipeline
/// (for instance after being buffered) keeps its identity.
pub fn apply_raw_event_data(mut event: Event, user_info: &UserInfo) -> Event {
    if event.message_id.is_empty() {
        event.message_id = Uuid::new_v4().to_string();
    }
    if event.anonymous_id.is_empty() {
        event.anonymous_id = user_info.anonymous_id.clone();
    }
    // Identify and alias carry their own user id.
    if event.user_id.is_none()
        && !matches!(event.event_type(), EventType::Identify | EventType::Alias)
    {
        event.user_id = user_info.user_id.clone();
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        }
    }

    #[test]
    fn serializes_to_flat_tagged_shape() {
        let mut event = Event::track("Order Completed", props(json!({ "total": 12 })));
        event.message_id = "m-1".into();
        event.anonymous_id = "anon".into();

        let value = event.to_value().unwrap();
        assert_eq!(value["type"], "track");
        assert_eq!(value["event"], "Order Completed");
        assert_eq!(value["properties"]["total"], 12);
        assert_eq!(value["messageId"], "m-1");
        assert_eq!(value["anonymousId"], "anon");
        assert!(value.get("userId").is_none());

        assert_eq!(Event::from_value(value).unwrap(), event);
    }

    #[test]
    fn group_and_alias_use_camel_case_fields() {
        let value = Event::group("g-1", JsonMap::new()).to_value().unwrap();
        assert_eq!(value["groupId"], "g-1");

        let value = Event::alias("new", "old").to_value().unwrap();
        assert_eq!(value["type"], "alias");
        assert_eq!(value["previousId"], "old");
        assert_eq!(value["userId"], "new");
    }

    #[test]
    fn raw_data_fills_only_missing_fields() {
        let user = UserInfo {
            anonymous_id: "anon-1".into(),
            user_id: Some("user-1".into()),
            traits: JsonMap::new(),
        };

        let stamped = apply_raw_event_data(Event::track("Tapped", JsonMap::new()), &user);
        assert!(!stamped.message_id.is_empty());
        assert_eq!(stamped.anonymous_id, "anon-1");
        assert_eq!(stamped.user_id.as_deref(), Some("user-1"));

        let again = apply_raw_event_data(stamped.clone(), &UserInfo::default());
        assert_eq!(again, stamped);

        let identify = apply_raw_event_data(Event::identify(None, JsonMap::new()), &user);
        assert_eq!(identify.user_id, None);
    }

    #[test]
    fn integrations_can_disable_a_destination() {
        let mut event = Event::track("Tapped", JsonMap::new());
        assert!(event.is_integration_enabled("Braze"));
        event.integrations.insert("Braze".into(), Value::Bool(false));
        assert!(!event.is_integration_enabled("Braze"));
    }
}
