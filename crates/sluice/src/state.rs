//! State held in the client's stores.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::JsonMap;
use crate::filters::RoutingRule;

/// Per-destination integration settings, keyed by destination key.
pub type Settings = JsonMap;

/// Context merged into every event.
pub type Context = JsonMap;

/// Routing rules keyed by destination key; `""` is the workspace default.
pub type DestinationFilters = BTreeMap<String, RoutingRule>;

/// Who the events are about.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub anonymous_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub traits: JsonMap,
}

impl UserInfo {
    /// Anonymous user with a fresh id.
    pub fn anonymous() -> Self {
        Self {
            anonymous_id: Uuid::new_v4().to_string(),
            user_id: None,
            traits: JsonMap::new(),
        }
    }
}
