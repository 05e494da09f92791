//! Data models for the synchronization layer

pub mod activity;
pub mod change;
pub mod notification;
pub mod presence;
pub mod stats;
pub mod subscription;

// Re-export commonly used types
pub use activity::{ActivityEntry, ActivityKind};
pub use change::{ChangeEvent, ChangeKind, EventFilter, PresenceEvent, RealtimeEvent};
pub use notification::Notification;
pub use presence::PresenceEntry;
pub use stats::DashboardStats;
pub use subscription::{
    ConnectionSignal, ConnectionState, ConnectionStatus, ResourceDescriptor, SubscriptionKey,
};

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Row identifiers arrive as integers or uuids depending on the table
pub(crate) fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_to_string(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected string or number, got {}", value)))
}

pub(crate) fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_to_string))
}
