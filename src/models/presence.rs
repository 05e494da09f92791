//! Presence roster entry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id_to_string;

/// One participant currently present on a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Presence key the provider tracks the participant under
    pub key: String,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub online_at: Option<DateTime<Utc>>,
    /// Raw tracked payload of the most recent session
    pub meta: Value,
    /// `phx_ref` of every session tracked under this key
    #[serde(default)]
    pub sessions: Vec<String>,
}

impl PresenceEntry {
    pub fn from_meta(key: &str, meta: Value) -> Self {
        let user_id = meta.get("user_id").and_then(id_to_string);
        let display_name = ["display_name", "name", "username"]
            .iter()
            .find_map(|field| meta.get(*field).and_then(Value::as_str))
            .map(str::to_string);
        let online_at = meta
            .get("online_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));

        let sessions = meta
            .get("phx_ref")
            .and_then(Value::as_str)
            .map(|r| vec![r.to_string()])
            .unwrap_or_default();

        Self {
            key: key.to_string(),
            user_id,
            display_name,
            online_at,
            meta,
            sessions,
        }
    }

    /// Entry for a key tracked from several sessions; the last meta is the
    /// one displayed
    pub fn from_metas(key: &str, metas: &[Value]) -> Self {
        let mut entry = Self::from_meta(key, metas.last().cloned().unwrap_or(Value::Null));
        entry.sessions = metas
            .iter()
            .filter_map(|meta| meta.get("phx_ref").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        entry
    }

    /// Add sessions of `other` (same key) and take over its payload
    pub fn merge(&mut self, other: &PresenceEntry) {
        let mut sessions = std::mem::take(&mut self.sessions);
        for session in &other.sessions {
            if !sessions.contains(session) {
                sessions.push(session.clone());
            }
        }
        *self = PresenceEntry {
            sessions,
            ..other.clone()
        };
    }

    /// Identifier used by the roster: the user id when tracked, else the key
    pub fn participant_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.key)
    }
}
