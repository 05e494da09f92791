//! Change events decoded at the realtime provider boundary
//!
//! Providers hand over loosely-typed JSON; everything downstream of the
//! provider works on [`RealtimeEvent`] only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{id_to_string, presence::PresenceEntry};
use crate::error::{AppError, AppResult};

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            other => Err(AppError::Decode(format!("unknown change type '{}'", other))),
        }
    }
}

/// Event kinds a subscription can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFilter {
    /// Every row change on the resource
    All,
    Insert,
    Update,
    Delete,
    /// Presence sync/join/leave on a room
    Presence,
}

impl EventFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Insert => "INSERT",
            EventFilter::Update => "UPDATE",
            EventFilter::Delete => "DELETE",
            EventFilter::Presence => "presence",
        }
    }

    pub fn matches(&self, event: &RealtimeEvent) -> bool {
        match (self, event) {
            (EventFilter::Presence, RealtimeEvent::Presence(_)) => true,
            (EventFilter::All, RealtimeEvent::Change(_)) => true,
            (EventFilter::Insert, RealtimeEvent::Change(c)) => c.kind == ChangeKind::Insert,
            (EventFilter::Update, RealtimeEvent::Change(c)) => c.kind == ChangeKind::Update,
            (EventFilter::Delete, RealtimeEvent::Change(c)) => c.kind == ChangeKind::Delete,
            _ => false,
        }
    }
}

/// A single row change on a remote resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub schema: String,
    /// Table (or other resource) name
    pub resource: String,
    /// Row before the change (UPDATE/DELETE, when the provider sends it)
    pub before: Option<Value>,
    /// Row after the change (INSERT/UPDATE)
    pub after: Option<Value>,
    pub committed_at: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, resource: impl Into<String>) -> Self {
        Self {
            kind,
            schema: "public".to_string(),
            resource: resource.into(),
            before: None,
            after: None,
            committed_at: None,
        }
    }

    pub fn insert(resource: impl Into<String>, row: Value) -> Self {
        Self::new(ChangeKind::Insert, resource).with_after(row)
    }

    pub fn update(resource: impl Into<String>, before: Option<Value>, after: Value) -> Self {
        let mut event = Self::new(ChangeKind::Update, resource).with_after(after);
        event.before = before;
        event
    }

    pub fn delete(resource: impl Into<String>, row: Value) -> Self {
        let mut event = Self::new(ChangeKind::Delete, resource);
        event.before = Some(row);
        event
    }

    pub fn with_after(mut self, row: Value) -> Self {
        self.after = Some(row);
        self
    }

    /// The most recent known version of the row
    pub fn record(&self) -> Option<&Value> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Identifier of the changed row, taken from `after` then `before`
    pub fn record_id(&self) -> Option<String> {
        [self.after.as_ref(), self.before.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| row.get("id").and_then(id_to_string))
    }

    /// Decode a `postgres_changes` payload.
    ///
    /// Accepts both the server shape (`{"data": {"type", "table", "record",
    /// "old_record"}}`) and the client-normalized shape (`{"eventType", "table",
    /// "new", "old"}`).
    pub fn from_postgres_changes(payload: &Value) -> AppResult<Self> {
        let data = payload.get("data").unwrap_or(payload);

        let kind = data
            .get("type")
            .or_else(|| data.get("eventType"))
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Decode("change payload has no type".to_string()))?
            .parse::<ChangeKind>()?;

        let resource = data
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Decode("change payload has no table".to_string()))?
            .to_string();

        let schema = data
            .get("schema")
            .and_then(Value::as_str)
            .unwrap_or("public")
            .to_string();

        let row = |primary: &str, fallback: &str| {
            data.get(primary)
                .or_else(|| data.get(fallback))
                .filter(|v| v.as_object().map_or(false, |o| !o.is_empty()))
                .cloned()
        };

        let committed_at = data
            .get("commit_timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));

        Ok(Self {
            kind,
            schema,
            resource,
            before: row("old_record", "old"),
            after: row("record", "new"),
            committed_at,
        })
    }
}

/// Presence roster changes on a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// Full roster snapshot
    Sync(Vec<PresenceEntry>),
    Join(Vec<PresenceEntry>),
    /// Sessions that left; an entry without session refs stands for the
    /// whole key
    Leave(Vec<PresenceEntry>),
}

impl PresenceEvent {
    /// Decode a `presence_state` payload (`{key: {metas: [...]}}`) into a sync
    pub fn from_presence_state(payload: &Value) -> AppResult<Self> {
        Ok(PresenceEvent::Sync(entries_from_state(payload)?))
    }

    /// Decode a `presence_diff` payload into its join then leave events.
    /// Empty halves are omitted.
    pub fn from_presence_diff(payload: &Value) -> AppResult<Vec<Self>> {
        let mut events = Vec::new();

        if let Some(joins) = payload.get("joins") {
            let entries = entries_from_state(joins)?;
            if !entries.is_empty() {
                events.push(PresenceEvent::Join(entries));
            }
        }

        if let Some(leaves) = payload.get("leaves") {
            let entries = entries_from_state(leaves)?;
            if !entries.is_empty() {
                events.push(PresenceEvent::Leave(entries));
            }
        }

        Ok(events)
    }
}

fn entries_from_state(state: &Value) -> AppResult<Vec<PresenceEntry>> {
    let map = state
        .as_object()
        .ok_or_else(|| AppError::Decode("presence state is not an object".to_string()))?;

    Ok(map
        .iter()
        .map(|(key, value)| {
            let metas = value
                .get("metas")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            PresenceEntry::from_metas(key, metas)
        })
        .collect())
}

/// Anything a realtime channel delivers to its listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RealtimeEvent {
    Change(ChangeEvent),
    Presence(PresenceEvent),
}

impl From<ChangeEvent> for RealtimeEvent {
    fn from(event: ChangeEvent) -> Self {
        RealtimeEvent::Change(event)
    }
}

impl From<PresenceEvent> for RealtimeEvent {
    fn from(event: PresenceEvent) -> Self {
        RealtimeEvent::Presence(event)
    }
}
