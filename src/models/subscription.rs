//! Subscription keys, descriptors and connection state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::EventFilter;

/// What a caller wants to receive live updates for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub schema: String,
    /// Table name, or room name for presence
    pub resource: String,
    pub event: EventFilter,
    /// Either a row filter (`column=op.value`) forwarded to the provider, or
    /// a scope label (e.g. `dashboard_stats`) that only separates feeds
    pub filter: Option<String>,
    pub auto_reconnect: bool,
}

impl ResourceDescriptor {
    /// All changes on a table in the `public` schema
    pub fn table(resource: impl Into<String>) -> Self {
        Self {
            schema: "public".to_string(),
            resource: resource.into(),
            event: EventFilter::All,
            filter: None,
            auto_reconnect: true,
        }
    }

    /// Presence on a named room
    pub fn presence(room: impl Into<String>) -> Self {
        Self {
            event: EventFilter::Presence,
            ..Self::table(room)
        }
    }

    pub fn event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Filter to forward to the provider, if the filter is a row filter
    pub fn row_filter(&self) -> Option<&str> {
        self.filter
            .as_deref()
            .map(str::trim)
            .filter(|f| f.contains('='))
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(&self.schema, &self.resource, self.event, self.filter.as_deref())
    }
}

/// Normalized identifier of one logical live feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(schema: &str, resource: &str, event: EventFilter, filter: Option<&str>) -> Self {
        let schema = match schema.trim() {
            "" => "public".to_string(),
            s => s.to_ascii_lowercase(),
        };
        let filter = filter.map(str::trim).filter(|f| !f.is_empty()).unwrap_or("*");
        Self(format!(
            "{}:{}:{}:{}",
            schema,
            resource.trim().to_ascii_lowercase(),
            event.as_str(),
            filter
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Inputs that move a [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// `connect()` was called
    Connect,
    /// Provider acknowledged the subscription
    Subscribed,
    /// Provider reported a channel error or timeout
    Failed,
    /// Provider closed the channel
    Closed,
    /// `disconnect()` was called
    Disconnect,
}

impl ConnectionState {
    /// Transition table. `None` means the signal is ignored in this state.
    pub fn next(self, signal: ConnectionSignal) -> Option<ConnectionState> {
        use ConnectionSignal as S;
        use ConnectionState::*;

        match (self, signal) {
            (Disconnected | Error, S::Connect) => Some(Connecting),
            (Connecting | Connected, S::Connect) => None,

            (Connecting | Connected | Error, S::Subscribed) => Some(Connected),
            (Disconnected, S::Subscribed) => None,

            (Connecting | Connected | Error, S::Failed) => Some(Error),
            (Disconnected, S::Failed) => None,

            (Connecting | Connected | Error, S::Closed) => Some(Disconnected),
            (Disconnected, S::Closed) => None,

            (_, S::Disconnect) => Some(Disconnected),
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", label)
    }
}

/// Snapshot of a subscription's connectivity as seen by UI callers
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
    /// Automatic reconnect attempts since the last successful connection
    pub attempts: u32,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn has_error(&self) -> bool {
        self.state == ConnectionState::Error
    }
}
