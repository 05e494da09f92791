//! Realtime channel provider boundary
//!
//! A provider opens named channels; each channel delivers decoded
//! [`RealtimeEvent`]s to its listeners and reports its lifecycle through a
//! status callback. Two providers ship with the crate: [`memory`] (in-process,
//! used offline and in tests) and [`websocket`] (Phoenix channels over a
//! websocket).

pub mod memory;
pub mod websocket;

use serde_json::Value;
use std::sync::Arc;

use crate::{
    error::AppResult,
    models::{EventFilter, RealtimeEvent, ResourceDescriptor},
};

pub type EventCallback = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// Identifies a listener attached with [`ChannelHandle::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Lifecycle signals reported by a provider for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// What a listener wants to receive on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenFilter {
    pub event: EventFilter,
    pub schema: String,
    pub table: String,
    /// Row filter evaluated by the remote side
    pub filter: Option<String>,
}

impl ListenFilter {
    /// Local check applied when dispatching; row filters are left to the server
    pub fn accepts(&self, event: &RealtimeEvent) -> bool {
        if !self.event.matches(event) {
            return false;
        }
        match event {
            RealtimeEvent::Change(change) => {
                change.resource.eq_ignore_ascii_case(&self.table)
                    && change.schema.eq_ignore_ascii_case(&self.schema)
            }
            RealtimeEvent::Presence(_) => true,
        }
    }
}

impl From<&ResourceDescriptor> for ListenFilter {
    fn from(descriptor: &ResourceDescriptor) -> Self {
        Self {
            event: descriptor.event,
            schema: descriptor.schema.clone(),
            table: descriptor.resource.clone(),
            filter: descriptor.row_filter().map(str::to_string),
        }
    }
}

/// One physical channel opened through a [`RealtimeProvider`]
pub trait ChannelHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Attach a listener; must be called before [`subscribe`](Self::subscribe)
    /// for the provider to include it in the join request
    fn on(&self, filter: ListenFilter, callback: EventCallback) -> ListenerId;

    fn off(&self, listener: ListenerId);

    /// Join the channel; lifecycle changes are reported to `on_status`
    fn subscribe(&self, on_status: StatusCallback);

    fn unsubscribe(&self);

    /// Publish this client's presence payload on the channel
    fn track(&self, payload: Value) -> AppResult<()>;
}

pub trait RealtimeProvider: Send + Sync {
    fn channel(&self, name: &str) -> Arc<dyn ChannelHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeEvent, PresenceEntry, PresenceEvent};
    use serde_json::json;

    #[test]
    fn test_listen_filter_matches_table_and_kind() {
        let filter = ListenFilter::from(
            &ResourceDescriptor::table("borrowings").event(EventFilter::Insert),
        );

        let insert: RealtimeEvent = ChangeEvent::insert("borrowings", json!({"id": 1})).into();
        let other_table: RealtimeEvent = ChangeEvent::insert("books", json!({"id": 1})).into();
        let delete: RealtimeEvent = ChangeEvent::delete("borrowings", json!({"id": 1})).into();
        let presence: RealtimeEvent =
            PresenceEvent::Leave(vec![PresenceEntry::from_meta("u1", json!({}))]).into();

        assert!(filter.accepts(&insert));
        assert!(!filter.accepts(&other_table));
        assert!(!filter.accepts(&delete));
        assert!(!filter.accepts(&presence));
    }
}
