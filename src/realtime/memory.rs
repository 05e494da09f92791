//! In-process realtime provider
//!
//! Channels live in memory and only receive what the owner of the provider
//! emits. Used when no realtime endpoint is configured, and by tests to play
//! the remote side.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    ChannelHandle, ChannelStatus, EventCallback, ListenFilter, ListenerId, RealtimeProvider,
    StatusCallback,
};
use crate::{
    error::{AppError, AppResult},
    models::RealtimeEvent,
    repository::lock,
};

struct Listener {
    id: ListenerId,
    filter: ListenFilter,
    callback: EventCallback,
}

pub struct MemoryChannel {
    name: String,
    auto_subscribe: bool,
    listeners: Mutex<Vec<Listener>>,
    status: Mutex<Option<StatusCallback>>,
    subscribed: AtomicBool,
    closed: AtomicBool,
    tracked: Mutex<Vec<Value>>,
    next_listener: AtomicU64,
}

impl MemoryChannel {
    fn is_open(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn status_callback(&self) -> Option<StatusCallback> {
        lock(&self.status).clone()
    }

    fn deliver(&self, event: &RealtimeEvent) -> usize {
        let callbacks: Vec<EventCallback> = lock(&self.listeners)
            .iter()
            .filter(|l| l.filter.accepts(event))
            .map(|l| l.callback.clone())
            .collect();
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }
}

impl ChannelHandle for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on(&self, filter: ListenFilter, callback: EventCallback) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push(Listener {
            id,
            filter,
            callback,
        });
        id
    }

    fn off(&self, listener: ListenerId) {
        lock(&self.listeners).retain(|l| l.id != listener);
    }

    fn subscribe(&self, on_status: StatusCallback) {
        *lock(&self.status) = Some(on_status.clone());
        self.subscribed.store(true, Ordering::SeqCst);
        if self.auto_subscribe {
            on_status(ChannelStatus::Subscribed);
        }
    }

    fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = self.status_callback() {
            callback(ChannelStatus::Closed);
        }
    }

    fn track(&self, payload: Value) -> AppResult<()> {
        if !self.is_open() {
            return Err(AppError::Connection(format!(
                "channel {} is not subscribed",
                self.name
            )));
        }
        lock(&self.tracked).push(payload);
        Ok(())
    }
}

/// Loopback provider; cheap to clone, clones share their channels
#[derive(Clone, Default)]
pub struct MemoryProvider {
    channels: Arc<Mutex<Vec<Arc<MemoryChannel>>>>,
    channel_calls: Arc<AtomicUsize>,
    auto_subscribe: bool,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge every subscription immediately
    pub fn with_auto_subscribe(mut self) -> Self {
        self.auto_subscribe = true;
        self
    }

    /// Number of `channel()` calls received so far
    pub fn channel_calls(&self) -> usize {
        self.channel_calls.load(Ordering::SeqCst)
    }

    fn open(&self, name: &str) -> Vec<Arc<MemoryChannel>> {
        lock(&self.channels)
            .iter()
            .filter(|c| c.name == name && c.is_open())
            .cloned()
            .collect()
    }

    /// Names of subscribed, not yet closed channels
    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.channels)
            .iter()
            .filter(|c| c.is_open())
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Deliver an event on every open channel called `name`; returns how
    /// many listeners received it
    pub fn emit(&self, name: &str, event: impl Into<RealtimeEvent>) -> usize {
        let event = event.into();
        self.open(name).iter().map(|c| c.deliver(&event)).sum()
    }

    /// Report a status signal on every open channel called `name`
    pub fn emit_status(&self, name: &str, status: ChannelStatus) -> usize {
        let callbacks: Vec<StatusCallback> = self
            .open(name)
            .iter()
            .filter_map(|c| c.status_callback())
            .collect();
        for callback in &callbacks {
            callback(status.clone());
        }
        callbacks.len()
    }

    /// Presence payloads tracked on open channels called `name`
    pub fn tracked(&self, name: &str) -> Vec<Value> {
        self.open(name)
            .iter()
            .flat_map(|c| lock(&c.tracked).clone())
            .collect()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.open(name)
            .iter()
            .map(|c| lock(&c.listeners).len())
            .sum()
    }
}

impl RealtimeProvider for MemoryProvider {
    fn channel(&self, name: &str) -> Arc<dyn ChannelHandle> {
        self.channel_calls.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(MemoryChannel {
            name: name.to_string(),
            auto_subscribe: self.auto_subscribe,
            listeners: Mutex::new(Vec::new()),
            status: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tracked: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        });
        let mut channels = lock(&self.channels);
        channels.retain(|c| !c.closed.load(Ordering::SeqCst));
        channels.push(channel.clone());
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeEvent, EventFilter, ResourceDescriptor};
    use serde_json::json;

    #[test]
    fn test_events_reach_only_open_channels() {
        let provider = MemoryProvider::new();
        let channel = provider.channel("books");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        channel.on(
            ListenFilter::from(&ResourceDescriptor::table("books").event(EventFilter::Insert)),
            Arc::new(move |_: &RealtimeEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // not subscribed yet
        assert_eq!(provider.emit("books", ChangeEvent::insert("books", json!({"id": 1}))), 0);

        channel.subscribe(Arc::new(|_: ChannelStatus| {}));
        assert_eq!(provider.emit("books", ChangeEvent::insert("books", json!({"id": 2}))), 1);

        channel.unsubscribe();
        assert_eq!(provider.emit("books", ChangeEvent::insert("books", json!({"id": 3}))), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(provider.channel_calls(), 1);
    }

    #[test]
    fn test_unsubscribe_reports_closed_once() {
        let provider = MemoryProvider::new().with_auto_subscribe();
        let channel = provider.channel("presence");
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        channel.subscribe(Arc::new(move |s: ChannelStatus| sink.lock().unwrap().push(s)));

        channel.unsubscribe();
        channel.unsubscribe();

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ChannelStatus::Subscribed, ChannelStatus::Closed]
        );
        assert!(channel.track(json!({"user_id": "u1"})).is_err());
    }
}
