//! Subscription manager
//!
//! Any number of consumers may subscribe to the same descriptor; they share
//! one feed, hence one connection state machine and one physical channel.
//! The feed is torn down when its last consumer leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::connection::{ConnectionCallbacks, ConnectionStateMachine, ReconnectPolicy};
use crate::{
    error::AppResult,
    models::{ConnectionState, ConnectionStatus, RealtimeEvent, ResourceDescriptor, SubscriptionKey},
    realtime::RealtimeProvider,
    repository::{lock, ChannelRegistry},
};

/// Consumer callback for events on a feed
pub type ChangeHandler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

type Handlers = Arc<Mutex<Vec<(u64, ChangeHandler)>>>;

struct Feed {
    key: SubscriptionKey,
    machine: ConnectionStateMachine,
    handlers: Handlers,
}

/// Connection summary of one feed, as exposed to status views
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub key: SubscriptionKey,
    pub consumers: usize,
    #[serde(flatten)]
    pub status: ConnectionStatus,
}

pub struct SubscriptionManager {
    provider: Arc<dyn RealtimeProvider>,
    registry: Arc<ChannelRegistry>,
    policy: ReconnectPolicy,
    feeds: Mutex<HashMap<SubscriptionKey, Arc<Feed>>>,
    next_handler: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(
        provider: Arc<dyn RealtimeProvider>,
        registry: Arc<ChannelRegistry>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            registry,
            policy,
            feeds: Mutex::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
        })
    }

    /// Register `handler` for events matching `descriptor` and make sure the
    /// feed is connecting.
    pub fn subscribe(self: &Arc<Self>, descriptor: &ResourceDescriptor, handler: ChangeHandler) -> Subscription {
        let key = descriptor.key();
        let handler_id = self.next_handler.fetch_add(1, Ordering::Relaxed);

        let feed = {
            let mut feeds = lock(&self.feeds);
            let feed = feeds
                .entry(key.clone())
                .or_insert_with(|| self.new_feed(descriptor, key.clone()))
                .clone();
            lock(&feed.handlers).push((handler_id, handler));
            feed
        };

        tracing::debug!(
            "Consumer {} attached to {} ({} total)",
            handler_id,
            key,
            lock(&feed.handlers).len()
        );
        feed.machine.connect();

        Subscription {
            manager: Arc::downgrade(self),
            feed,
            handler_id,
            detached: AtomicBool::new(false),
        }
    }

    fn new_feed(&self, descriptor: &ResourceDescriptor, key: SubscriptionKey) -> Arc<Feed> {
        let handlers: Handlers = Arc::new(Mutex::new(Vec::new()));
        let fan_out = handlers.clone();
        let on_event = Arc::new(move |event: &RealtimeEvent| {
            let current: Vec<ChangeHandler> =
                lock(&fan_out).iter().map(|(_, handler)| handler.clone()).collect();
            for handler in current {
                handler(event);
            }
        });

        let machine = ConnectionStateMachine::new(
            descriptor.clone(),
            self.provider.clone(),
            self.registry.clone(),
            self.policy.clone(),
            ConnectionCallbacks::new(on_event),
        );

        tracing::info!("Creating feed {}", key);
        Arc::new(Feed {
            key,
            machine,
            handlers,
        })
    }

    fn detach(&self, feed: &Arc<Feed>, handler_id: u64) {
        // held across the teardown so a new consumer cannot reuse the channel
        // being closed
        let mut feeds = lock(&self.feeds);
        let empty = {
            let mut handlers = lock(&feed.handlers);
            handlers.retain(|(id, _)| *id != handler_id);
            handlers.is_empty()
        };
        if !empty {
            return;
        }

        if feeds
            .get(&feed.key)
            .map_or(false, |registered| Arc::ptr_eq(registered, feed))
        {
            feeds.remove(&feed.key);
        }
        tracing::info!("Last consumer left {}, closing feed", feed.key);
        feed.machine.disconnect();
    }

    pub fn feed_count(&self) -> usize {
        lock(&self.feeds).len()
    }

    /// Number of consumers attached to `key`
    pub fn consumers(&self, key: &SubscriptionKey) -> usize {
        lock(&self.feeds)
            .get(key)
            .map_or(0, |feed| lock(&feed.handlers).len())
    }

    pub fn status_report(&self) -> Vec<FeedStatus> {
        let feeds: Vec<Arc<Feed>> = lock(&self.feeds).values().cloned().collect();
        let mut report: Vec<FeedStatus> = feeds
            .iter()
            .map(|feed| FeedStatus {
                key: feed.key.clone(),
                consumers: lock(&feed.handlers).len(),
                status: feed.machine.status(),
            })
            .collect();
        report.sort_by(|a, b| a.key.cmp(&b.key));
        report
    }

    /// Disconnect every feed and drop all consumers
    pub fn shutdown(&self) {
        let feeds: Vec<Arc<Feed>> = lock(&self.feeds).drain().map(|(_, feed)| feed).collect();
        for feed in &feeds {
            lock(&feed.handlers).clear();
            feed.machine.disconnect();
        }
        tracing::info!("Closed {} feeds", feeds.len());
    }
}

/// A consumer's attachment to a feed; dropping it unsubscribes
pub struct Subscription {
    manager: Weak<SubscriptionManager>,
    feed: Arc<Feed>,
    handler_id: u64,
    detached: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.feed.key
    }

    pub fn status(&self) -> ConnectionStatus {
        self.feed.machine.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.feed.machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.status().is_connecting()
    }

    pub fn error(&self) -> Option<String> {
        self.status().error
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.status().last_update
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.feed.machine.watch()
    }

    /// Status changes as a stream, starting with the current status
    pub fn status_stream(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.watch_status())
    }

    /// Manual reconnect of the shared feed
    pub fn reconnect(&self) {
        self.feed.machine.reconnect();
    }

    /// Publish a presence payload on the feed's channel
    pub fn track(&self, payload: Value) -> AppResult<()> {
        self.feed.machine.track(payload)
    }

    pub fn connection(&self) -> &ConnectionStateMachine {
        &self.feed.machine
    }

    /// Detach this consumer. Idempotent.
    pub fn disconnect(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.manager.upgrade() {
            Some(manager) => manager.detach(&self.feed, self.handler_id),
            None => self.feed.machine.disconnect(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.disconnect();
    }
}
