//! Activity feed over books, borrowings and members

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::subscriptions::{Subscription, SubscriptionManager};
use crate::{
    models::{ActivityEntry, ConnectionStatus, RealtimeEvent, ResourceDescriptor},
    repository::lock,
};

/// Resources that feed the activity list
pub const ACTIVITY_RESOURCES: [&str; 3] = ["books", "borrowings", "users"];

/// Scope label separating these feeds from other consumers of the same tables
const ACTIVITY_SCOPE: &str = "activity_feed";

/// Newest-first list capped at `max` entries
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    max: usize,
}

impl ActivityLog {
    pub fn new(max: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max: max.max(1),
        }
    }

    pub fn push(&mut self, entry: ActivityEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.max);
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct ActivityFeed {
    log: Arc<Mutex<ActivityLog>>,
    revision: Arc<watch::Sender<u64>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ActivityFeed {
    pub fn new(max_entries: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            log: Arc::new(Mutex::new(ActivityLog::new(max_entries))),
            revision: Arc::new(revision),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptors() -> Vec<ResourceDescriptor> {
        ACTIVITY_RESOURCES
            .iter()
            .map(|resource| ResourceDescriptor::table(*resource).filter(ACTIVITY_SCOPE))
            .collect()
    }

    /// Subscribe to every activity resource; a second call is a no-op
    pub fn start(&self, manager: &Arc<SubscriptionManager>) {
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.is_empty() {
            return;
        }

        for descriptor in Self::descriptors() {
            let log = self.log.clone();
            let revision = self.revision.clone();
            let handler = Arc::new(move |event: &RealtimeEvent| {
                let RealtimeEvent::Change(change) = event else {
                    return;
                };
                if let Some(entry) = ActivityEntry::from_change(change) {
                    tracing::debug!("Activity: {}", entry.description);
                    lock(&log).push(entry);
                    revision.send_modify(|r| *r += 1);
                }
            });
            subscriptions.push(manager.subscribe(&descriptor, handler));
        }
        tracing::info!("Activity feed started");
    }

    pub fn stop(&self) {
        let subscriptions: Vec<Subscription> = lock(&self.subscriptions).drain(..).collect();
        for subscription in subscriptions {
            subscription.disconnect();
        }
    }

    pub fn list(&self) -> Vec<ActivityEntry> {
        lock(&self.log).entries()
    }

    pub fn len(&self) -> usize {
        lock(&self.log).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.log).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
        self.revision.send_modify(|r| *r += 1);
    }

    /// Bumped on every change to the list
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn status(&self) -> Vec<ConnectionStatus> {
        lock(&self.subscriptions).iter().map(Subscription::status).collect()
    }
}
