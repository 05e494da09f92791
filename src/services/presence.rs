//! Presence roster of staff members currently using the application

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use super::subscriptions::{Subscription, SubscriptionManager};
use crate::{
    models::{ConnectionStatus, PresenceEntry, PresenceEvent, RealtimeEvent, ResourceDescriptor},
    repository::lock,
};

/// Participants keyed by presence key, in arrival order
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: IndexMap<String, PresenceEntry>,
}

impl Roster {
    pub fn apply(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Sync(entries) => {
                // built aside and swapped in whole
                self.entries = entries
                    .iter()
                    .map(|entry| (entry.key.clone(), entry.clone()))
                    .collect();
            }
            PresenceEvent::Join(entries) => {
                for entry in entries {
                    match self.entries.get_mut(&entry.key) {
                        Some(existing) => existing.merge(entry),
                        None => {
                            self.entries.insert(entry.key.clone(), entry.clone());
                        }
                    }
                }
            }
            PresenceEvent::Leave(entries) => {
                for left in entries {
                    let Some(existing) = self.entries.get_mut(&left.key) else {
                        continue;
                    };
                    // a key stays online until its last session leaves
                    existing.sessions.retain(|s| !left.sessions.contains(s));
                    if left.sessions.is_empty() || existing.sessions.is_empty() {
                        self.entries.shift_remove(&left.key);
                    }
                }
            }
        }
    }

    pub fn entries(&self) -> Vec<PresenceEntry> {
        self.entries.values().cloned().collect()
    }

    /// Matches either the presence key or the tracked user id
    pub fn is_online(&self, participant: &str) -> bool {
        self.entries.contains_key(participant)
            || self
                .entries
                .values()
                .any(|entry| entry.participant_id() == participant)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identity announced on the room
#[derive(Debug, Clone)]
pub struct PresenceIdentity {
    pub user_id: String,
    pub display_name: String,
}

pub struct PresenceRoster {
    room: String,
    identity: Option<PresenceIdentity>,
    roster: Arc<Mutex<Roster>>,
    subscription: Mutex<Option<Subscription>>,
    announcer: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceRoster {
    pub fn new(room: impl Into<String>, identity: Option<PresenceIdentity>) -> Self {
        Self {
            room: room.into(),
            identity,
            roster: Arc::new(Mutex::new(Roster::default())),
            subscription: Mutex::new(None),
            announcer: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor::presence(self.room.as_str())
    }

    /// Join the room; our own payload is tracked each time the channel
    /// (re)connects
    pub fn start(&self, manager: &Arc<SubscriptionManager>) {
        let mut current = lock(&self.subscription);
        if current.is_some() {
            return;
        }

        let roster = self.roster.clone();
        let handler = Arc::new(move |event: &RealtimeEvent| {
            if let RealtimeEvent::Presence(presence) = event {
                lock(&roster).apply(presence);
            }
        });
        let subscription = manager.subscribe(&self.descriptor(), handler);

        if let (Some(identity), Ok(runtime)) =
            (self.identity.clone(), tokio::runtime::Handle::try_current())
        {
            let connection = subscription.connection().clone();
            let mut status = subscription.watch_status();
            let task = runtime.spawn(async move {
                loop {
                    let connected = status.borrow_and_update().is_connected();
                    if connected {
                        let payload = json!({
                            "user_id": identity.user_id,
                            "display_name": identity.display_name,
                            "online_at": Utc::now().to_rfc3339(),
                        });
                        if let Err(e) = connection.track(payload) {
                            tracing::warn!("Could not announce presence: {}", e);
                        }
                        // wait for the connection to drop before announcing again
                        if status.wait_for(|s| !s.is_connected()).await.is_err() {
                            return;
                        }
                    }
                    if status.changed().await.is_err() {
                        return;
                    }
                }
            });
            *lock(&self.announcer) = Some(task);
        }

        *current = Some(subscription);
        tracing::info!("Presence started on room {}", self.room);
    }

    pub fn stop(&self) {
        if let Some(task) = lock(&self.announcer).take() {
            task.abort();
        }
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.disconnect();
        }
    }

    pub fn roster(&self) -> Vec<PresenceEntry> {
        lock(&self.roster).entries()
    }

    pub fn is_online(&self, participant: &str) -> bool {
        lock(&self.roster).is_online(participant)
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        lock(&self.subscription).as_ref().map(Subscription::status)
    }
}

impl Drop for PresenceRoster {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.announcer).take() {
            task.abort();
        }
    }
}
