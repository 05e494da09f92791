//! Synchronization services

pub mod activity;
pub mod connection;
pub mod data;
pub mod debounce;
pub mod drafts;
pub mod notifications;
pub mod presence;
pub mod redis;
pub mod rest;
pub mod stats;
pub mod subscriptions;

use std::sync::Arc;

use crate::{
    config::{SessionConfig, SyncConfig},
    realtime::RealtimeProvider,
    repository::Repository,
};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub repository: Repository,
    pub data: data::DataAccess,
    pub subscriptions: Arc<subscriptions::SubscriptionManager>,
    pub notifications: Option<Arc<notifications::NotificationCenter>>,
    pub activity: Arc<activity::ActivityFeed>,
    pub presence: Option<Arc<presence::PresenceRoster>>,
    pub stats: Option<Arc<stats::DashboardStatsFeed>>,
}

/// Remote collaborators the services read from
#[derive(Clone, Default)]
pub struct Backends {
    pub notifications: Option<Arc<dyn notifications::NotificationBackend>>,
    pub stats: Option<Arc<dyn stats::StatsSource>>,
}

impl Services {
    /// Create all services on top of the given stores. Streams tied to the
    /// signed-in user are only built when a session is configured.
    pub fn new(
        repository: Repository,
        provider: Arc<dyn RealtimeProvider>,
        drafts: Arc<dyn drafts::DraftStore>,
        backends: Backends,
        sync: &SyncConfig,
        session: &SessionConfig,
    ) -> Self {
        let data = data::DataAccess::new(&repository, drafts, sync.cache_ttl());
        let subscriptions = subscriptions::SubscriptionManager::new(
            provider,
            repository.channels.clone(),
            sync.reconnect_policy(),
        );

        let notifications = session.is_signed_in().then(|| {
            Arc::new(notifications::NotificationCenter::new(
                session.user_id.trim(),
                sync.notification_max_entries,
                data.clone(),
                backends.notifications.clone(),
            ))
        });

        let presence = session.is_signed_in().then(|| {
            let display_name = match session.display_name.trim() {
                "" => session.user_id.trim().to_string(),
                name => name.to_string(),
            };
            Arc::new(presence::PresenceRoster::new(
                session.presence_room.as_str(),
                Some(presence::PresenceIdentity {
                    user_id: session.user_id.trim().to_string(),
                    display_name,
                }),
            ))
        });

        let stats = backends.stats.clone().map(|source| {
            Arc::new(stats::DashboardStatsFeed::new(
                data.clone(),
                source,
                sync.stats_debounce(),
            ))
        });

        Self {
            repository,
            data,
            subscriptions,
            notifications,
            activity: Arc::new(activity::ActivityFeed::new(sync.activity_max_entries)),
            presence,
            stats,
        }
    }

    /// Open every live feed and load the initial notification list
    pub async fn start(&self) {
        self.activity.start(&self.subscriptions);
        if let Some(presence) = &self.presence {
            presence.start(&self.subscriptions);
        }
        if let Some(stats) = &self.stats {
            stats.start(&self.subscriptions);
        }
        if let Some(notifications) = &self.notifications {
            notifications.start(&self.subscriptions);
            if let Err(e) = notifications.load().await {
                tracing::warn!("Initial notification load failed: {}", e);
            }
        }
        tracing::info!("{} live feeds open", self.subscriptions.feed_count());
    }

    /// Close every feed and reset the stores
    pub fn shutdown(&self) {
        if let Some(notifications) = &self.notifications {
            notifications.stop();
        }
        if let Some(presence) = &self.presence {
            presence.stop();
        }
        if let Some(stats) = &self.stats {
            stats.stop();
        }
        self.activity.stop();
        self.subscriptions.shutdown();
        self.repository.cleanup();
    }
}
