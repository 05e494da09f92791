//! Live dashboard statistics
//!
//! Any change on a counted table invalidates the cached figures; the refetch
//! is debounced so a burst of changes costs one query.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

use super::{
    data::{DataAccess, FetchOptions},
    debounce::Debouncer,
    subscriptions::{Subscription, SubscriptionManager},
};
use crate::{
    error::AppResult,
    models::{DashboardStats, RealtimeEvent, ResourceDescriptor},
    repository::lock,
};

/// Cache key of the dashboard figures, also used as the feeds' scope label
pub const STATS_CACHE_KEY: &str = "dashboard_stats";

pub const STATS_RESOURCES: [&str; 3] = ["books", "borrowings", "users"];

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn dashboard_stats(&self) -> AppResult<DashboardStats>;
}

struct StatsInner {
    data: DataAccess,
    source: Arc<dyn StatsSource>,
    debouncer: Debouncer,
    snapshot: watch::Sender<Option<DashboardStats>>,
}

impl StatsInner {
    async fn refresh(&self) -> AppResult<DashboardStats> {
        let source = self.source.clone();
        let stats: DashboardStats = self
            .data
            .get_data(
                STATS_CACHE_KEY,
                move || async move {
                    source
                        .dashboard_stats()
                        .await
                        .map_err(|e| e.message().to_string())
                },
                FetchOptions::default(),
            )
            .await?;
        self.snapshot.send_replace(Some(stats.clone()));
        Ok(stats)
    }
}

pub struct DashboardStatsFeed {
    inner: Arc<StatsInner>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl DashboardStatsFeed {
    pub fn new(data: DataAccess, source: Arc<dyn StatsSource>, debounce: Duration) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            inner: Arc::new(StatsInner {
                data,
                source,
                debouncer: Debouncer::new(debounce),
                snapshot,
            }),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptors() -> Vec<ResourceDescriptor> {
        STATS_RESOURCES
            .iter()
            .map(|resource| ResourceDescriptor::table(*resource).filter(STATS_CACHE_KEY))
            .collect()
    }

    pub fn start(&self, manager: &Arc<SubscriptionManager>) {
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.is_empty() {
            return;
        }

        for descriptor in Self::descriptors() {
            let weak = Arc::downgrade(&self.inner);
            let handler = Arc::new(move |event: &RealtimeEvent| {
                if matches!(event, RealtimeEvent::Change(_)) {
                    schedule_refresh(&weak);
                }
            });
            subscriptions.push(manager.subscribe(&descriptor, handler));
        }
        tracing::info!("Dashboard statistics feed started");
    }

    pub fn stop(&self) {
        self.inner.debouncer.cancel();
        let subscriptions: Vec<Subscription> = lock(&self.subscriptions).drain(..).collect();
        for subscription in subscriptions {
            subscription.disconnect();
        }
    }

    /// Current figures, from the cache when still fresh
    pub async fn refresh(&self) -> AppResult<DashboardStats> {
        self.inner.refresh().await
    }

    /// Last figures fetched, if any
    pub fn current(&self) -> Option<DashboardStats> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<DashboardStats>> {
        self.inner.snapshot.subscribe()
    }

    pub fn refresh_pending(&self) -> bool {
        self.inner.debouncer.is_pending()
    }
}

fn schedule_refresh(weak: &Weak<StatsInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    inner.data.invalidate(STATS_CACHE_KEY);

    let weak = weak.clone();
    inner.debouncer.trigger(async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if let Err(e) = inner.refresh().await {
            tracing::warn!("Dashboard statistics refresh failed: {}", e);
        }
    });
}
