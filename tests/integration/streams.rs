//! Derived streams wired through the service container

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use elidune_sync::{
    error::{AppError, AppResult},
    models::{ChangeEvent, DashboardStats, Notification, PresenceEntry, PresenceEvent},
    services::{
        activity::ActivityFeed, notifications::NotificationBackend, stats::StatsSource, Backends,
    },
};

use super::{services, signed_in};

/// Backend double keeping the notifications table in memory
#[derive(Default)]
pub struct FakeBackend {
    pub rows: Mutex<Vec<Notification>>,
    pub stats_calls: AtomicU64,
    pub fail_writes: bool,
}

pub fn notification(id: &str, is_read: bool, minute: u32) -> Notification {
    Notification {
        id: id.to_string(),
        user_id: Some("u1".to_string()),
        title: format!("Notification {}", id),
        message: String::new(),
        kind: "overdue".to_string(),
        is_read,
        link: None,
        created_at: Utc.with_ymd_and_hms(2024, 5, 2, 8, minute, 0).single(),
    }
}

#[async_trait]
impl NotificationBackend for FakeBackend {
    async fn fetch_notifications(&self, _user_id: &str, limit: usize) -> AppResult<Vec<Notification>> {
        Ok(self.rows.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn mark_read(&self, id: &str) -> AppResult<()> {
        if self.fail_writes {
            return Err(AppError::Fetch("permission denied".to_string()));
        }
        for row in self.rows.lock().unwrap().iter_mut().filter(|n| n.id == id) {
            row.is_read = true;
        }
        Ok(())
    }

    async fn mark_all_read(&self, _user_id: &str) -> AppResult<()> {
        for row in self.rows.lock().unwrap().iter_mut() {
            row.is_read = true;
        }
        Ok(())
    }

    async fn delete_notification(&self, id: &str) -> AppResult<()> {
        self.rows.lock().unwrap().retain(|n| n.id != id);
        Ok(())
    }
}

#[async_trait]
impl StatsSource for FakeBackend {
    async fn dashboard_stats(&self) -> AppResult<DashboardStats> {
        let n = self.stats_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(DashboardStats {
            total_books: 100 + n,
            active_borrowings: 12,
            overdue_borrowings: 3,
            total_users: 40,
            refreshed_at: Some(Utc::now()),
        })
    }
}

pub fn backends(backend: &Arc<FakeBackend>) -> Backends {
    let notifications: Arc<dyn NotificationBackend> = backend.clone();
    let stats: Arc<dyn StatsSource> = backend.clone();
    Backends {
        notifications: Some(notifications),
        stats: Some(stats),
    }
}

#[tokio::test]
async fn test_unread_count_follows_every_change() {
    let backend = Arc::new(FakeBackend::default());
    *backend.rows.lock().unwrap() = vec![notification("1", false, 0), notification("2", true, 1)];
    let (services, provider) = services(backends(&backend), signed_in("u1"));
    services.start().await;

    let center = services.notifications.clone().unwrap();
    assert_eq!(center.unread_count(), 1);
    let key = center.descriptor().key();

    let row = serde_json::to_value(notification("3", false, 2)).unwrap();
    provider.emit(key.as_str(), ChangeEvent::insert("notifications", row.clone()));
    assert_eq!(center.unread_count(), 2);
    assert_eq!(center.list()[0].id, "3");

    let mut read = row.clone();
    read["is_read"] = json!(true);
    provider.emit(key.as_str(), ChangeEvent::update("notifications", Some(row), read));
    assert_eq!(center.unread_count(), 1);

    provider.emit(key.as_str(), ChangeEvent::delete("notifications", json!({"id": "1"})));
    assert_eq!(center.unread_count(), 0);
    assert_eq!(center.list().len(), 2);

    let snapshot = center.snapshot();
    let unread = snapshot.items().iter().filter(|n| !n.is_read).count();
    assert_eq!(snapshot.unread(), unread);

    services.shutdown();
    assert!(provider.active_channels().is_empty());
}

#[tokio::test]
async fn test_backend_refusal_leaves_list_untouched() {
    let backend = Arc::new(FakeBackend {
        fail_writes: true,
        ..FakeBackend::default()
    });
    *backend.rows.lock().unwrap() = vec![notification("1", false, 0)];
    let (services, _) = services(backends(&backend), signed_in("u1"));
    services.start().await;

    let center = services.notifications.clone().unwrap();
    let result = center.mark_as_read("1").await;
    assert_eq!(result, Err(AppError::Save("permission denied".to_string())));
    assert_eq!(center.unread_count(), 1);

    let missing = tokio_test::assert_err!(center.delete("missing").await);
    assert!(matches!(missing, AppError::NotFound(_)));
    assert_eq!(center.mark_all_as_read().await.unwrap(), 1);
    assert_eq!(*center.watch_unread().borrow(), 0);
}

#[tokio::test]
async fn test_activity_and_presence_through_services() {
    let (services, provider) = services(Backends::default(), signed_in("u1"));
    services.start().await;
    assert!(services.stats.is_none());

    let books = ActivityFeed::descriptors()[0].key();
    for id in 0..60 {
        provider.emit(
            books.as_str(),
            ChangeEvent::insert("books", json!({"id": id, "title": format!("Book {}", id)})),
        );
    }
    let activity = services.activity.list();
    assert_eq!(activity.len(), 50);
    assert_eq!(activity[0].record_id.as_deref(), Some("59"));

    let presence = services.presence.clone().unwrap();
    let room = presence.descriptor().key();
    let member = |key: &str| PresenceEntry::from_meta(key, json!({"user_id": key}));
    provider.emit(room.as_str(), PresenceEvent::Sync(vec![member("A"), member("B")]));
    provider.emit(room.as_str(), PresenceEvent::Leave(vec![member("A")]));

    let roster: Vec<String> = presence.roster().into_iter().map(|e| e.key).collect();
    assert_eq!(roster, vec!["B"]);
    assert!(!presence.is_online("A"));

    services.shutdown();
    assert_eq!(services.subscriptions.feed_count(), 0);
}

#[tokio::test]
async fn test_signed_out_session_skips_personal_streams() {
    let backend = Arc::new(FakeBackend::default());
    let (services, provider) = services(backends(&backend), Default::default());
    services.start().await;

    assert!(services.notifications.is_none());
    assert!(services.presence.is_none());
    // three activity feeds and three statistics feeds
    assert_eq!(provider.channel_calls(), 6);

    let stats = services.stats.clone().unwrap();
    assert_eq!(stats.refresh().await.unwrap().total_books, 101);
    assert_eq!(stats.refresh().await.unwrap().total_books, 101);
    assert_eq!(backend.stats_calls.load(Ordering::SeqCst), 1);
}
