//! Live notification stream of the signed-in staff member

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::{
    data::{DataAccess, FetchOptions, SaveOptions},
    subscriptions::{Subscription, SubscriptionManager},
};
use crate::{
    error::{AppError, AppResult},
    models::{ChangeEvent, ChangeKind, ConnectionStatus, Notification, RealtimeEvent, ResourceDescriptor},
    repository::lock,
};

/// Remote side of the notifications table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    async fn fetch_notifications(&self, user_id: &str, limit: usize) -> AppResult<Vec<Notification>>;

    async fn mark_read(&self, id: &str) -> AppResult<()>;

    async fn mark_all_read(&self, user_id: &str) -> AppResult<()>;

    async fn delete_notification(&self, id: &str) -> AppResult<()>;
}

/// Newest-first list with an unread counter kept equal to the number of
/// retained unread items
#[derive(Debug, Clone, Serialize)]
pub struct NotificationList {
    items: Vec<Notification>,
    unread: usize,
    #[serde(skip)]
    max: usize,
}

impl NotificationList {
    pub fn new(max: usize) -> Self {
        Self {
            items: Vec::new(),
            unread: 0,
            max: max.max(1),
        }
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|n| n.id == id)
    }

    pub fn insert(&mut self, notification: Notification) {
        if self.position(&notification.id).is_some() {
            self.update(notification);
            return;
        }
        if !notification.is_read {
            self.unread += 1;
        }
        self.items.insert(0, notification);
        while self.items.len() > self.max {
            if let Some(evicted) = self.items.pop() {
                if !evicted.is_read {
                    self.unread = self.unread.saturating_sub(1);
                }
            }
        }
    }

    /// Replace in place; unknown ids are ignored
    pub fn update(&mut self, notification: Notification) -> bool {
        let Some(index) = self.position(&notification.id) else {
            return false;
        };
        match (self.items[index].is_read, notification.is_read) {
            (false, true) => self.unread = self.unread.saturating_sub(1),
            (true, false) => self.unread += 1,
            _ => {}
        }
        self.items[index] = notification;
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Notification> {
        let removed = self.items.remove(self.position(id)?);
        if !removed.is_read {
            self.unread = self.unread.saturating_sub(1);
        }
        Some(removed)
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        if !self.items[index].is_read {
            self.items[index].is_read = true;
            self.unread = self.unread.saturating_sub(1);
        }
        true
    }

    pub fn mark_all_read(&mut self) -> usize {
        let changed = self.unread;
        for item in self.items.iter_mut() {
            item.is_read = true;
        }
        self.unread = 0;
        changed
    }

    /// Swap in a freshly fetched list
    pub fn replace_all(&mut self, mut items: Vec<Notification>) {
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(self.max);
        self.unread = items.iter().filter(|n| !n.is_read).count();
        self.items = items;
    }

    /// Fold one change on the notifications table
    pub fn apply(&mut self, change: &ChangeEvent) -> AppResult<()> {
        match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let record = change
                    .after
                    .as_ref()
                    .ok_or_else(|| AppError::Decode("notification change without a row".to_string()))?;
                let notification = Notification::from_record(record)?;
                if change.kind == ChangeKind::Insert {
                    self.insert(notification);
                } else {
                    self.update(notification);
                }
            }
            ChangeKind::Delete => {
                if let Some(id) = change.record_id() {
                    self.remove(&id);
                }
            }
        }
        Ok(())
    }
}

pub struct NotificationCenter {
    user_id: String,
    list: Arc<Mutex<NotificationList>>,
    unread: Arc<watch::Sender<usize>>,
    data: DataAccess,
    backend: Option<Arc<dyn NotificationBackend>>,
    subscription: Mutex<Option<Subscription>>,
}

impl NotificationCenter {
    pub fn new(
        user_id: impl Into<String>,
        max_entries: usize,
        data: DataAccess,
        backend: Option<Arc<dyn NotificationBackend>>,
    ) -> Self {
        let (unread, _) = watch::channel(0);
        Self {
            user_id: user_id.into(),
            list: Arc::new(Mutex::new(NotificationList::new(max_entries))),
            unread: Arc::new(unread),
            data,
            backend,
            subscription: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor::table("notifications").filter(format!("user_id=eq.{}", self.user_id))
    }

    fn cache_key(&self) -> String {
        format!("notifications:{}", self.user_id)
    }

    /// Subscribe to live changes. Calling it again keeps the existing feed.
    pub fn start(&self, manager: &Arc<SubscriptionManager>) {
        let mut current = lock(&self.subscription);
        if current.is_some() {
            return;
        }

        let list = self.list.clone();
        let unread = self.unread.clone();
        let handler = Arc::new(move |event: &RealtimeEvent| {
            let RealtimeEvent::Change(change) = event else {
                return;
            };
            let count = {
                let mut list = lock(&list);
                if let Err(e) = list.apply(change) {
                    tracing::warn!("Ignoring notification change: {}", e);
                    return;
                }
                list.unread()
            };
            unread.send_replace(count);
        });

        *current = Some(manager.subscribe(&self.descriptor(), handler));
        tracing::info!("Notification stream started for user {}", self.user_id);
    }

    pub fn stop(&self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.disconnect();
        }
    }

    /// Fetch the current list from the backend and replace the local one
    pub async fn load(&self) -> AppResult<()> {
        let Some(backend) = self.backend.clone() else {
            return Ok(());
        };
        let user_id = self.user_id.clone();
        let limit = lock(&self.list).max;

        let items: Vec<Notification> = self
            .data
            .get_data(
                &self.cache_key(),
                move || async move {
                    backend
                        .fetch_notifications(&user_id, limit)
                        .await
                        .map_err(|e| e.message().to_string())
                },
                FetchOptions::uncached(),
            )
            .await?;

        let count = {
            let mut list = lock(&self.list);
            list.replace_all(items);
            list.unread()
        };
        self.unread.send_replace(count);
        Ok(())
    }

    pub fn list(&self) -> Vec<Notification> {
        lock(&self.list).items().to_vec()
    }

    pub fn snapshot(&self) -> NotificationList {
        lock(&self.list).clone()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.list).unread()
    }

    pub fn watch_unread(&self) -> watch::Receiver<usize> {
        self.unread.subscribe()
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        lock(&self.subscription).as_ref().map(Subscription::status)
    }

    fn publish(&self) {
        let count = lock(&self.list).unread();
        self.unread.send_replace(count);
    }

    /// Run a backend write; without a backend only the local list changes
    async fn write<F, Fut>(&self, id: &str, op: F) -> AppResult<()>
    where
        F: FnOnce(Arc<dyn NotificationBackend>) -> Fut,
        Fut: std::future::Future<Output = AppResult<()>>,
    {
        let Some(backend) = self.backend.clone() else {
            return Ok(());
        };
        self.data
            .save_data(
                &self.cache_key(),
                id,
                |_| async move { op(backend).await.map_err(|e| e.message().to_string()) },
                SaveOptions::default(),
            )
            .await
    }

    pub async fn mark_as_read(&self, id: &str) -> AppResult<()> {
        if !lock(&self.list).items().iter().any(|n| n.id == id) {
            return Err(AppError::NotFound(format!("notification {}", id)));
        }
        let target = id.to_string();
        self.write(id, |backend| async move { backend.mark_read(&target).await })
            .await?;
        lock(&self.list).mark_read(id);
        self.publish();
        Ok(())
    }

    pub async fn mark_all_as_read(&self) -> AppResult<usize> {
        let user_id = self.user_id.clone();
        self.write("all", |backend| async move { backend.mark_all_read(&user_id).await })
            .await?;
        let changed = lock(&self.list).mark_all_read();
        self.publish();
        Ok(changed)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        if !lock(&self.list).items().iter().any(|n| n.id == id) {
            return Err(AppError::NotFound(format!("notification {}", id)));
        }
        let target = id.to_string();
        self.write(id, |backend| async move { backend.delete_notification(&target).await })
            .await?;
        lock(&self.list).remove(id);
        self.publish();
        Ok(())
    }
}
