//! Shared feeds and reconnection

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use elidune_sync::{
    models::{ChangeEvent, ConnectionState, RealtimeEvent, ResourceDescriptor},
    realtime::{memory::MemoryProvider, ChannelStatus},
    repository::ChannelRegistry,
    services::{
        connection::ReconnectPolicy,
        subscriptions::{ChangeHandler, SubscriptionManager},
    },
};

fn counting() -> (ChangeHandler, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handler: ChangeHandler = Arc::new(move |_: &RealtimeEvent| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handler, count)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_two_components_share_one_channel() {
    let provider = MemoryProvider::new().with_auto_subscribe();
    let registry = Arc::new(ChannelRegistry::new());
    let manager = SubscriptionManager::new(
        Arc::new(provider.clone()),
        registry.clone(),
        ReconnectPolicy::default(),
    );
    let descriptor = ResourceDescriptor::table("books").filter("dashboard_stats");

    let (first_handler, first) = counting();
    let (second_handler, second) = counting();
    let a = manager.subscribe(&descriptor, first_handler);
    let b = manager.subscribe(&descriptor, second_handler);
    assert_eq!(provider.channel_calls(), 1);
    assert_eq!(registry.len(), 1);

    provider.emit(a.key().as_str(), ChangeEvent::insert("books", json!({"id": 1})));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    a.disconnect();
    assert!(registry.contains(b.key()));
    assert!(b.is_connected());

    b.disconnect();
    assert!(registry.is_empty());
    assert!(provider.active_channels().is_empty());
    assert_eq!(manager.feed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_back_off_then_manual_reconnect_recovers() {
    let provider = MemoryProvider::new();
    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(250),
        max_attempts: 3,
        ..ReconnectPolicy::default()
    };
    let manager = SubscriptionManager::new(
        Arc::new(provider.clone()),
        Arc::new(ChannelRegistry::new()),
        policy.clone(),
    );
    let (handler, _) = counting();
    let subscription = manager.subscribe(&ResourceDescriptor::table("borrowings"), handler);
    let key = subscription.key().clone();

    let mut delays = Vec::new();
    for _ in 0..3 {
        provider.emit_status(key.as_str(), ChannelStatus::ChannelError("socket reset".into()));
        assert_eq!(subscription.state(), ConnectionState::Error);
        let delay = subscription
            .connection()
            .pending_reconnect()
            .expect("retry scheduled");
        delays.push(delay);
        tokio::time::advance(delay).await;
        settle().await;
        assert_eq!(subscription.state(), ConnectionState::Connecting);
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(250)
        ]
    );

    provider.emit_status(key.as_str(), ChannelStatus::TimedOut);
    assert_eq!(subscription.state(), ConnectionState::Error);
    assert!(subscription.connection().pending_reconnect().is_none());
    assert!(subscription.error().is_some());

    subscription.reconnect();
    tokio::time::advance(policy.manual_delay).await;
    settle().await;
    provider.emit_status(key.as_str(), ChannelStatus::Subscribed);
    assert!(subscription.is_connected());
    assert_eq!(subscription.error(), None);
}

#[tokio::test]
async fn test_second_component_after_channel_error_leaks_nothing() {
    let provider = MemoryProvider::new();
    let registry = Arc::new(ChannelRegistry::new());
    let manager = SubscriptionManager::new(
        Arc::new(provider.clone()),
        registry.clone(),
        ReconnectPolicy::default(),
    );
    let descriptor = ResourceDescriptor::table("books").filter("dashboard_stats");

    let (handler, _) = counting();
    let a = manager.subscribe(&descriptor, handler.clone());
    provider.emit_status(a.key().as_str(), ChannelStatus::ChannelError("socket reset".into()));
    assert_eq!(a.state(), ConnectionState::Error);

    let b = manager.subscribe(&descriptor, handler);
    assert_ne!(b.state(), ConnectionState::Connected);
    assert_eq!(registry.len(), 1);

    drop(a);
    drop(b);
    assert!(registry.is_empty());
    assert!(provider.active_channels().is_empty());
    assert_eq!(manager.feed_count(), 0);
}
