//! Integration tests running the synchronization core against the
//! in-process realtime provider

mod api;
mod data;
mod streams;
mod subscriptions;

use std::sync::Arc;

use elidune_sync::{
    config::{SessionConfig, SyncConfig},
    realtime::memory::MemoryProvider,
    repository::Repository,
    services::{drafts::MemoryDraftStore, Backends, Services},
};

/// Services wired on fresh stores and an auto-acknowledging provider
pub fn services(backends: Backends, session: SessionConfig) -> (Arc<Services>, MemoryProvider) {
    let provider = MemoryProvider::new().with_auto_subscribe();
    let services = Services::new(
        Repository::new(),
        Arc::new(provider.clone()),
        Arc::new(MemoryDraftStore::new()),
        backends,
        &SyncConfig::default(),
        &session,
    );
    (Arc::new(services), provider)
}

pub fn signed_in(user_id: &str) -> SessionConfig {
    SessionConfig {
        user_id: user_id.to_string(),
        display_name: "Ada".to_string(),
        ..SessionConfig::default()
    }
}
