//! Connectivity of the live feeds

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{services::subscriptions::FeedStatus, AppState};

#[derive(Serialize)]
pub struct SyncStatusResponse {
    pub connected: usize,
    pub total: usize,
    pub cached_entries: usize,
    pub pending_requests: usize,
    pub feeds: Vec<FeedStatus>,
}

pub async fn sync_status(State(state): State<AppState>) -> Json<SyncStatusResponse> {
    let services = &state.services;
    let feeds = services.subscriptions.status_report();

    Json(SyncStatusResponse {
        connected: feeds.iter().filter(|f| f.status.is_connected()).count(),
        total: feeds.len(),
        cached_entries: services.repository.cache.len(),
        pending_requests: services.repository.pending.len(),
        feeds,
    })
}
