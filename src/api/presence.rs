//! Presence roster endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::{models::PresenceEntry, AppState};

#[derive(Serialize)]
pub struct OnlineResponse {
    pub user_id: String,
    pub online: bool,
}

pub async fn roster(State(state): State<AppState>) -> Json<Vec<PresenceEntry>> {
    let entries = state
        .services
        .presence
        .as_ref()
        .map(|presence| presence.roster())
        .unwrap_or_default();
    Json(entries)
}

pub async fn is_online(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<OnlineResponse> {
    let online = state
        .services
        .presence
        .as_ref()
        .map_or(false, |presence| presence.is_online(&user_id));
    Json(OnlineResponse { user_id, online })
}
