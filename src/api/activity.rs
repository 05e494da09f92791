//! Activity feed endpoints

use axum::{extract::State, http::StatusCode, Json};

use crate::{models::ActivityEntry, AppState};

pub async fn list_activity(State(state): State<AppState>) -> Json<Vec<ActivityEntry>> {
    Json(state.services.activity.list())
}

pub async fn clear_activity(State(state): State<AppState>) -> StatusCode {
    state.services.activity.clear();
    StatusCode::NO_CONTENT
}
