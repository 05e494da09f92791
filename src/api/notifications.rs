//! Notification endpoints for the signed-in staff member

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::{
    error::{AppError, AppResult},
    models::Notification,
    services::notifications::NotificationCenter,
    AppState,
};

#[derive(Serialize)]
pub struct NotificationsResponse {
    pub items: Vec<Notification>,
    pub unread_count: usize,
}

#[derive(Serialize)]
pub struct MarkAllResponse {
    pub updated: usize,
}

fn center(state: &AppState) -> AppResult<Arc<NotificationCenter>> {
    state
        .services
        .notifications
        .clone()
        .ok_or_else(|| AppError::NotFound("no session configured for notifications".to_string()))
}

pub async fn list_notifications(State(state): State<AppState>) -> AppResult<Json<NotificationsResponse>> {
    let snapshot = center(&state)?.snapshot();
    Ok(Json(NotificationsResponse {
        unread_count: snapshot.unread(),
        items: snapshot.items().to_vec(),
    }))
}

pub async fn mark_as_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    center(&state)?.mark_as_read(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_as_read(State(state): State<AppState>) -> AppResult<Json<MarkAllResponse>> {
    let updated = center(&state)?.mark_all_as_read().await?;
    Ok(Json(MarkAllResponse { updated }))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    center(&state)?.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
