//! Dashboard statistics endpoint

use axum::{extract::State, Json};

use crate::{
    error::{AppError, AppResult, DataResponse},
    models::DashboardStats,
    AppState,
};

/// Returns the `{data, error}` envelope so the dashboard can show the error
/// next to the last known figures
pub async fn dashboard_stats(State(state): State<AppState>) -> AppResult<Json<DataResponse<DashboardStats>>> {
    let stats = state
        .services
        .stats
        .as_ref()
        .ok_or_else(|| AppError::NotFound("no statistics source configured".to_string()))?;

    let response = match stats.refresh().await {
        Ok(current) => DataResponse::from(Ok(current)),
        Err(e) => DataResponse {
            data: stats.current(),
            error: Some(e.message().to_string()),
        },
    };
    Ok(Json(response))
}
