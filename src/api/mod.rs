//! HTTP handlers exposing the synchronization state

pub mod activity;
pub mod health;
pub mod notifications;
pub mod presence;
pub mod stats;
pub mod sync;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::AppState;

/// Create the application router with all routes
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_v1 = Router::new()
        .route("/health", get(health::health_check))
        .route("/sync/status", get(sync::sync_status))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/read-all", post(notifications::mark_all_as_read))
        .route("/notifications/:id/read", post(notifications::mark_as_read))
        .route("/notifications/:id", delete(notifications::delete_notification))
        // Activity
        .route(
            "/activity",
            get(activity::list_activity).delete(activity::clear_activity),
        )
        // Presence
        .route("/presence", get(presence::roster))
        .route("/presence/:user_id", get(presence::is_online))
        // Statistics
        .route("/stats/dashboard", get(stats::dashboard_stats))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
}
