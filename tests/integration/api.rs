//! HTTP API served in-process

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use elidune_sync::{api::create_router, config::AppConfig, services::Services, AppState};

use super::{
    services, signed_in,
    streams::{backends, notification, FakeBackend},
};

fn router(services: &Arc<Services>) -> Router {
    create_router(AppState {
        config: Arc::new(AppConfig::default()),
        services: services.clone(),
    })
}

async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_health_and_sync_status() {
    let (services, _) = services(Default::default(), Default::default());
    services.start().await;
    let app = router(&services);

    let (status, body) = call(&app, Method::GET, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["feeds"], 3);

    let (status, body) = call(&app, Method::GET, "/api/v1/sync/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["connected"], 3);
    assert_eq!(body["feeds"][0]["consumers"], 1);
}

#[tokio::test]
async fn test_notification_routes() {
    let backend = Arc::new(FakeBackend::default());
    *backend.rows.lock().unwrap() = vec![notification("1", false, 0), notification("2", false, 1)];
    let (services, _) = services(backends(&backend), signed_in("u1"));
    services.start().await;
    let app = router(&services);

    let (status, body) = call(&app, Method::GET, "/api/v1/notifications").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unread_count"], 2);
    assert_eq!(body["items"][0]["id"], "2");

    let (status, _) = call(&app, Method::POST, "/api/v1/notifications/1/read").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app, Method::POST, "/api/v1/notifications/read-all").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 1);

    let (status, body) = call(&app, Method::DELETE, "/api/v1/notifications/9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NoSuchData");

    let (status, _) = call(&app, Method::DELETE, "/api/v1/notifications/2").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(backend.rows.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_routes_without_session_or_stats_source() {
    let (services, _) = services(Default::default(), Default::default());
    let app = router(&services);

    let (status, _) = call(&app, Method::GET, "/api/v1/notifications").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::GET, "/api/v1/stats/dashboard").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::GET, "/api/v1/presence/u1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["online"], false);

    let (status, body) = call(&app, Method::GET, "/api/v1/activity").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Array(Vec::new()));
}

#[tokio::test]
async fn test_dashboard_stats_envelope() {
    let backend = Arc::new(FakeBackend::default());
    let (services, _) = services(backends(&backend), Default::default());
    let app = router(&services);

    let (status, body) = call(&app, Method::GET, "/api/v1/stats/dashboard").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"], Value::Null);
    assert_eq!(body["data"]["total_books"], 101);
    assert_eq!(body["data"]["overdue_borrowings"], 3);
}
