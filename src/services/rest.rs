//! REST (PostgREST) backend for notifications and dashboard counts

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Method, RequestBuilder, Response};
use serde_json::json;

use super::{notifications::NotificationBackend, stats::StatsSource};
use crate::{
    config::RealtimeConfig,
    error::{AppError, AppResult},
    models::{DashboardStats, Notification},
};

#[derive(Clone, Debug)]
pub struct RestClient {
    base_url: String,
    http: reqwest::Client,
}

impl RestClient {
    /// Client for the REST endpoint served next to the realtime service
    pub fn new(config: &RealtimeConfig) -> AppResult<Self> {
        let url = config.url.trim().trim_end_matches('/');
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::BadRequest(format!(
                "REST backend needs an http(s) url, got '{}'",
                url
            )));
        }
        Self::from_url(&format!("{}/rest/v1", url), &config.api_key)
    }

    pub fn from_url(base_url: &str, api_key: &str) -> AppResult<Self> {
        let invalid = |e: header::InvalidHeaderValue| AppError::BadRequest(format!("invalid api key: {}", e));

        let mut headers = header::HeaderMap::new();
        headers.insert("apikey", api_key.parse().map_err(invalid)?);
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", api_key).parse().map_err(invalid)?,
        );
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        tracing::debug!("{} {}", method, url);
        self.http.request(method, url)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> AppResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| AppError::Fetch(format!("{}: {}", what, e)))?;
        response
            .error_for_status()
            .map_err(|e| AppError::Fetch(format!("{}: {}", what, e)))
    }

    /// Exact row count of `table` matching the `query` filters
    pub async fn count(&self, table: &str, query: &[(&str, String)]) -> AppResult<u64> {
        let request = self
            .request(Method::GET, table)
            .query(&[("select", "id")])
            .query(query)
            .header("Prefer", "count=exact")
            .header(header::RANGE, "0-0");
        let response = self.send(request, &format!("count {}", table)).await?;

        let range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Decode(format!("no content-range when counting {}", table)))?;
        parse_total(range)
    }
}

/// Total from a `Content-Range` value such as `0-0/42` or `*/0`
fn parse_total(range: &str) -> AppResult<u64> {
    range
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
        .ok_or_else(|| AppError::Decode(format!("unexpected content-range '{}'", range)))
}

#[async_trait]
impl NotificationBackend for RestClient {
    async fn fetch_notifications(&self, user_id: &str, limit: usize) -> AppResult<Vec<Notification>> {
        let request = self.request(Method::GET, "notifications").query(&[
            ("user_id", format!("eq.{}", user_id)),
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ]);
        let response = self.send(request, "fetch notifications").await?;
        response
            .json::<Vec<Notification>>()
            .await
            .map_err(|e| AppError::Decode(format!("notifications: {}", e)))
    }

    async fn mark_read(&self, id: &str) -> AppResult<()> {
        let request = self
            .request(Method::PATCH, "notifications")
            .query(&[("id", format!("eq.{}", id))])
            .json(&json!({"is_read": true}));
        self.send(request, "mark notification read").await?;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &str) -> AppResult<()> {
        let request = self
            .request(Method::PATCH, "notifications")
            .query(&[
                ("user_id", format!("eq.{}", user_id)),
                ("is_read", "eq.false".to_string()),
            ])
            .json(&json!({"is_read": true}));
        self.send(request, "mark notifications read").await?;
        Ok(())
    }

    async fn delete_notification(&self, id: &str) -> AppResult<()> {
        let request = self
            .request(Method::DELETE, "notifications")
            .query(&[("id", format!("eq.{}", id))]);
        self.send(request, "delete notification").await?;
        Ok(())
    }
}

#[async_trait]
impl StatsSource for RestClient {
    async fn dashboard_stats(&self) -> AppResult<DashboardStats> {
        let now = Utc::now().to_rfc3339();
        let active = [("returned_at", "is.null".to_string())];
        let overdue = [
            ("returned_at", "is.null".to_string()),
            ("due_date", format!("lt.{}", now)),
        ];

        let (total_books, active_borrowings, overdue_borrowings, total_users) = tokio::try_join!(
            self.count("books", &[]),
            self.count("borrowings", &active),
            self.count("borrowings", &overdue),
            self.count("users", &[]),
        )?;

        Ok(DashboardStats {
            total_books,
            active_borrowings,
            overdue_borrowings,
            total_users,
            refreshed_at: Some(Utc::now()),
        })
    }
}
