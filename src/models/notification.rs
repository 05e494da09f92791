//! Notification model (overdue reminders, reservations, staff messages)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppResult;

/// Notification row as stored in the `notifications` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(deserialize_with = "super::string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "super::optional_string_or_number")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    /// Category (`info`, `overdue`, `reservation`, ...)
    #[serde(default = "default_kind", alias = "type")]
    pub kind: String,
    #[serde(default)]
    pub is_read: bool,
    /// Target page in the admin application
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_kind() -> String {
    "info".to_string()
}

impl Notification {
    pub fn from_record(record: &Value) -> AppResult<Self> {
        Ok(Notification::deserialize(record)?)
    }
}
