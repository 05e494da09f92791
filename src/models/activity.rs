//! Activity feed entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::change::{ChangeEvent, ChangeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    BookAdded,
    BookBorrowed,
    BookReturned,
    MemberRegistered,
    Other,
}

/// Human readable line of the activity feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub resource: String,
    pub record_id: Option<String>,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

fn text<'a>(row: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .find_map(|f| row.get(*f).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

impl ActivityEntry {
    /// Map an insert-like change to a feed entry.
    ///
    /// Inserts on any resource qualify; on `borrowings`, an update that sets
    /// `returned_at` is reported as a return. Other changes yield `None`.
    pub fn from_change(event: &ChangeEvent) -> Option<Self> {
        let row = event.after.as_ref()?;
        let resource = event.resource.as_str();

        let (kind, description) = match (event.kind, resource) {
            (ChangeKind::Insert, "books") => (
                ActivityKind::BookAdded,
                match text(row, &["title"]) {
                    Some(title) => format!("New book added: {}", title),
                    None => "New book added".to_string(),
                },
            ),
            (ChangeKind::Insert, "borrowings") => (
                ActivityKind::BookBorrowed,
                match text(row, &["book_title", "title"]) {
                    Some(title) => format!("Book borrowed: {}", title),
                    None => "Book borrowed".to_string(),
                },
            ),
            (ChangeKind::Insert, "users") => (
                ActivityKind::MemberRegistered,
                match text(row, &["full_name", "name", "email"]) {
                    Some(name) => format!("New member registered: {}", name),
                    None => "New member registered".to_string(),
                },
            ),
            (ChangeKind::Update, "borrowings") => {
                let returned_now = !row.get("returned_at").map_or(true, Value::is_null);
                let returned_before = event
                    .before
                    .as_ref()
                    .and_then(|b| b.get("returned_at"))
                    .map_or(false, |v| !v.is_null());
                if !returned_now || returned_before {
                    return None;
                }
                (
                    ActivityKind::BookReturned,
                    match text(row, &["book_title", "title"]) {
                        Some(title) => format!("Book returned: {}", title),
                        None => "Book returned".to_string(),
                    },
                )
            }
            (ChangeKind::Insert, other) => {
                (ActivityKind::Other, format!("New {} record", other.trim_end_matches('s')))
            }
            _ => return None,
        };

        Some(Self {
            id: Uuid::new_v4(),
            kind,
            resource: resource.to_string(),
            record_id: event.record_id(),
            description,
            occurred_at: event.committed_at.unwrap_or_else(Utc::now),
        })
    }
}
