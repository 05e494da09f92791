//! Dashboard counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Headline figures shown on the administration dashboard
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_books: u64,
    /// Borrowings not yet returned
    pub active_borrowings: u64,
    /// Active borrowings past their due date
    pub overdue_borrowings: u64,
    pub total_users: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
}
