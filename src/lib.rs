//! Elidune live-data synchronization
//!
//! Client-side synchronization core of the Elidune library admin: a TTL
//! cache with coalesced fetches, realtime feeds shared per resource with
//! automatic reconnection, and the derived notification, activity, presence
//! and dashboard streams built on top of them.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod realtime;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
}
