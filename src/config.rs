//! Configuration management for the Elidune synchronization layer

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::connection::ReconnectPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RealtimeConfig {
    /// Base URL of the realtime service; empty runs the in-process provider
    pub url: String,
    pub api_key: String,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Lifetime of an unsaved form draft
    pub draft_ttl_secs: u64,
}

/// Identity of the signed-in staff member
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Empty disables the notification and presence streams
    pub user_id: String,
    pub display_name: String,
    pub presence_room: String,
}

impl SessionConfig {
    pub fn is_signed_in(&self) -> bool {
        !self.user_id.trim().is_empty()
    }
}

/// Tuning of caches, reconnect backoff and derived streams
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    pub cache_ttl_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub manual_reconnect_delay_ms: u64,
    pub stats_debounce_ms: u64,
    pub activity_max_entries: usize,
    pub notification_max_entries: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            // Start with default configuration
            .add_source(File::with_name("config/default").required(false))
            // Layer on the environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add environment variables (with prefix ELIDUNE_)
            .add_source(
                Environment::with_prefix("ELIDUNE")
                    .separator("_")
                    .try_parsing(true),
            )
            .set_override_option("realtime.url", env::var("REALTIME_URL").ok())?
            .set_override_option("realtime.api_key", env::var("REALTIME_API_KEY").ok())?
            .set_override_option("redis.url", env::var("REDIS_URL").ok())?
            .set_override_option("session.user_id", env::var("SESSION_USER_ID").ok())?
            .build()?;

        config.try_deserialize()
    }
}

impl SyncConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn stats_debounce(&self) -> Duration {
        Duration::from_millis(self.stats_debounce_ms)
    }

    /// Backoff policy for channels created with auto-reconnect enabled
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            auto_reconnect: true,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
            manual_delay: Duration::from_millis(self.manual_reconnect_delay_ms),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            draft_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            display_name: String::new(),
            presence_room: "admin".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 5 * 60,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            manual_reconnect_delay_ms: 1_000,
            stats_debounce_ms: 1_000,
            activity_max_entries: 50,
            notification_max_entries: 100,
        }
    }
}
