//! Engine configuration.
//!
//! All knobs are plain values so the surrounding application can load them
//! from any source. Every section has working defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::transport::{Credentials, Endpoint, ReconnectPolicy};

/// Top-level configuration for the notification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the REST API (e.g. `http://localhost:8080/api`).
    pub api_base_url: String,
    /// WebSocket URL of the STOMP endpoint (e.g. `ws://localhost:8080/ws`).
    pub endpoint: String,
    /// User identity sent in the CONNECT frame.
    pub user_id: String,
    /// Bearer token for both REST and the persistent channel.
    pub token: Option<String>,
    /// Delivery mode settings.
    pub realtime: RealtimeConfig,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Requested heart-beat interval in milliseconds (0 disables).
    pub heartbeat_ms: u64,
    /// Timeout applied to REST requests and the STOMP handshake.
    pub request_timeout_secs: u64,
    /// Channel destinations.
    pub destinations: Destinations,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            endpoint: "ws://localhost:8080/ws".to_string(),
            user_id: String::new(),
            token: None,
            realtime: RealtimeConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat_ms: 10_000,
            request_timeout_secs: 30,
            destinations: Destinations::default(),
        }
    }
}

/// Push/poll delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Master switch; when false the scheduler stays idle.
    pub enabled: bool,
    /// Prefer the persistent channel over polling.
    pub use_push: bool,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Force a list fetch after this many count-only poll ticks.
    pub full_refresh_every: u32,
    /// Page size for list fetches.
    pub page_size: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_push: true,
            poll_interval_ms: 30_000,
            full_refresh_every: 10,
            page_size: 50,
        }
    }
}

/// Reconnection backoff settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Channel destinations used by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Destinations {
    /// Private per-user destinations.
    pub user: Vec<String>,
    /// Shared broadcast destination.
    pub broadcast: String,
    /// Prefix for application destinations (`{prefix}/markRead`, ...).
    pub app_prefix: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            user: vec![
                "/user/queue/notifications".to_string(),
                "/user/queue/notification-count".to_string(),
                "/user/queue/notification/response".to_string(),
            ],
            broadcast: "/topic/notifications".to_string(),
            app_prefix: "/app/notification".to_string(),
        }
    }
}

impl Destinations {
    /// Every destination to subscribe to after connecting.
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.user
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.broadcast.as_str()))
    }

    pub fn is_broadcast(&self, destination: &str) -> bool {
        destination == self.broadcast
    }
}

/// Configuration accepted by [`UpdateScheduler::enable`](crate::scheduler::UpdateScheduler::enable).
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub use_push: bool,
    pub poll_interval: Duration,
    pub endpoint: Endpoint,
}

/// Partial update for [`UpdateScheduler::update_config`](crate::scheduler::UpdateScheduler::update_config).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerConfigUpdate {
    pub use_push: Option<bool>,
    pub poll_interval: Option<Duration>,
    pub endpoint: Option<Endpoint>,
}

impl SchedulerConfig {
    /// Merge a partial update into a new configuration.
    pub fn merged(&self, update: SchedulerConfigUpdate) -> Self {
        Self {
            use_push: update.use_push.unwrap_or(self.use_push),
            poll_interval: update.poll_interval.unwrap_or(self.poll_interval),
            endpoint: update.endpoint.unwrap_or_else(|| self.endpoint.clone()),
        }
    }
}

impl SyncConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(SyncError::config("api_base_url must not be empty"));
        }
        url::Url::parse(&self.api_base_url)
            .map_err(|e| SyncError::config(format!("invalid api_base_url: {e}")))?;
        let endpoint = url::Url::parse(&self.endpoint)
            .map_err(|e| SyncError::config(format!("invalid endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(SyncError::config(format!(
                "endpoint must use ws:// or wss://, got {}://",
                endpoint.scheme()
            )));
        }
        if self.realtime.poll_interval_ms == 0 {
            return Err(SyncError::config("realtime.poll_interval_ms must be > 0"));
        }
        if self.realtime.page_size == 0 {
            return Err(SyncError::config("realtime.page_size must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::config("request_timeout_secs must be > 0"));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(SyncError::config("reconnect.base_delay_ms must be > 0"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(SyncError::config(
                "reconnect.max_delay_ms must be >= reconnect.base_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user_id: self.user_id.clone(),
            token: self.token.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            use_push: self.realtime.use_push,
            poll_interval: Duration::from_millis(self.realtime.poll_interval_ms),
            endpoint: Endpoint {
                url: self.endpoint.clone(),
                credentials: self.credentials(),
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.realtime.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = SyncConfig::default();
        config.reconnect.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.endpoint = "http://localhost/ws".to_string();
        assert!(config.validate().is_err());

        let config = SyncConfig {
            request_timeout_secs: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"user_id":"42","realtime":{"use_push":false},"reconnect":{"max_attempts":3}}"#,
        )
        .unwrap();
        assert_eq!(config.user_id, "42");
        assert!(!config.realtime.use_push);
        assert_eq!(config.realtime.poll_interval_ms, 30_000);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
    }

    #[test]
    fn test_subscriptions_include_broadcast() {
        let destinations = Destinations::default();
        let subs: Vec<_> = destinations.subscriptions().collect();
        assert_eq!(subs.len(), 4);
        assert_eq!(subs.last(), Some(&"/topic/notifications"));
        assert!(destinations.is_broadcast("/topic/notifications"));
    }

    #[test]
    fn test_scheduler_config_merge() {
        let base = SyncConfig::default().scheduler_config();
        let merged = base.merged(SchedulerConfigUpdate {
            use_push: Some(false),
            ..Default::default()
        });
        assert!(!merged.use_push);
        assert_eq!(merged.poll_interval, base.poll_interval);
        assert_eq!(merged.endpoint, base.endpoint);
    }
}
