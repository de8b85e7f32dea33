//! Provider configuration
//!
//! Loaded from TOML; every field has a default so a file only needs the
//! session identity:
//!
//! ```toml
//! url = "wss://collab.example.com"
//! project_id = "proj-1"
//! page_id = "home"
//! user_id = "u-42"
//! user_name = "Ada"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use trellis_core::{AwarenessConfig, UserIdentity};
use trellis_transport::{BackoffPolicy, ConnectionConfig, DispatcherConfig, RateLimitConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Server origin; the socket URL is `<url>/ws/<project_id>?token=..`
    pub url: String,
    pub project_id: String,
    pub page_id: String,
    pub user_id: String,
    pub user_name: String,
    pub email: Option<String>,

    pub connect_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter_ms: u64,
    /// `None` retries forever
    pub max_retries: Option<u32>,
    pub stable_after_ms: u64,

    pub request_timeout_ms: u64,
    pub queue_capacity: usize,
    pub requests_per_second: u32,
    pub burst_size: u32,

    pub presence_throttle_ms: u64,
    pub stale_after_ms: u64,
    pub prune_interval_ms: u64,
    /// Also pass presence sends through the request token bucket. Off by
    /// default: presence then relies only on the local emission throttle.
    pub rate_limit_presence: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".into(),
            project_id: String::new(),
            page_id: String::new(),
            user_id: String::new(),
            user_name: String::new(),
            email: None,
            connect_timeout_ms: 10_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_jitter_ms: 1_000,
            max_retries: Some(10),
            stable_after_ms: 5_000,
            request_timeout_ms: 10_000,
            queue_capacity: 1000,
            requests_per_second: 100,
            burst_size: 100,
            presence_throttle_ms: 100,
            stale_after_ms: 60_000,
            prune_interval_ms: 60_000,
            rate_limit_presence: false,
        }
    }
}

impl ProviderConfig {
    pub fn new(
        url: impl Into<String>,
        project_id: impl Into<String>,
        page_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            project_id: project_id.into(),
            page_id: page_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn identity(&self) -> UserIdentity {
        let user = UserIdentity::new(&self.user_id, &self.user_name);
        match &self.email {
            Some(email) => user.with_email(email),
            None => user,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(&self.url, &self.project_id);
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config.backoff = BackoffPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            max_jitter: Duration::from_millis(self.reconnect_jitter_ms),
        };
        config.max_retries = self.max_retries;
        config.stable_after = Duration::from_millis(self.stable_after_ms);
        config
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            queue_capacity: self.queue_capacity,
            rate_limit: RateLimitConfig::new(self.requests_per_second, self.burst_size),
        }
    }

    pub fn awareness_config(&self) -> AwarenessConfig {
        AwarenessConfig {
            throttle: Duration::from_millis(self.presence_throttle_ms),
            stale_after: Duration::from_millis(self.stale_after_ms),
        }
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms.max(1))
    }
}
