//! Conference client configuration.
//!
//! Configuration is loaded from environment variables. The API token is
//! redacted in Debug output.

use crate::quality::BackoffConfig;
use crate::registry::RegistryConfig;
use crate::room::RoomConfig;
use crate::signaling::SignalingConfig;
use crate::turn::TurnCacheConfig;
use common::config::{ObservabilityConfig, DEFAULT_LOG_LEVEL};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default heartbeat ping interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Default time to wait for a heartbeat echo before declaring the link dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

/// Default statistics polling interval.
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 2_000;

/// Default delay before rejoining after `join_blocked`.
pub const DEFAULT_REJOIN_DELAY_MS: u64 = 5_000;

/// Default number of resume attempts after an abnormal disconnect.
pub const DEFAULT_MAX_REJOIN_ATTEMPTS: u32 = 5;

/// Default top simulcast layer bitrate.
pub const DEFAULT_MAX_PUBLISH_BITRATE_BPS: u32 = 1_200_000;

/// Default TURN refresh safety buffer.
pub const DEFAULT_TURN_REFRESH_BUFFER_SECS: u64 = 30;

/// Default HTTP request timeout for the room API.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Conference client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Room API base URL (e.g. `https://conference.example.com`).
    pub api_url: String,

    /// Signaling WebSocket URL (e.g. `wss://conference.example.com/signaling`).
    pub signaling_url: String,

    /// Room to join.
    pub room_id: String,

    /// Join through the invitation endpoint (`start_invited`).
    pub invited: bool,

    /// Optional bearer token for the room API.
    pub api_token: Option<SecretString>,

    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub stats_interval: Duration,
    pub rejoin_delay: Duration,
    pub max_rejoin_attempts: u32,
    pub max_publish_bitrate_bps: u32,
    pub turn_refresh_buffer: Duration,
    pub http_timeout: Duration,

    pub observability: ObservabilityConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field("signaling_url", &self.signaling_url)
            .field("room_id", &self.room_id)
            .field("invited", &self.invited)
            .field(
                "api_token",
                &self.api_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("stats_interval", &self.stats_interval)
            .field("rejoin_delay", &self.rejoin_delay)
            .field("max_rejoin_attempts", &self.max_rejoin_attempts)
            .field("max_publish_bitrate_bps", &self.max_publish_bitrate_bps)
            .field("turn_refresh_buffer", &self.turn_refresh_buffer)
            .field("http_timeout", &self.http_timeout)
            .field("observability", &self.observability)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let api_url = required(vars, "CONFERENCE_API_URL")?;
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(format!(
                "CONFERENCE_API_URL must be an http(s) URL, got {api_url}"
            )));
        }

        let signaling_url = required(vars, "CONFERENCE_SIGNALING_URL")?;
        if !(signaling_url.starts_with("ws://") || signaling_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "CONFERENCE_SIGNALING_URL must be a ws(s) URL, got {signaling_url}"
            )));
        }

        let room_id = required(vars, "CONFERENCE_ROOM_ID")?;

        let invited = vars
            .get("CONFERENCE_INVITED")
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        let api_token = vars
            .get("CONFERENCE_API_TOKEN")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let heartbeat_interval = millis(
            vars,
            "CONFERENCE_HEARTBEAT_INTERVAL_MS",
            DEFAULT_HEARTBEAT_INTERVAL_MS,
        );
        let heartbeat_timeout = millis(
            vars,
            "CONFERENCE_HEARTBEAT_TIMEOUT_MS",
            DEFAULT_HEARTBEAT_TIMEOUT_MS,
        );
        if heartbeat_timeout >= heartbeat_interval {
            return Err(ConfigError::InvalidValue(format!(
                "heartbeat timeout ({}ms) must be shorter than the interval ({}ms)",
                heartbeat_timeout.as_millis(),
                heartbeat_interval.as_millis()
            )));
        }

        let stats_interval = millis(vars, "CONFERENCE_STATS_INTERVAL_MS", DEFAULT_STATS_INTERVAL_MS);
        if stats_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "CONFERENCE_STATS_INTERVAL_MS must be positive".to_string(),
            ));
        }

        let rejoin_delay = millis(vars, "CONFERENCE_REJOIN_DELAY_MS", DEFAULT_REJOIN_DELAY_MS);

        let max_rejoin_attempts = vars
            .get("CONFERENCE_MAX_REJOIN_ATTEMPTS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_REJOIN_ATTEMPTS);

        let max_publish_bitrate_bps = vars
            .get("CONFERENCE_MAX_PUBLISH_BITRATE_BPS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_PUBLISH_BITRATE_BPS);

        let turn_refresh_buffer = Duration::from_secs(
            vars.get("CONFERENCE_TURN_REFRESH_BUFFER_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_TURN_REFRESH_BUFFER_SECS),
        );

        let http_timeout = millis(vars, "CONFERENCE_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS);

        let observability = ObservabilityConfig {
            log_level: vars
                .get("CONFERENCE_LOG_LEVEL")
                .cloned()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            json_logs: vars
                .get("CONFERENCE_JSON_LOGS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
        };

        Ok(Self {
            api_url,
            signaling_url,
            room_id,
            invited,
            api_token,
            heartbeat_interval,
            heartbeat_timeout,
            stats_interval,
            rejoin_delay,
            max_rejoin_attempts,
            max_publish_bitrate_bps,
            turn_refresh_buffer,
            http_timeout,
            observability,
        })
    }

    #[must_use]
    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            url: self.signaling_url.clone(),
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }

    #[must_use]
    pub fn turn_cache_config(&self) -> TurnCacheConfig {
        TurnCacheConfig {
            refresh_buffer: self.turn_refresh_buffer,
        }
    }

    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            stats_interval: self.stats_interval,
            max_publish_bitrate_bps: self.max_publish_bitrate_bps,
            publisher_backoff: BackoffConfig::publisher(),
            subscriber_backoff: BackoffConfig::subscriber(),
            ..RegistryConfig::default()
        }
    }

    #[must_use]
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            room_id: self.room_id.clone(),
            invited: self.invited,
            rejoin_delay: self.rejoin_delay,
            max_rejoin_attempts: self.max_rejoin_attempts,
            ..RoomConfig::default()
        }
    }
}

fn required(vars: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    vars.get(key)
        .filter(|s| !s.is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn millis(vars: &HashMap<String, String>, key: &str, default: u64) -> Duration {
    Duration::from_millis(
        vars.get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "CONFERENCE_API_URL".to_string(),
                "https://conf.example.com".to_string(),
            ),
            (
                "CONFERENCE_SIGNALING_URL".to_string(),
                "wss://conf.example.com/signaling".to_string(),
            ),
            ("CONFERENCE_ROOM_ID".to_string(), "standup".to_string()),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_vars(&base_vars()).unwrap();

        assert_eq!(config.room_id, "standup");
        assert!(!config.invited);
        assert!(config.api_token.is_none());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.stats_interval, Duration::from_secs(2));
        assert_eq!(config.rejoin_delay, Duration::from_secs(5));
        assert_eq!(config.max_rejoin_attempts, 5);
        assert_eq!(config.max_publish_bitrate_bps, 1_200_000);
        assert_eq!(config.turn_refresh_buffer, Duration::from_secs(30));
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let mut vars = base_vars();
        vars.insert("CONFERENCE_INVITED".to_string(), "true".to_string());
        vars.insert(
            "CONFERENCE_HEARTBEAT_INTERVAL_MS".to_string(),
            "2000".to_string(),
        );
        vars.insert(
            "CONFERENCE_HEARTBEAT_TIMEOUT_MS".to_string(),
            "500".to_string(),
        );
        vars.insert(
            "CONFERENCE_MAX_PUBLISH_BITRATE_BPS".to_string(),
            "900000".to_string(),
        );
        vars.insert("CONFERENCE_JSON_LOGS".to_string(), "true".to_string());

        let config = ClientConfig::from_vars(&vars).unwrap();
        assert!(config.invited);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(500));
        assert_eq!(config.max_publish_bitrate_bps, 900_000);
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_missing_required() {
        let mut vars = base_vars();
        vars.remove("CONFERENCE_ROOM_ID");
        let err = ClientConfig::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "CONFERENCE_ROOM_ID"));
    }

    #[test]
    fn test_rejects_non_websocket_signaling_url() {
        let mut vars = base_vars();
        vars.insert(
            "CONFERENCE_SIGNALING_URL".to_string(),
            "https://conf.example.com".to_string(),
        );
        assert!(matches!(
            ClientConfig::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_heartbeat_timeout_must_be_shorter_than_interval() {
        let mut vars = base_vars();
        vars.insert(
            "CONFERENCE_HEARTBEAT_TIMEOUT_MS".to_string(),
            "10000".to_string(),
        );
        assert!(matches!(
            ClientConfig::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_unparseable_number_falls_back_to_default() {
        let mut vars = base_vars();
        vars.insert(
            "CONFERENCE_STATS_INTERVAL_MS".to_string(),
            "often".to_string(),
        );
        let config = ClientConfig::from_vars(&vars).unwrap();
        assert_eq!(config.stats_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_debug_redacts_api_token() {
        let mut vars = base_vars();
        vars.insert(
            "CONFERENCE_API_TOKEN".to_string(),
            "very-secret-token".to_string(),
        );
        let config = ClientConfig::from_vars(&vars).unwrap();
        let debug_str = format!("{config:?}");
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("very-secret-token"));
    }

    #[test]
    fn test_component_configs_follow_client_config() {
        let config = ClientConfig::from_vars(&base_vars()).unwrap();
        let signaling = config.signaling_config();
        assert_eq!(signaling.url, "wss://conf.example.com/signaling");
        assert_eq!(signaling.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.registry_config().max_publish_bitrate_bps, 1_200_000);
        assert_eq!(config.room_config().room_id, "standup");
    }
}
