use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use worlty_rpc::{AuthOptions, ConnectOptions};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load config from file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        super::validation::warn_unknown_fields(&content, "config.json");
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Where the gateway lives and how to authenticate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub access_token: String,
}

impl GatewayConfig {
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("gateway host is not set".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("gateway port is not set".to_string()));
        }
        if self.access_token.is_empty() {
            return Err(Error::Config("gateway access token is not set".to_string()));
        }
        Ok(())
    }
}

/// Session timings. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_auth_read_timeout")]
    pub auth_read_timeout_ms: u64,

    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_challenge_delay")]
    pub challenge_delay_ms: u64,

    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    #[serde(default = "default_refresh_delay")]
    pub refresh_delay_ms: u64,

    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,

    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,

    #[serde(default = "default_reconnect_pause")]
    pub reconnect_pause_ms: u64,

    #[serde(default = "default_reauth_initial_delay")]
    pub reauth_initial_delay_ms: u64,

    #[serde(default = "default_reauth_max_delay")]
    pub reauth_max_delay_ms: u64,

    #[serde(default = "default_setup_attempts")]
    pub setup_attempts: u32,

    #[serde(default = "default_setup_retry_delay")]
    pub setup_retry_delay_ms: u64,

    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_connect_timeout() -> u64 {
    5_000
}
fn default_auth_read_timeout() -> u64 {
    5_000
}
fn default_poll_timeout() -> u64 {
    3_000
}
fn default_challenge_delay() -> u64 {
    500
}
fn default_publish_timeout() -> u64 {
    5_000
}
fn default_debounce() -> u64 {
    50
}
fn default_refresh_delay() -> u64 {
    1_000
}
fn default_health_interval() -> u64 {
    1_000
}
fn default_stale_after() -> u64 {
    120_000
}
fn default_reconnect_pause() -> u64 {
    1_000
}
fn default_reauth_initial_delay() -> u64 {
    1_000
}
fn default_reauth_max_delay() -> u64 {
    20_000
}
fn default_setup_attempts() -> u32 {
    10
}
fn default_setup_retry_delay() -> u64 {
    5_000
}
fn default_read_chunk_size() -> usize {
    worlty_rpc::DEFAULT_READ_CHUNK
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            auth_read_timeout_ms: default_auth_read_timeout(),
            poll_timeout_ms: default_poll_timeout(),
            challenge_delay_ms: default_challenge_delay(),
            publish_timeout_ms: default_publish_timeout(),
            debounce_ms: default_debounce(),
            refresh_delay_ms: default_refresh_delay(),
            health_interval_ms: default_health_interval(),
            stale_after_ms: default_stale_after(),
            reconnect_pause_ms: default_reconnect_pause(),
            reauth_initial_delay_ms: default_reauth_initial_delay(),
            reauth_max_delay_ms: default_reauth_max_delay(),
            setup_attempts: default_setup_attempts(),
            setup_retry_delay_ms: default_setup_retry_delay(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    #[must_use]
    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.reconnect_pause_ms)
    }

    #[must_use]
    pub fn setup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.setup_retry_delay_ms)
    }

    /// Reauthentication delay before attempt `attempt` (1-based).
    ///
    /// Doubles from the initial delay and stays at the maximum once reached.
    #[must_use]
    pub fn reauth_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reauth_initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reauth_max_delay_ms);
        Duration::from_millis(delay)
    }

    #[must_use]
    pub fn auth_options(&self) -> AuthOptions {
        AuthOptions {
            connect: ConnectOptions {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                publish_timeout: Duration::from_millis(self.publish_timeout_ms),
                read_chunk_size: self.read_chunk_size,
            },
            read_timeout: Duration::from_millis(self.auth_read_timeout_ms),
            challenge_delay: Duration::from_millis(self.challenge_delay_ms),
        }
    }
}
