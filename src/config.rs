//! Configuration structures and loading

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// Monitoring cadence and limits
    #[serde(default)]
    pub monitoring: MonitoringConfiguration,

    /// Deployment executor settings
    #[serde(default)]
    pub deployments: DeploymentConfiguration,

    /// Update pipeline settings
    #[serde(default)]
    pub updates: UpdateConfiguration,

    /// Authentication settings
    #[serde(default)]
    pub auth: AuthConfiguration,

    /// Database location
    #[serde(default)]
    pub database: DatabaseConfiguration,

    /// Stack compose file storage
    #[serde(default)]
    pub stacks: StackConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        if let Some(parent) = config.database.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&config.stacks.directory)?;

        Ok(config)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            api: ApiConfiguration::default(),
            monitoring: MonitoringConfiguration::default(),
            deployments: DeploymentConfiguration::default(),
            updates: UpdateConfiguration::default(),
            auth: AuthConfiguration::default(),
            database: DatabaseConfiguration::default(),
            stacks: StackConfiguration::default(),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// SSL configuration
    #[serde(default)]
    pub ssl: SslConfiguration,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            ssl: SslConfiguration::default(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8765
}

/// SSL configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfiguration {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub cert: String,

    #[serde(default)]
    pub key: String,
}

/// Monitoring cadence and limits
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfiguration {
    /// Seconds between container list reconciles per host
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds between Docker pings per host
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Cap for the exponential reconnect backoff
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_max_backoff_secs: u64,

    /// Seconds between metric samples fed to the alert engine
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Per-client outbound WebSocket queue bound
    #[serde(default = "default_ws_queue")]
    pub ws_client_queue: usize,
}

impl Default for MonitoringConfiguration {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            ping_interval_secs: default_ping_interval(),
            reconnect_max_backoff_secs: default_reconnect_cap(),
            metrics_interval_secs: default_metrics_interval(),
            ws_client_queue: default_ws_queue(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_ping_interval() -> u64 {
    15
}

fn default_reconnect_cap() -> u64 {
    300
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_ws_queue() -> usize {
    256
}

/// Deployment executor settings
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfiguration {
    /// Image pull timeout in seconds
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    /// Post-start stability window for containers without a HEALTHCHECK
    #[serde(default = "default_stability_window")]
    pub stability_window_secs: u64,

    /// Health wait timeout after start
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
}

impl Default for DeploymentConfiguration {
    fn default() -> Self {
        Self {
            pull_timeout_secs: default_pull_timeout(),
            stability_window_secs: default_stability_window(),
            health_timeout_secs: default_health_timeout(),
        }
    }
}

fn default_pull_timeout() -> u64 {
    600
}

fn default_stability_window() -> u64 {
    3
}

fn default_health_timeout() -> u64 {
    120
}

/// Update pipeline settings
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfiguration {
    /// Seconds between registry digest sweeps
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Operation-level timeout for a single container update
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,

    /// Timeout for stopping the old container
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for UpdateConfiguration {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            update_timeout_secs: default_update_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

fn default_check_interval() -> u64 {
    3600
}

fn default_update_timeout() -> u64 {
    1800
}

fn default_stop_timeout() -> u64 {
    30
}

/// Authentication settings
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfiguration {
    /// HMAC key for session cookie signing (hex). Generated on first boot
    /// when absent.
    #[serde(default)]
    pub cookie_secret: String,

    /// Session lifetime in hours
    #[serde(default = "default_session_hours")]
    pub session_ttl_hours: i64,

    /// Maximum concurrent sessions per user
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: usize,
}

impl Default for AuthConfiguration {
    fn default() -> Self {
        Self {
            cookie_secret: String::new(),
            session_ttl_hours: default_session_hours(),
            max_sessions_per_user: default_max_sessions(),
        }
    }
}

fn default_session_hours() -> i64 {
    24
}

fn default_max_sessions() -> usize {
    10
}

/// Database location
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfiguration {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/dockmon.db")
}

/// Stack compose file storage
#[derive(Debug, Clone, Deserialize)]
pub struct StackConfiguration {
    #[serde(default = "default_stacks_dir")]
    pub directory: PathBuf,
}

impl Default for StackConfiguration {
    fn default() -> Self {
        Self {
            directory: default_stacks_dir(),
        }
    }
}

fn default_stacks_dir() -> PathBuf {
    PathBuf::from("data/stacks")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse_from_empty_toml() {
        let config: Configuration = toml::from_str("").unwrap();
        assert_eq!(config.api.port, 8765);
        assert_eq!(config.monitoring.poll_interval_secs, 30);
        assert_eq!(config.deployments.stability_window_secs, 3);
        assert_eq!(config.auth.session_ttl_hours, 24);
    }

    #[test]
    fn test_partial_override() {
        let config: Configuration = toml::from_str(
            r#"
            [monitoring]
            poll_interval_secs = 10

            [updates]
            update_timeout_secs = 900
            "#,
        )
        .unwrap();
        assert_eq!(config.monitoring.poll_interval_secs, 10);
        assert_eq!(config.monitoring.ping_interval_secs, 15);
        assert_eq!(config.updates.update_timeout_secs, 900);
    }
}
