//! # Configuration Module
//!
//! Process-level settings for the data plane: where to listen, where the durable store lives,
//! which config feed to follow, how often reloads are checked and how the upstream transport
//! behaves. Resource definitions (routes, services, ...) are NOT part of these settings; they
//! arrive through the config feed.
//!
//! ## Key Features
//! - YAML/JSON parsing with serde, durations written as `"30s"` via `humantime-serde`
//! - Environment variable overrides (`GATEWAY_<SECTION>_<FIELD>`)
//! - Validation that reports every problem at once

use crate::core::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete settings for one data-plane process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Inbound HTTP listener
    pub server: ServerSettings,

    /// Durable local store
    pub store: StoreSettings,

    /// Source of resource change events
    pub feed: FeedSettings,

    /// Reload orchestration
    pub reload: ReloadSettings,

    /// Upstream transport
    pub proxy: ProxySettings,

    /// Log output
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Load settings from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut settings: GatewaySettings = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut settings: GatewaySettings = serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?;

        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a path, choosing the parser by file extension
    pub async fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::load_from_json(path).await
        } else {
            Self::load_from_file(path).await
        }
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_SERVER_LISTEN=0.0.0.0:8080
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(listen) = env::var("GATEWAY_SERVER_LISTEN") {
            self.server.listen = listen
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_LISTEN: {}", e)))?;
        }

        if let Ok(timeout) = env::var("GATEWAY_SERVER_SHUTDOWN_TIMEOUT") {
            self.server.shutdown_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_SHUTDOWN_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(path) = env::var("GATEWAY_SERVER_HEALTH_PATH") {
            // empty disables
            self.server.health_path = Some(path).filter(|p| !p.is_empty());
        }

        if let Ok(path) = env::var("GATEWAY_STORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }

        if let Ok(file) = env::var("GATEWAY_FEED_FILE") {
            self.feed.file = PathBuf::from(file);
        }

        if let Ok(prefix) = env::var("GATEWAY_FEED_PREFIX") {
            self.feed.prefix = prefix;
        }

        if let Ok(interval) = env::var("GATEWAY_RELOAD_CHECK_INTERVAL") {
            self.reload.check_interval = humantime::parse_duration(&interval).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_RELOAD_CHECK_INTERVAL: {}", e))
            })?;
        }

        if let Ok(timeout) = env::var("GATEWAY_PROXY_DIAL_TIMEOUT") {
            self.proxy.dial_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_PROXY_DIAL_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate settings, reporting every problem found
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.shutdown_timeout.is_zero() {
            errors.push("server.shutdown_timeout must be greater than 0".to_string());
        }

        if self.server.max_body_size == 0 {
            errors.push("server.max_body_size must be greater than 0".to_string());
        }

        if let Some(path) = &self.server.health_path {
            if !path.starts_with('/') {
                errors.push(format!("server.health_path must start with '/', got: {}", path));
            }
        }

        if self.feed.event_buffer == 0 {
            errors.push("feed.event_buffer must be greater than 0".to_string());
        }

        if !self.feed.prefix.is_empty() && !self.feed.prefix.starts_with('/') {
            errors.push(format!("feed.prefix must start with '/', got: {}", self.feed.prefix));
        }

        if self.reload.check_interval.is_zero() {
            errors.push("reload.check_interval must be greater than 0".to_string());
        }

        if self.proxy.dial_timeout.is_zero() {
            errors.push("proxy.dial_timeout must be greater than 0".to_string());
        }

        if self.proxy.max_idle_conns_per_host == 0 {
            errors.push("proxy.max_idle_conns_per_host must be greater than 0".to_string());
        }

        if self.proxy.user_agent.is_empty() {
            errors.push("proxy.user_agent cannot be empty".to_string());
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!("Invalid log format: {}", self.logging.format)),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Inbound server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the data plane listens on
    pub listen: SocketAddr,

    /// Grace period for in-flight requests during shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Largest request body accepted from a client
    pub max_body_size: usize,

    /// Path of the built-in health endpoint; `None` disables it
    ///
    /// A user route matching the same request takes precedence.
    pub health_path: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9080)),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            health_path: Some("/healthz".to_string()),
        }
    }
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Snapshot file; `None` keeps the store in memory only
    pub path: Option<PathBuf>,

    /// Released event objects kept for reuse
    pub event_pool_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("data/store.json")),
            event_pool_size: 256,
        }
    }
}

/// Config feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Resource file followed by the standalone feed
    pub file: PathBuf,

    /// Key prefix used for synthesised event keys
    pub prefix: String,

    /// Capacity of the ordered event channel between feed and store
    pub event_buffer: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            file: PathBuf::from("config/resources.yaml"),
            prefix: "/apisix".to_string(),
            event_buffer: 1024,
        }
    }
}

/// Reload orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSettings {
    /// How often a pending reload is picked up
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Upstream transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub tls_handshake_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub idle_conn_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub keepalive: Duration,

    pub max_idle_conns_per_host: usize,

    /// Skip certificate verification for https upstreams
    pub insecure_skip_verify: bool,

    /// Sent when the client did not provide a `User-Agent`
    pub user_agent: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            idle_conn_timeout: Duration::from_secs(90),
            keepalive: Duration::from_secs(30),
            max_idle_conns_per_host: 250,
            insecure_skip_verify: true,
            user_agent: "api-dataplane".to_string(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set
    pub level: String,

    /// `json` or `text`
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings_validation() {
        let settings = GatewaySettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.proxy.max_idle_conns_per_host, 250);
        assert_eq!(settings.reload.check_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_load_settings_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");

        let config_content = r#"
server:
  listen: "127.0.0.1:9999"
  shutdown_timeout: 5s
reload:
  check_interval: 2s
proxy:
  dial_timeout: 3s
logging:
  level: debug
  format: text
"#;
        tokio::fs::write(&config_path, config_content).await.unwrap();

        let settings = GatewaySettings::load(&config_path).await.unwrap();
        assert_eq!(settings.server.listen.port(), 9999);
        assert_eq!(settings.server.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(settings.reload.check_interval, Duration::from_secs(2));
        assert_eq!(settings.proxy.dial_timeout, Duration::from_secs(3));
        // untouched sections keep their defaults
        assert_eq!(settings.proxy.idle_conn_timeout, Duration::from_secs(90));
        assert_eq!(settings.feed.prefix, "/apisix");
        assert_eq!(settings.server.health_path.as_deref(), Some("/healthz"));
    }

    #[tokio::test]
    async fn test_health_endpoint_can_be_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");
        tokio::fs::write(&config_path, "server:\n  health_path: null\n")
            .await
            .unwrap();

        let settings = GatewaySettings::load(&config_path).await.unwrap();
        assert!(settings.server.health_path.is_none());
        assert!(settings.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_settings_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.json");
        tokio::fs::write(&config_path, r#"{"store": {"path": null}}"#)
            .await
            .unwrap();

        let settings = GatewaySettings::load(&config_path).await.unwrap();
        assert!(settings.store.path.is_none());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut settings = GatewaySettings::default();
        settings.logging.level = "loud".to_string();
        settings.reload.check_interval = Duration::ZERO;
        settings.feed.prefix = "apisix".to_string();
        settings.server.health_path = Some("healthz".to_string());

        let message = settings.validate().unwrap_err().to_string();
        assert!(message.contains("server.health_path"));
        assert!(message.contains("Invalid log level: loud"));
        assert!(message.contains("reload.check_interval"));
        assert!(message.contains("feed.prefix"));
    }

    #[tokio::test]
    async fn test_invalid_yaml_is_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("broken.yaml");
        tokio::fs::write(&config_path, "server: [").await.unwrap();

        let error = GatewaySettings::load(&config_path).await.unwrap_err();
        assert!(matches!(error, GatewayError::Configuration { .. }));
    }
}
