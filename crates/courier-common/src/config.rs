//! Configuration for Courier

use crate::settings::GlobalSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides, e.g. `COURIER__DATABASE__URL`
const ENV_PREFIX: &str = "COURIER";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatch engine tuning
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Profile worker service
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Out-of-band notifications
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Initial global settings, used until the operator stores their own
    #[serde(default)]
    pub defaults: GlobalSettings,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Supervisor tick for starting scheduled campaigns (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound on a single executor call (seconds)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Back-off when a profile lock is held elsewhere (milliseconds)
    #[serde(default = "default_lock_retry")]
    pub lock_retry_ms: u64,

    /// How often terminal campaigns are swept for retention (seconds)
    #[serde(default = "default_retention_sweep")]
    pub retention_sweep_secs: u64,

    /// Candidate page size when reading recipient groups
    #[serde(default = "default_candidate_batch")]
    pub candidate_batch_size: u32,

    /// Locks not refreshed for this long belong to a dead instance (seconds)
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            send_timeout_secs: default_send_timeout(),
            lock_retry_ms: default_lock_retry(),
            retention_sweep_secs: default_retention_sweep(),
            candidate_batch_size: default_candidate_batch(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_send_timeout() -> u64 {
    120
}

fn default_lock_retry() -> u64 {
    1_000
}

fn default_retention_sweep() -> u64 {
    3_600
}

fn default_candidate_batch() -> u32 {
    100
}

fn default_lease_ttl() -> u64 {
    60
}

/// Profile worker service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base URL of the worker service
    #[serde(default = "default_worker_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_worker_timeout")]
    pub timeout_secs: u64,

    /// Shared secret for request signatures
    pub signing_secret: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: default_worker_url(),
            timeout_secs: default_worker_timeout(),
            signing_secret: None,
        }
    }
}

fn default_worker_url() -> String {
    "http://localhost:7070".to_string()
}

fn default_worker_timeout() -> u64 {
    90
}

/// Notification relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Enable notifications
    #[serde(default)]
    pub enabled: bool,

    /// Buffered events before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Telegram bot delivery
    pub telegram: Option<TelegramConfig>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_capacity: default_queue_capacity(),
            telegram: None,
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

/// Telegram bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,

    /// Bot API base URL
    #[serde(default = "default_telegram_api")]
    pub api_url: String,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

impl Config {
    /// Load configuration from file, applying environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = built
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/courier/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    fn validate(&self) -> crate::Result<()> {
        match self.database.backend.as_str() {
            "postgres" if self.database.url.is_none() => {
                return Err(crate::Error::Config(
                    "Database URL required for PostgreSQL".to_string(),
                ))
            }
            "postgres" | "memory" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "Unsupported database backend: {}",
                    other
                )))
            }
        }
        self.defaults
            .validate()
            .map_err(|e| crate::Error::Config(format!("Invalid defaults: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PauseMode;
    use std::io::Write;

    #[test]
    fn test_default_sections() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.poll_interval_secs, 5);
        assert_eq!(dispatch.candidate_batch_size, 100);
        assert_eq!(dispatch.lease_ttl_secs, 60);

        let logging = LoggingConfig::default();
        assert_eq!(logging.format, "json");
        assert!(!NotificationConfig::default().enabled);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
backend = "postgres"
url = "postgres://localhost/courier"

[dispatch]
send_timeout_secs = 30

[notifications]
enabled = true

[notifications.telegram]
bot_token = "123:abc"
chat_id = "-100"

[defaults]
pause_mode = "BETWEEN_CLIENTS"
timezone = "Europe/Moscow"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.database.backend, "postgres");
        assert_eq!(config.dispatch.send_timeout_secs, 30);
        assert_eq!(config.defaults.pause_mode, PauseMode::BetweenClients);
        let telegram = config.notifications.telegram.unwrap();
        assert_eq!(telegram.api_url, "https://api.telegram.org");
    }

    #[test]
    fn test_postgres_requires_url() {
        let err = Config::from_toml("[database]\nbackend = \"postgres\"\n").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[database]\nbackend = \"memory\"\n\n[logging]\nformat = \"text\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.database.backend, "memory");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.worker.timeout_secs, 90);
    }
}
