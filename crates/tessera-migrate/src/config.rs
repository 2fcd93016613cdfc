//! Startup configuration loading from file and environment variables.

use std::time::Duration;

use serde::Deserialize;
use tessera_db::{DbRuntimeSettings, MigrationSettings};
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Target database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Migration discovery and application settings.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string, URL or `key=value` form. Must name the
    /// target database.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of pooled connections used while migrating.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long a pool checkout waits for a connection, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

/// Migration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Directory searched for `migration_<N>_<description>.sql` files.
    /// Defaults to the directory containing the executable.
    #[serde(default)]
    pub root: Option<String>,

    /// How long to wait for another process applying the same migration,
    /// in milliseconds. Only `TESSERA_LOCK_TIMEOUT_MS=none` waits
    /// indefinitely.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,

    /// Apply each script and its bookkeeping row in one transaction.
    #[serde(default = "default_transactional")]
    pub transactional: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "tessera_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_database_url() -> String {
    "host=localhost user=postgres dbname=tessera".to_string()
}

fn default_pool_max_size() -> u32 {
    2
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_lock_timeout_ms() -> Option<u64> {
    Some(300_000)
}

fn default_transactional() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_max_size: default_pool_max_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            root: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            transactional: default_transactional(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Runner settings derived from the `[database]` and `[migrations]`
    /// tables.
    pub fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            lock_timeout: self.migrations.lock_timeout_ms.map(Duration::from_millis),
            transactional: self.migrations.transactional,
            pool: DbRuntimeSettings {
                pool_max_size: self.database.pool_max_size,
                connection_timeout_ms: self.database.connection_timeout_ms,
            },
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `TESSERA_DATABASE_URL` overrides `database.url`
/// - `TESSERA_MIGRATIONS_ROOT` overrides `migrations.root`
/// - `TESSERA_LOCK_TIMEOUT_MS` overrides `migrations.lock_timeout_ms`
///   (`none` waits indefinitely)
/// - `TESSERA_LOG_LEVEL` overrides `logging.level`
/// - `TESSERA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if an override has an invalid value.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let config = read_config_file(path)?;
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn read_config_file(path: Option<&str>) -> Result<Config, ConfigError> {
    match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::FileRead(e)),
        },
        None => Ok(Config::default()),
    }
}

fn apply_overrides<F>(mut config: Config, var: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = var("TESSERA_DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(root) = var("TESSERA_MIGRATIONS_ROOT").filter(|root| !root.trim().is_empty()) {
        config.migrations.root = Some(root);
    }
    if let Some(timeout) = var("TESSERA_LOCK_TIMEOUT_MS") {
        config.migrations.lock_timeout_ms = if timeout.trim().eq_ignore_ascii_case("none") {
            None
        } else {
            Some(
                timeout
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "TESSERA_LOCK_TIMEOUT_MS",
                        value: timeout.clone(),
                    })?,
            )
        };
    }
    if let Some(level) = var("TESSERA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("TESSERA_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
