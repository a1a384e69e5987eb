//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Automatic assignment routing.
    #[serde(default)]
    pub assignment: AssignmentConfig,

    /// Live connection settings.
    #[serde(default)]
    pub hub: HubConfig,

    /// Live connection token settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long a command waits for a pooled connection, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "civic_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Category routing for automatic assignment.
///
/// ```toml
/// [assignment.routes]
/// roads = ["staff-3", "staff-7"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignmentConfig {
    /// Category to the staff ids that should receive its new tickets.
    #[serde(default)]
    pub routes: BTreeMap<String, Vec<String>>,
}

/// Live connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Outbound queue size per live connection. Events beyond it are dropped
    /// for that connection.
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,
}

/// Secret shared with whatever mints live connection tokens.
///
/// ```toml
/// [auth]
/// token_secret = "change-me"
/// token_ttl_secs = 60
/// ```
///
/// An empty secret makes the server pick a random one at startup, so no
/// outside token is accepted.
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub token_secret: String,

    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "civic.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_token_ttl_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connection_buffer() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
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

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            connection_buffer: default_connection_buffer(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> civic_db::DbRuntimeSettings {
        civic_db::DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
            acquire_timeout_ms: self.acquire_timeout_ms,
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
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CIVIC_HOST` overrides `server.host`
/// - `CIVIC_PORT` overrides `server.port`
/// - `CIVIC_DB_PATH` overrides `database.path`
/// - `CIVIC_LOG_LEVEL` overrides `logging.level`
/// - `CIVIC_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `CIVIC_TOKEN_SECRET` overrides `auth.token_secret`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `CIVIC_*` overrides read through `lookup`. Unparseable values are
/// ignored.
fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("CIVIC_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("CIVIC_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = lookup("CIVIC_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = lookup("CIVIC_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("CIVIC_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(secret) = lookup("CIVIC_TOKEN_SECRET") {
        config.auth.token_secret = secret;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").expect("empty toml parses");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.path, "civic.db");
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert_eq!(config.database.acquire_timeout_ms, 10_000);
        assert!(config.auth.token_secret.is_empty());
        assert_eq!(config.auth.token_ttl_secs, 60);
        assert_eq!(config.hub.connection_buffer, 256);
        assert!(config.assignment.routes.is_empty());
        assert!(!config.logging.json);
    }

    #[test]
    fn parses_routes_and_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8088

            [database]
            path = "/var/lib/civic/civic.db"

            [assignment.routes]
            roads = ["staff-3", "staff-7"]
            parks = ["staff-1"]

            [hub]
            connection_buffer = 16

            [auth]
            token_secret = "s3cret"
            "#,
        )
        .expect("valid toml");

        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.host, default_host());
        assert_eq!(config.database.path, "/var/lib/civic/civic.db");
        assert_eq!(config.database.pool_max_size, 8);
        assert_eq!(
            config.assignment.routes.get("roads"),
            Some(&vec!["staff-3".to_string(), "staff-7".to_string()])
        );
        assert_eq!(config.hub.connection_buffer, 16);
        assert_eq!(config.auth.token_secret, "s3cret");
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).expect("missing file is not an error");
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nport = ").expect("write");
        assert!(matches!(
            load_config(path.to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CIVIC_HOST", "0.0.0.0"),
            ("CIVIC_PORT", "not-a-port"),
            ("CIVIC_DB_PATH", "/tmp/override.db"),
            ("CIVIC_LOG_JSON", "1"),
            ("CIVIC_TOKEN_SECRET", "from-env"),
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(config.server.port, 3000, "unparseable port is ignored");
        assert_eq!(config.database.path, "/tmp/override.db");
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.auth.token_secret, "from-env");
    }

    #[test]
    fn database_settings_carry_the_acquire_timeout() {
        let config: Config = toml::from_str(
            r#"
            [database]
            pool_max_size = 2
            acquire_timeout_ms = 750
            "#,
        )
        .expect("valid toml");
        let settings = config.database.runtime_settings();
        assert_eq!(settings.pool_max_size, 2);
        assert_eq!(settings.acquire_timeout_ms, 750);
        assert_eq!(settings.busy_timeout_ms, 5_000);
    }
}
