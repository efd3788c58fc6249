//! Server configuration loading from file and environment variables.

use oryon_db::ConnectionConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// Placeholder key injected by local tooling; treated as "not configured".
pub const PLACEHOLDER_API_KEY: &str = "mock-key";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network and runtime settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database connection settings.
    #[serde(default)]
    pub database: ConnectionConfig,

    /// Service identity and integrations.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the process serves requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeMode {
    /// Verbose human-readable logs, debug filter.
    Development,
    /// Structured logs, fixed worker pool.
    #[default]
    Production,
}

impl FromStr for ServeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown serve mode '{other}'")),
        }
    }
}

/// Network and runtime configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Serving mode.
    #[serde(default)]
    pub mode: ServeMode,

    /// Runtime worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Blocking threads available per worker for database work.
    #[serde(default = "default_threads_per_worker")]
    pub threads_per_worker: usize,

    /// Upper bound on a single request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Service identity and integration settings.
#[derive(Clone, Deserialize)]
pub struct ServiceConfig {
    /// Deployment environment label.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// External API key. Never logged or echoed.
    #[serde(default)]
    pub openai_api_key: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "oryon_server=debug,info"). Defaults
    /// by serve mode when unset.
    #[serde(default)]
    pub level: Option<String>,

    /// Whether to output logs in JSON format. Defaults by serve mode when unset.
    #[serde(default)]
    pub json: Option<bool>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    2
}

fn default_threads_per_worker() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_environment() -> String {
    "unknown".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: ServeMode::default(),
            workers: default_workers(),
            threads_per_worker: default_threads_per_worker(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Runtime worker threads; development serves from a single worker.
    pub fn runtime_workers(&self) -> usize {
        match self.mode {
            ServeMode::Development => 1,
            ServeMode::Production => self.workers,
        }
    }

    /// Size of the blocking pool handlers run database work on.
    pub fn blocking_threads(&self) -> usize {
        (self.runtime_workers() * self.threads_per_worker).max(1)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            openai_api_key: None,
        }
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("environment", &self.environment)
            .field(
                "openai_api_key",
                &self.openai_api_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl ServiceConfig {
    /// Whether a real (non-placeholder) external API key is present.
    pub fn openai_configured(&self) -> bool {
        self.openai_api_key
            .as_deref()
            .map(str::trim)
            .is_some_and(|key| !key.is_empty() && key != PLACEHOLDER_API_KEY)
    }
}

impl LoggingConfig {
    /// The filter to install, falling back to the mode default.
    pub fn effective_level(&self, mode: ServeMode) -> &str {
        match (&self.level, mode) {
            (Some(level), _) => level.as_str(),
            (None, ServeMode::Development) => "debug",
            (None, ServeMode::Production) => "info",
        }
    }

    /// Whether to emit JSON, falling back to the mode default.
    pub fn effective_json(&self, mode: ServeMode) -> bool {
        self.json.unwrap_or(mode == ServeMode::Production)
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

    /// An environment variable held a value of the wrong shape.
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv {
        /// The offending variable.
        var: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment variable overrides.
///
/// Environment variable overrides:
/// - `INSTANCE_CONNECTION_NAME`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`,
///   `DB_SOCKET_DIR` override `database.*`
/// - `OPENAI_API_KEY` overrides `service.openai_api_key`
/// - `ENVIRONMENT` overrides `service.environment`
/// - `ORYON_HOST`, `PORT` override `server.host`, `server.port`
/// - `APP_MODE` overrides `server.mode` (`development` or `production`)
/// - `ORYON_WORKERS`, `ORYON_THREADS`, `ORYON_REQUEST_TIMEOUT_SECS`
///   override the runtime sizing
/// - `ORYON_LOG_LEVEL` overrides `logging.level`; `ORYON_LOG_JSON` (`true` or `false`)
///   overrides `logging.json`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if an override cannot be parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`], reading overrides through `lookup`.
pub fn load_config_with<F>(path: Option<&str>, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
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

    apply_env_overrides(&mut config, &lookup)?;
    Ok(config)
}

fn parse_env<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidEnv {
                var,
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

fn apply_env_overrides<F>(config: &mut Config, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let db = &mut config.database;
    for (var, slot) in [
        ("INSTANCE_CONNECTION_NAME", &mut db.instance_connection_name),
        ("DB_USER", &mut db.user),
        ("DB_PASSWORD", &mut db.password),
        ("DB_NAME", &mut db.name),
    ] {
        if let Some(value) = lookup(var) {
            *slot = Some(value);
        }
    }
    if let Some(dir) = lookup("DB_SOCKET_DIR").filter(|d| !d.trim().is_empty()) {
        db.socket_dir = dir;
    }

    if let Some(key) = lookup("OPENAI_API_KEY") {
        config.service.openai_api_key = Some(key);
    }
    if let Some(env) = lookup("ENVIRONMENT").filter(|e| !e.trim().is_empty()) {
        config.service.environment = env;
    }

    if let Some(host) = parse_env(lookup, "ORYON_HOST")? {
        config.server.host = host;
    }
    if let Some(port) = parse_env(lookup, "PORT")? {
        config.server.port = port;
    }
    if let Some(mode) = parse_env(lookup, "APP_MODE")? {
        config.server.mode = mode;
    }
    if let Some(workers) = parse_env(lookup, "ORYON_WORKERS")? {
        config.server.workers = workers;
    }
    if let Some(threads) = parse_env(lookup, "ORYON_THREADS")? {
        config.server.threads_per_worker = threads;
    }
    if let Some(timeout) = parse_env(lookup, "ORYON_REQUEST_TIMEOUT_SECS")? {
        config.server.request_timeout_secs = timeout;
    }

    if let Some(level) = lookup("ORYON_LOG_LEVEL").filter(|l| !l.trim().is_empty()) {
        config.logging.level = Some(level);
    }
    if let Some(json) = parse_env::<bool, _>(lookup, "ORYON_LOG_JSON")? {
        config.logging.json = Some(json);
    }

    if config.server.workers == 0 {
        return Err(ConfigError::InvalidEnv {
            var: "ORYON_WORKERS",
            reason: "at least one worker is required".to_string(),
        });
    }

    Ok(())
}
