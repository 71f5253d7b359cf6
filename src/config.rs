//! Configuration System
//!
//! Loads the recorder configuration from a TOML file or from a legacy
//! `key=value` credentials file, then applies environment variable overrides.
//! A configuration file is mandatory: without one the recorder refuses to run.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which relational database holds the samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Local SQLite file; `database` is its path
    #[default]
    Sqlite,
    /// PostgreSQL server; `database` is the database name
    Postgres,
    /// MySQL or MariaDB server; `database` is the schema name
    Mysql,
}

impl Backend {
    /// Port used when the configuration leaves it unset
    pub fn default_port(self) -> u16 {
        match self {
            Backend::Sqlite => 0,
            Backend::Postgres => 5432,
            Backend::Mysql => 3306,
        }
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            "mysql" | "mariadb" => Ok(Backend::Mysql),
            other => Err(ConfigError::Invalid(format!("unknown backend {:?}", other))),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Sqlite => write!(f, "sqlite"),
            Backend::Postgres => write!(f, "postgres"),
            Backend::Mysql => write!(f, "mysql"),
        }
    }
}

/// Database connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_db_host")]
    pub host: String,

    /// Server port; unset means the backend's standard port
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_table")]
    pub table: String,

    /// SQLite: `PRAGMA encoding` on creation. MySQL: connection character set.
    pub charset: Option<String>,
}

impl DatabaseConfig {
    /// Port to connect to
    pub fn server_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.backend.default_port())
    }
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_database() -> String {
    "speedtest.db".to_string()
}

fn default_table() -> String {
    "speedtest".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            user: String::new(),
            password: String::new(),
            host: default_db_host(),
            port: None,
            database: default_database(),
            table: default_table(),
            charset: None,
        }
    }
}

/// Measurement service settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Client configuration document (IP, ISP, location)
    #[serde(default = "default_config_url")]
    pub config_url: String,

    /// Server directory documents, tried in order
    #[serde(default = "default_server_urls")]
    pub server_urls: Vec<String>,

    /// How many of the closest servers to consider
    #[serde(default = "default_max_servers")]
    pub max_servers: usize,

    /// Per-request timeout; unset leaves latency to the remote service
    pub timeout_secs: Option<u64>,

    /// Edge lengths of the `random{N}x{N}.jpg` images fetched by the download test
    #[serde(default = "default_download_sizes")]
    pub download_sizes: Vec<u32>,

    /// Payload sizes in bytes posted by the upload test
    #[serde(default = "default_upload_sizes")]
    pub upload_sizes: Vec<usize>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_config_url() -> String {
    "https://www.speedtest.net/speedtest-config.php".to_string()
}

fn default_server_urls() -> Vec<String> {
    vec![
        "https://www.speedtest.net/speedtest-servers-static.php".to_string(),
        "http://c.speedtest.net/speedtest-servers-static.php".to_string(),
        "https://www.speedtest.net/speedtest-servers.php".to_string(),
        "http://c.speedtest.net/speedtest-servers.php".to_string(),
    ]
}

fn default_max_servers() -> usize {
    5
}

fn default_download_sizes() -> Vec<u32> {
    vec![350, 500, 750, 1000, 1500, 2000]
}

fn default_upload_sizes() -> Vec<usize> {
    vec![32 * 1024, 64 * 1024, 128 * 1024, 256 * 1024, 512 * 1024, 1024 * 1024]
}

fn default_user_agent() -> String {
    format!(
        "Mozilla/5.0 ({}; U; 64bit; en-us) {}/{}",
        std::env::consts::OS,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            config_url: default_config_url(),
            server_urls: default_server_urls(),
            max_servers: default_max_servers(),
            timeout_secs: None,
            download_sizes: default_download_sizes(),
            upload_sizes: default_upload_sizes(),
            user_agent: default_user_agent(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path; `None` logs to stdout only
    #[serde(default = "default_log_file")]
    pub file: Option<String>,

    /// Rotate the log file once it would grow past this size
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,

    /// Rotated files kept next to the live one
    #[serde(default = "default_log_backups")]
    pub backups: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_file() -> Option<String> {
    Some("speedlog.log".to_string())
}

fn default_log_max_bytes() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_log_backups() -> usize {
    1
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: default_log_file(),
            max_bytes: default_log_max_bytes(),
            backups: default_log_backups(),
        }
    }
}

/// Positional fields of a legacy credentials file
const LEGACY_FIELDS: [&str; 5] = ["user", "password", "host", "database", "table"];

impl Config {
    /// Load configuration from a file
    ///
    /// `.toml` files are parsed as TOML; anything else is read as a legacy
    /// credentials file of `key=value` lines.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                error: e.to_string(),
            })
        } else {
            Self::from_legacy(&content).map_err(|error| ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            })
        }
    }

    /// Parse a legacy credentials file
    ///
    /// The first five non-blank lines are read in order as user, password,
    /// host, database name and table name. Keys are ignored; only the text
    /// after the first `=` matters. Legacy files describe a MySQL server.
    pub fn from_legacy(content: &str) -> Result<Self, String> {
        let values = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .take(LEGACY_FIELDS.len())
            .enumerate()
            .map(|(idx, line)| {
                line.split_once('=')
                    .map(|(_, value)| value.trim().to_string())
                    .ok_or_else(|| {
                        format!("line {} ({}) is not key=value", idx + 1, LEGACY_FIELDS[idx])
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if values.len() < LEGACY_FIELDS.len() {
            return Err(format!(
                "expected {} key=value lines ({}), found {}",
                LEGACY_FIELDS.len(),
                LEGACY_FIELDS.join(", "),
                values.len()
            ));
        }

        let mut values = values.into_iter();
        let mut next = || values.next().unwrap_or_default();

        let database = DatabaseConfig {
            backend: Backend::Mysql,
            user: next(),
            password: next(),
            host: next(),
            database: next(),
            table: next(),
            ..DatabaseConfig::default()
        };

        Ok(Self {
            database,
            ..Self::default()
        })
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Find the configuration file to use
    ///
    /// An explicit path wins. Otherwise the first existing default location
    /// is used. No file at all is an error.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        let candidates: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("speedlog").join("config.toml")),
            Some(PathBuf::from("/etc/speedlog/config.toml")),
            Some(PathBuf::from("./speedlog.toml")),
            Some(PathBuf::from("./mysql.cfg")),
        ]
        .into_iter()
        .flatten()
        .collect();

        candidates
            .iter()
            .find(|p| p.exists())
            .cloned()
            .ok_or(ConfigError::NotFound { searched: candidates })
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        // Database overrides
        if let Some(backend) = var("SPEEDLOG_DB_BACKEND") {
            self.database.backend = backend.parse()?;
        }
        if let Some(user) = var("SPEEDLOG_DB_USER") {
            self.database.user = user;
        }
        if let Some(password) = var("SPEEDLOG_DB_PASSWORD") {
            self.database.password = password;
        }
        if let Some(host) = var("SPEEDLOG_DB_HOST") {
            self.database.host = host;
        }
        if let Some(port) = var("SPEEDLOG_DB_PORT") {
            self.database.port = Some(
                port.parse()
                    .map_err(|_| ConfigError::Invalid(format!("invalid port {:?}", port)))?,
            );
        }
        if let Some(database) = var("SPEEDLOG_DB_NAME") {
            self.database.database = database;
        }
        if let Some(table) = var("SPEEDLOG_DB_TABLE") {
            self.database.table = table;
        }

        // Logging overrides
        if let Some(level) = var("SPEEDLOG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(file) = var("SPEEDLOG_LOG_FILE") {
            self.logging.file = if file.trim().is_empty() { None } else { Some(file) };
        }

        Ok(())
    }

    /// Reject settings the recorder cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !crate::store::is_sql_identifier(&self.database.table) {
            return Err(ConfigError::Invalid(format!(
                "table name {:?} must match [A-Za-z_][A-Za-z0-9_]*",
                self.database.table
            )));
        }
        if self.database.database.trim().is_empty() {
            return Err(ConfigError::Invalid("database name is empty".to_string()));
        }
        if self.probe.max_servers == 0 {
            return Err(ConfigError::Invalid(
                "probe.max_servers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("No config file found (searched {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# speedlog configuration
#
# Environment variables override these settings:
# - SPEEDLOG_DB_BACKEND, SPEEDLOG_DB_USER, SPEEDLOG_DB_PASSWORD
# - SPEEDLOG_DB_HOST, SPEEDLOG_DB_PORT, SPEEDLOG_DB_NAME, SPEEDLOG_DB_TABLE
# - SPEEDLOG_LOG_LEVEL, SPEEDLOG_LOG_FILE

[database]
# Backend: sqlite, postgres or mysql
backend = "sqlite"

# Database name (postgres, mysql) or file path (sqlite)
database = "speedtest.db"

# Table holding the samples; create it once with `speedlog --setup`
table = "speedtest"

# Server credentials (postgres and mysql)
# user = "speedlog"
# password = ""
# host = "localhost"
# port = 3306  (default: 5432 for postgres, 3306 for mysql)

# Text encoding: sqlite applies it to a new database file,
# mysql uses it as the connection character set
# charset = "UTF-8"

[probe]
# Number of closest servers to choose the best one from
max_servers = 5

# Per-request timeout in seconds (unset: no timeout)
# timeout_secs = 60

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty or json
format = "pretty"

# Log file, rotated by size
file = "speedlog.log"
max_bytes = 1048576
backups = 1
"#
    .to_string()
}
