//! Bootstrap configuration loading
//!
//! Two-tier configuration:
//! 1. **TOML Bootstrap**: Database path, port, bind address, logging
//!    (static, read once at startup)
//! 2. **Database Runtime**: Tunable settings live in the `settings` table
//!    and are loaded by each service after the database is open
//!
//! Settings sources priority:
//! 1. Environment variables (SELAH_DATABASE_PATH, SELAH_PORT, ...)
//! 2. TOML configuration file
//! 3. Database settings table
//! 4. Built-in defaults (code constants)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Bootstrap configuration loaded from the TOML file
///
/// These settings cannot change during runtime. The service must restart
/// to pick up changes to the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Path to SQLite database file (relative or absolute)
    ///
    /// If not specified, an OS-dependent default location is used.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Judgment API key (lowest-priority source; database and environment win)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgment_api_key: Option<String>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_port() -> u16 {
    5750
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            port: default_port(),
            bind_address: default_bind_address(),
            judgment_api_key: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl TomlConfig {
    /// Load bootstrap configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }
}

/// Write bootstrap configuration back to the TOML file
///
/// Used when settings entered through the HTTP API are mirrored into the
/// config file so they survive a database reset.
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize TOML: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;

    Ok(())
}

/// Platform default for the user-level config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("selah").join("selah.toml"))
        .unwrap_or_else(|| PathBuf::from("selah.toml"))
}

/// Find the config file to use, if any exists
///
/// Priority: SELAH_CONFIG env var, then the user config directory,
/// then /etc/selah/selah.toml on Linux.
pub fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("SELAH_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let user_config = default_config_path();
    if user_config.exists() {
        return Some(user_config);
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/selah/selah.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("selah").join("selah.db"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/selah/selah.db"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("selah").join("selah.db"))
            .unwrap_or_else(|| PathBuf::from("./selah.db"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("selah").join("selah.db"))
            .unwrap_or_else(|| PathBuf::from("selah.db"))
    } else {
        PathBuf::from("./selah.db")
    }
}

/// Environment variable configuration overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub bind_address: Option<String>,
}

impl ConfigOverrides {
    /// Read overrides from SELAH_* environment variables
    pub fn from_env() -> Result<Self> {
        let database_path = std::env::var("SELAH_DATABASE_PATH")
            .ok()
            .map(PathBuf::from);

        let port = match std::env::var("SELAH_PORT") {
            Ok(raw) => Some(raw.parse::<u16>().map_err(|e| {
                Error::Config(format!("Invalid SELAH_PORT '{}': {}", raw, e))
            })?),
            Err(_) => None,
        };

        let bind_address = std::env::var("SELAH_BIND_ADDRESS").ok();

        Ok(Self {
            database_path,
            port,
            bind_address,
        })
    }
}

/// Resolved bootstrap configuration
///
/// Combines the TOML file (if present), environment overrides, and
/// built-in defaults. Database-backed runtime settings are loaded
/// separately once the pool is open.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database file path
    pub database_path: PathBuf,

    /// HTTP server port
    pub port: u16,

    /// HTTP bind address
    pub bind_address: String,

    /// Parsed TOML contents (for key resolution and write-back)
    pub toml: TomlConfig,

    /// Path the TOML was loaded from, None when running on defaults
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Resolve bootstrap configuration
    ///
    /// Missing config file is not an error: the service starts on
    /// built-in defaults and creates the database at the default path.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self> {
        let config_path = discover_config_path();

        let toml = match &config_path {
            Some(path) => {
                let parsed = TomlConfig::load(path)?;
                info!("Loaded TOML configuration from {:?}", path);
                parsed
            }
            None => {
                info!("No config file found, using built-in defaults");
                TomlConfig::default()
            }
        };

        let database_path = overrides
            .database_path
            .or_else(|| toml.database_path.clone())
            .unwrap_or_else(default_database_path);

        let port = overrides.port.unwrap_or(toml.port);
        let bind_address = overrides
            .bind_address
            .clone()
            .unwrap_or_else(|| toml.bind_address.clone());

        Ok(Self {
            database_path,
            port,
            bind_address,
            toml,
            config_path,
        })
    }

    /// Effective log level from the TOML logging section
    pub fn log_level(&self) -> &str {
        &self.toml.logging.level
    }
}
