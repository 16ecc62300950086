//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (`HUDDLE_HOST`, `HUDDLE_PORT`, `HUDDLE__SECTION__KEY`)

use anyhow::{Context, Result};
use huddle_core::{EngineConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Upload storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Room behaviour.
    #[serde(default)]
    pub rooms: RoomsConfig,

    /// Soft-deleted message retention.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Link previews.
    #[serde(default)]
    pub previews: PreviewsConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Pool size.
    #[serde(default = "default_database_connections")]
    pub max_connections: u32,
}

/// Upload storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per room.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// URL prefix under which uploads are served.
    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,

    /// Rejected file extensions, with the leading dot.
    #[serde(default = "default_blocked_extensions")]
    pub blocked_extensions: Vec<String>,
}

/// Room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Messages in a room snapshot and the default page size.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Largest page a client may request.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Seconds before a disconnected user leaves its room. 0 disables.
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_secs: u64,
}

/// Retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days a soft-deleted message is kept.
    #[serde(default = "default_retention_days")]
    pub days: u32,

    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Link preview configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewsConfig {
    /// Fetch previews at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fetch timeout in milliseconds.
    #[serde(default = "default_preview_timeout")]
    pub timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum upload request size in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HUDDLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_true() -> bool {
    true
}

fn default_database_url() -> String {
    StoreConfig::default().url
}

fn default_database_connections() -> u32 {
    StoreConfig::default().max_connections
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_public_prefix() -> String {
    "/uploads".to_string()
}

fn default_blocked_extensions() -> Vec<String> {
    [
        ".exe",
        ".bat",
        ".cmd",
        ".sh",
        ".vbs",
        ".msi",
        ".dll",
        ".scr",
        ".pif",
        ".application",
        ".gadget",
        ".com",
        ".cpl",
        ".jar",
    ]
    .iter()
    .map(|ext| (*ext).to_string())
    .collect()
}

fn default_page_size() -> u32 {
    20
}

fn default_max_page_size() -> u32 {
    100
}

fn default_disconnect_grace() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    7
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_preview_timeout() -> u64 {
    3000
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_max_upload_size() -> usize {
    100 * 1024 * 1024 // 100 MB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            rooms: RoomsConfig::default(),
            retention: RetentionConfig::default(),
            previews: PreviewsConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_database_connections(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            public_prefix: default_public_prefix(),
            blocked_extensions: default_blocked_extensions(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            disconnect_grace_secs: default_disconnect_grace(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for PreviewsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_preview_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

const CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

impl Config {
    /// Load configuration from the first config file found, with
    /// `HUDDLE__SECTION__KEY` environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        if let Some(path) = &file {
            info!("Loading configuration from {}", path.display());
        }

        Self::layered(file.as_deref())
    }

    /// Merge an optional TOML file with environment overrides.
    fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::from(path.to_path_buf()).format(::config::FileFormat::Toml),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("HUDDLE")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("storage.blocked_extensions")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Engine settings derived from the room and retention sections.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let grace = self.rooms.disconnect_grace_secs;
        EngineConfig {
            page_size: self.rooms.page_size,
            max_page_size: self.rooms.max_page_size.max(self.rooms.page_size),
            retention: chrono::Duration::days(i64::from(self.retention.days)),
            disconnect_grace: (grace > 0).then(|| Duration::from_secs(grace)),
            ..EngineConfig::default()
        }
    }

    /// Store settings.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            url: self.database.url.clone(),
            max_connections: self.database.max_connections,
        }
    }

    /// Interval between sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_secs.max(1))
    }
}

impl DatabaseConfig {
    /// Path of the database file, if the URL names one.
    #[must_use]
    pub fn file_path(&self) -> Option<PathBuf> {
        let rest = self
            .url
            .strip_prefix("sqlite://")
            .or_else(|| self.url.strip_prefix("sqlite:"))?;
        let path = rest.split('?').next().unwrap_or_default();
        if path.is_empty() || path.contains(":memory:") {
            return None;
        }
        Some(PathBuf::from(path))
    }
}

impl StorageConfig {
    /// Whether uploads named `file_name` are refused.
    #[must_use]
    pub fn is_blocked(&self, file_name: &str) -> bool {
        let Some(ext) = Path::new(file_name).extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = format!(".{}", ext.to_ascii_lowercase());
        self.blocked_extensions
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(&ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rooms.page_size, 20);
        assert_eq!(config.retention.days, 7);
        assert!(config.previews.enabled);
        assert_eq!(config.storage.public_prefix, "/uploads");
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 3100;
        assert_eq!(config.bind_addr().unwrap().port(), 3100);

        config.host = "not a host".to_string();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [rooms]
            disconnect_grace_secs = 0

            [retention]
            days = 2
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.rooms.page_size, 20);

        let engine = config.engine_config();
        assert_eq!(engine.disconnect_grace, None);
        assert_eq!(engine.retention, chrono::Duration::days(2));
    }

    #[test]
    fn test_engine_grace() {
        let config = Config::default();
        assert_eq!(
            config.engine_config().disconnect_grace,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_layered_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[storage]\npublic_prefix = \"/files\"\n\n[metrics]\nenabled = false").unwrap();

        let config = Config::layered(Some(file.path())).unwrap();
        assert_eq!(config.storage.public_prefix, "/files");
        assert!(!config.metrics.enabled);
        assert_eq!(config.storage.blocked_extensions.len(), 14);
    }

    #[test]
    fn test_layered_env_override() {
        std::env::set_var("HUDDLE__PREVIEWS__TIMEOUT_MS", "1500");
        let config = Config::layered(None).unwrap();
        std::env::remove_var("HUDDLE__PREVIEWS__TIMEOUT_MS");
        assert_eq!(config.previews.timeout_ms, 1500);
    }

    #[test]
    fn test_database_file_path() {
        let mut db = DatabaseConfig::default();
        assert_eq!(db.file_path(), Some(PathBuf::from("data/huddle.db")));

        db.url = "sqlite::memory:".to_string();
        assert_eq!(db.file_path(), None);

        db.url = "sqlite://chat.db?mode=rwc".to_string();
        assert_eq!(db.file_path(), Some(PathBuf::from("chat.db")));
    }

    #[test]
    fn test_blocked_extensions() {
        let storage = StorageConfig::default();
        assert!(storage.is_blocked("setup.EXE"));
        assert!(storage.is_blocked("run.sh"));
        assert!(!storage.is_blocked("photo.png"));
        assert!(!storage.is_blocked("README"));
    }
}
