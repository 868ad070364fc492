use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::album::metadata_cache::RetryPolicy;

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Config structs for config.toml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub static_root: String,
    pub worlds_directory: String,
    pub thumb_directory: String,
    pub view_directory: String,
    pub image_cache_file: String,
    pub metadata_cache_file: String,
    pub snapshot_file: String,
    pub log_directory: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            static_root: "./static".to_string(),
            worlds_directory: "./static/worlds".to_string(),
            thumb_directory: "./static/thumb".to_string(),
            view_directory: "./static/view".to_string(),
            image_cache_file: "./image_metadata.json".to_string(),
            metadata_cache_file: "./worlds_metadata.json".to_string(),
            snapshot_file: "./worlds_snapshot.json".to_string(),
            log_directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Scan {
    pub interval_secs: u64,
    pub image_extensions: Vec<String>,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            image_extensions: ["jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Images {
    pub thumbnail_quality: u8,
    pub full_quality: u8,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            thumbnail_quality: 15,
            full_quality: 95,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Metadata {
    pub api_base: String,
    pub ttl_hours: i64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub fetch_workers: usize,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter: f64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            api_base: "https://api.vrchat.cloud/api/1".to_string(),
            ttl_hours: 24,
            request_timeout_secs: 10,
            user_agent: format!("worlds_album/{}", env!("CARGO_PKG_VERSION")),
            fetch_workers: 4,
            retry_initial_ms: 1_000,
            retry_max_ms: 60_000,
            retry_jitter: 0.2,
        }
    }
}

impl Metadata {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.retry_initial_ms),
            max: Duration::from_millis(self.retry_max_ms),
            jitter: self.retry_jitter,
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            log_to_terminal: true,
            log_to_file: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub scan: Scan,
    pub images: Images,
    pub metadata: Metadata,
    pub logging: Logging,
}

/// Absolute locations derived from [`Paths`], resolved against the config directory.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub static_root: PathBuf,
    pub worlds_directory: PathBuf,
    pub thumb_directory: PathBuf,
    pub view_directory: PathBuf,
    pub image_cache_file: PathBuf,
    pub metadata_cache_file: PathBuf,
    pub snapshot_file: PathBuf,
    pub log_directory: PathBuf,
}

impl AppConfig {
    pub fn resolve_paths(&self, base: &Path) -> ResolvedPaths {
        let resolve = |raw: &str| {
            let path = PathBuf::from(raw);
            if path.is_absolute() { path } else { base.join(path) }
        };
        ResolvedPaths {
            static_root: resolve(&self.paths.static_root),
            worlds_directory: resolve(&self.paths.worlds_directory),
            thumb_directory: resolve(&self.paths.thumb_directory),
            view_directory: resolve(&self.paths.view_directory),
            image_cache_file: resolve(&self.paths.image_cache_file),
            metadata_cache_file: resolve(&self.paths.metadata_cache_file),
            snapshot_file: resolve(&self.paths.snapshot_file),
            log_directory: resolve(&self.paths.log_directory),
        }
    }
}

// Config manager to handle the configuration file
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigManager {
    // Create a new ConfigManager instance
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            tracing::info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir)?;

        let manager = Self {
            app_config: Arc::new(RwLock::new(app_config)),
            config_dir,
        };

        manager.create_default_config()?;

        Ok(manager)
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join("config.toml");

        if !config_path.exists() {
            tracing::warn!("Config file not found: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config.toml: {}", e);
                tracing::info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    tracing::warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                let toml_string = toml::to_string_pretty(&default_config)
                    .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
                fs::write(&config_path, toml_string)?;
                tracing::info!("Created new config.toml with default values");

                Ok(default_config)
            }
        }
    }

    // Get app config
    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.read().clone()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    // Paths of the current config, resolved against the config directory
    pub fn resolved_paths(&self) -> ResolvedPaths {
        self.app_config.read().resolve_paths(&self.config_dir)
    }

    // Save app config to file
    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        let config_path = self.config_dir.join("config.toml");
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(&config_path, toml_string)?;

        *self.app_config.write() = config.clone();

        Ok(())
    }

    // Create config.toml if it doesn't exist
    pub fn create_default_config(&self) -> ConfigResult<()> {
        let config_path = self.config_dir.join("config.toml");
        if !config_path.exists() {
            let default_config = AppConfig::default();
            self.save_app_config(&default_config)?;
        }
        Ok(())
    }
}

// Helper function to create a ConfigManager instance
pub fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<ConfigManager> {
    ConfigManager::new(config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_default_config_file() {
        let dir = tempdir().unwrap();
        let manager = init_config(dir.path()).unwrap();

        assert!(dir.path().join("config.toml").exists());
        assert_eq!(manager.get_app_config(), AppConfig::default());
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "[scan]\ninterval_secs = 5\n\n[metadata]\nfetch_workers = 2\n",
        )
        .unwrap();

        let config = init_config(dir.path()).unwrap().get_app_config();
        assert_eq!(config.scan.interval_secs, 5);
        assert_eq!(config.metadata.fetch_workers, 2);
        assert_eq!(config.metadata.ttl_hours, 24);
        assert_eq!(config.images.thumbnail_quality, 15);
    }

    #[test]
    fn corrupt_config_is_backed_up_and_replaced() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.toml"), "[scan\ninterval_secs = ").unwrap();

        let config = init_config(dir.path()).unwrap().get_app_config();
        assert_eq!(config, AppConfig::default());
        assert!(dir.path().join("config.toml.backup").exists());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempdir().unwrap();
        let manager = init_config(dir.path()).unwrap();
        let paths = manager.resolved_paths();

        assert_eq!(paths.worlds_directory, dir.path().join("./static/worlds"));
        assert!(paths.snapshot_file.starts_with(dir.path()));
    }
}
