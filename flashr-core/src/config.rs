//! Runtime configuration.
//!
//! Configuration is read from a TOML file, by default
//! `<config_dir>/flashr/config.toml`. Every section is optional and a missing
//! file yields [`Config::default`].

use crate::error::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Application name, used for configuration and cache directories.
pub const APP_NAME: &str = "flashr";

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Smallest accepted cache cap.
pub const MIN_CACHE_SIZE: u64 = GIB;
/// Largest accepted cache cap.
pub const MAX_CACHE_SIZE: u64 = 100 * GIB;
pub const DEFAULT_CACHE_MAX_SIZE: u64 = 20 * GIB;
/// Consecutive flash failures against one cached image before it is deleted.
pub const DEFAULT_MAX_FLASH_FAILURES: u32 = 3;
pub const DEFAULT_BLOCK_SIZE: usize = 4 * MIB as usize;

const MIN_BLOCK_SIZE: usize = 64 * KIB as usize;
const MAX_BLOCK_SIZE: usize = 64 * MIB as usize;
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("cache.max_size must be between 1 GiB and 100 GiB, got {0} bytes")]
    InvalidCacheSize(u64),

    #[error("cache.max_flash_failures must be at least 1, got {0}")]
    InvalidFailureThreshold(u32),

    #[error("flash.block_size must be a power of two between 64 KiB and 64 MiB, got {0}")]
    InvalidBlockSize(usize),

    #[error("monitor.poll_interval_ms must be between 100 and 10000, got {0}")]
    InvalidPollInterval(u64),

    #[error("logging.level must be one of: trace, debug, info, warn, error, off; got {0}")]
    InvalidLogLevel(String),

    #[error("failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub download: DownloadConfig,
    pub flash: FlashConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep completed downloads for reuse. When disabled, images are removed
    /// once they have been flashed.
    pub enabled: bool,
    /// Upper bound on the total size of cached images, in bytes.
    pub max_size: u64,
    /// Directory holding cached images.
    pub dir: PathBuf,
    pub max_flash_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Transport-level retries before a download is reported as failed.
    pub retries: u32,
    /// Base delay between retries; attempt `n` waits `n` times this long.
    pub retry_backoff_ms: u64,
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated while reading a response body.
    pub read_timeout_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlashConfig {
    pub block_size: usize,
    /// Default for front-ends that do not ask the user.
    pub verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: DEFAULT_CACHE_MAX_SIZE,
            dir: default_cache_dir(),
            max_flash_failures: DEFAULT_MAX_FLASH_FAILURES,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_backoff_ms: 500,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            user_agent: format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            verify: true,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, or from [`Config::default_path`]
    /// when `path` is `None`. A missing default file is not an error; a
    /// missing explicit file is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join("config.toml"))
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(MIN_CACHE_SIZE..=MAX_CACHE_SIZE).contains(&self.cache.max_size) {
            return Err(ConfigError::InvalidCacheSize(self.cache.max_size));
        }
        if self.cache.max_flash_failures == 0 {
            return Err(ConfigError::InvalidFailureThreshold(
                self.cache.max_flash_failures,
            ));
        }
        let block = self.flash.block_size;
        if !block.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block) {
            return Err(ConfigError::InvalidBlockSize(block));
        }
        if !(100..=10_000).contains(&self.monitor.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval(
                self.monitor.poll_interval_ms,
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }
        Ok(())
    }
}

/// The default image cache directory.
///
/// When running as root on behalf of another user (sudo, pkexec), the
/// invoking user's cache is used so that images are shared with unprivileged
/// runs.
pub fn default_cache_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    if nix::unistd::geteuid().is_root() {
        if let Some(home) = invoking_user_home() {
            return home.join(".cache").join(APP_NAME).join("images");
        }
    }

    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join("images")
}

#[cfg(target_os = "linux")]
fn invoking_user_home() -> Option<PathBuf> {
    use nix::unistd::{Uid, User};

    let by_uid = std::env::var("PKEXEC_UID")
        .or_else(|_| std::env::var("SUDO_UID"))
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .and_then(|uid| User::from_uid(Uid::from_raw(uid)).ok().flatten());

    let user = match by_uid {
        Some(user) => Some(user),
        None => std::env::var("SUDO_USER")
            .ok()
            .and_then(|name| User::from_name(&name).ok().flatten()),
    };

    user.filter(|u| !u.uid.is_root()).map(|u| u.dir)
}
