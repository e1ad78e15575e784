//! Configuration management for Strata.
//!
//! This module provides configuration loading, saving, and defaults.
//! Configuration is stored in TOML format in a platform-appropriate location.

use crate::error::{Result, StrataError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure for Strata.
///
/// ## Example Configuration File (strata.toml)
///
/// ```toml
/// [general]
/// storage_path = "/var/lib/strata"
/// log_level = "info"
///
/// [exclude]
/// paths = ["/project/.git", "/project/logs"]
///
/// [indexing]
/// debounce_ms = 750
/// max_batch_wait_ms = 3000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Directories excluded from change tracking
    pub exclude: ExcludeConfig,

    /// Background indexing tuning
    pub indexing: IndexingConfig,
}

/// General configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Storage root location (None = platform default)
    pub storage_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            storage_path: None,
            log_level: "info".to_string(),
        }
    }
}

/// Exclusion configuration: events under these prefixes never matter for
/// indexing (configuration and log directories, typically).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExcludeConfig {
    /// Path prefixes to skip entirely
    pub paths: Vec<PathBuf>,
}

/// Background indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Quiet window after a change before an update task is queued
    pub debounce_ms: u64,

    /// Upper bound on how long changes may accumulate before an update
    /// task is queued regardless of further events
    pub max_batch_wait_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        IndexingConfig {
            debounce_ms: 750,
            max_batch_wait_ms: 3000,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default config if no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }

        info!(path = %path.display(), "Loading configuration");
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| StrataError::ConfigError {
            reason: format!("Failed to parse config: {}", e),
        })?;

        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Saving configuration");
        let contents = toml::to_string_pretty(self).map_err(|e| StrataError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "strata").ok_or_else(|| StrataError::ConfigError {
            reason: "Could not determine config directory".to_string(),
        })?;

        Ok(dirs.config_dir().join("strata.toml"))
    }

    /// Get the default storage directory path.
    pub fn default_storage_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "strata").ok_or_else(|| StrataError::ConfigError {
            reason: "Could not determine data directory".to_string(),
        })?;

        Ok(dirs.data_dir().to_path_buf())
    }

    /// Get the storage root (from config or default).
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.general.storage_path {
            Ok(path.clone())
        } else {
            Self::default_storage_dir()
        }
    }

    /// Prefixes the change tracker should skip: explicit exclusions plus
    /// the storage root itself.
    pub fn skip_prefixes(&self) -> Result<Vec<PathBuf>> {
        let mut prefixes = self.exclude.paths.clone();
        prefixes.push(self.storage_dir()?);
        Ok(prefixes)
    }
}
