//! Configuration file parser for ~/.config/catalog-mirror/config.toml.
//!
//! The config file is optional. A missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::feed::MAX_PAGE_SIZE;

/// Overrides `site_id` from the file.
pub const ENV_SITE_ID: &str = "CATALOG_MIRROR_SITE_ID";
/// Overrides `feed_base_url` from the file.
pub const ENV_FEED_URL: &str = "CATALOG_MIRROR_FEED_URL";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Well-formed TOML with a value outside its allowed range.
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Feed endpoint, e.g. `https://feeds.example.com/v2/json`.
    pub feed_base_url: String,

    /// Default site identifier; `sync --site` wins over this.
    pub site_id: String,

    /// Items per feed page (1..=96).
    pub page_size: u32,

    /// Per-request timeout for feed calls.
    pub request_timeout_secs: u64,

    /// Platform tag under which promoted items live in the primary catalog.
    pub platform_tag: String,

    /// Primary catalog database. Reconciliation is skipped when unset.
    pub primary_db_path: Option<PathBuf>,

    /// Capacity of the streaming progress channel.
    pub progress_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_base_url: String::new(),
            site_id: String::new(),
            page_size: MAX_PAGE_SIZE,
            request_timeout_secs: 30,
            platform_tag: "feed".to_string(),
            primary_db_path: None,
            progress_buffer: 64,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "feed_base_url",
        "site_id",
        "page_size",
        "request_timeout_secs",
        "platform_tag",
        "primary_db_path",
        "progress_buffer",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            site = %config.site_id,
            page_size = config.page_size,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load the file, then apply environment overrides from the process env.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `CATALOG_MIRROR_*` overrides. Empty values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(site) = present(ENV_SITE_ID) {
            tracing::debug!(site = %site, "Site id overridden from environment");
            self.site_id = site;
        }
        if let Some(url) = present(ENV_FEED_URL) {
            tracing::debug!(url = %url, "Feed URL overridden from environment");
            self.feed_base_url = url;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.progress_buffer == 0 {
            return Err(ConfigError::Invalid(
                "progress_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
