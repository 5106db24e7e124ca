//! Application configuration management.
//!
//! This module handles loading the configuration, which names the API base
//! URL and the token refresh and retry policy.
//!
//! Configuration is stored at `~/.config/markethub/config.json`. The
//! `MARKETHUB_API_URL` environment variable overrides the file's base URL.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_MAX_RETRIES;
use crate::auth::DEFAULT_REFRESH_INTERVAL_MINUTES;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "markethub";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the API base URL
pub const BASE_URL_ENV: &str = "MARKETHUB_API_URL";

/// HTTP request timeout in seconds.
/// 30s allows for slow uploads while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

fn default_refresh_minutes() -> i64 {
    DEFAULT_REFRESH_INTERVAL_MINUTES
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub base_url: Option<String>,
    #[serde(default = "default_refresh_minutes")]
    pub token_refresh_minutes: i64,
    #[serde(default = "default_max_retries")]
    pub max_unauthorized_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            token_refresh_minutes: default_refresh_minutes(),
            max_unauthorized_retries: default_max_retries(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Config {
    /// Load the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_file(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Self = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config
                .refresh_interval()
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(BASE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.base_url = Some(url.trim().to_string());
        }
    }

    pub fn require_base_url(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No API base URL configured (set {})", BASE_URL_ENV))
    }

    /// Token refresh interval. Must be a positive number of minutes that
    /// fits a `chrono::Duration`.
    pub fn refresh_interval(&self) -> Result<Duration> {
        Duration::try_minutes(self.token_refresh_minutes)
            .filter(|interval| *interval > Duration::zero())
            .with_context(|| {
                format!(
                    "token_refresh_minutes must be a positive number of minutes, got {}",
                    self.token_refresh_minutes
                )
            })
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the persistent credential file.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
