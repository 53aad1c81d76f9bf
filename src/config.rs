//! Configuration file parser for ~/.config/gleaner/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde, though we log a warning for each one
//! since they are usually typos.
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::dedup::{DedupPolicy, TieBreak};
use crate::sync::RetryPolicy;

/// Environment variable that overrides `sync.api_token`.
pub const SYNC_TOKEN_ENV: &str = "GLEANER_SYNC_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Feeds fetched in parallel during a refresh.
    pub refresh_concurrency: usize,

    /// Hide duplicate copies of a story in article listings.
    pub hide_duplicates: bool,

    pub dedup: DedupConfig,

    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_concurrency: 10,
            hide_duplicates: true,
            dedup: DedupConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// `[dedup]`: how the primary copy of a duplicated story is chosen.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub preference_order: Vec<TieBreak>,
    pub preferred_sources: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        let policy = DedupPolicy::default();
        Self {
            preference_order: policy.order,
            preferred_sources: policy.preferred_sources,
        }
    }
}

impl DedupConfig {
    pub fn policy(&self) -> DedupPolicy {
        DedupPolicy {
            order: self.preference_order.clone(),
            preferred_sources: self.preferred_sources.clone(),
        }
    }
}

/// `[sync]`: cloud sync endpoint and queue tuning.
///
/// Debug output masks `api_token`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    /// Bearer token (the `GLEANER_SYNC_TOKEN` env var takes precedence).
    pub api_token: Option<String>,
    pub max_retries: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub reconcile_interval_secs: u64,
    pub stuck_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_token: None,
            max_retries: 5,
            base_backoff_secs: 2,
            max_backoff_secs: 300,
            reconcile_interval_secs: 60,
            stuck_timeout_secs: 120,
            request_timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("max_retries", &self.max_retries)
            .field("base_backoff_secs", &self.base_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("reconcile_interval_secs", &self.reconcile_interval_secs)
            .field("stuck_timeout_secs", &self.stuck_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl SyncConfig {
    /// The API token, preferring the environment over the config file.
    pub fn api_token(&self) -> Option<SecretString> {
        std::env::var(SYNC_TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.api_token.clone())
            .map(SecretString::from)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: Duration::from_secs(self.base_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            stuck_timeout: Duration::from_secs(self.stuck_timeout_secs),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

const TOP_LEVEL_KEYS: &[&str] = &["refresh_concurrency", "hide_duplicates", "dedup", "sync"];
const DEDUP_KEYS: &[&str] = &["preference_order", "preferred_sources"];
const SYNC_KEYS: &[&str] = &[
    "enabled",
    "endpoint",
    "api_token",
    "max_retries",
    "base_backoff_secs",
    "max_backoff_secs",
    "reconcile_interval_secs",
    "stuck_timeout_secs",
    "request_timeout_secs",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// `~/.config/gleaner/`
    pub fn dir() -> Result<PathBuf, ConfigError> {
        let home = std::env::var("HOME")
            .map_err(|_| ConfigError::Invalid("HOME environment variable not set".to_string()))?;
        Ok(PathBuf::from(home).join(".config").join("gleaner"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warnings
    /// - Inconsistent values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check the size before reading so a huge file is never loaded.
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
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::parse(&content)?;
        tracing::info!(
            path = %path.display(),
            sync = config.sync.enabled,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse TOML text. Blank text yields the defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw, TOP_LEVEL_KEYS, "");
            if let Some(toml::Value::Table(dedup)) = raw.get("dedup") {
                warn_unknown_keys(dedup, DEDUP_KEYS, "dedup.");
            }
            if let Some(toml::Value::Table(sync)) = raw.get("sync") {
                warn_unknown_keys(sync, SYNC_KEYS, "sync.");
            }
        }

        let mut config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.refresh_concurrency == 0 {
            tracing::warn!("refresh_concurrency = 0 is not usable, using 1");
            self.refresh_concurrency = 1;
        }
        let has_endpoint = self
            .sync
            .endpoint
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        if self.sync.enabled && !has_endpoint {
            return Err(ConfigError::Invalid(
                "sync.enabled requires sync.endpoint".to_string(),
            ));
        }
        if self.sync.base_backoff_secs > self.sync.max_backoff_secs {
            return Err(ConfigError::Invalid(format!(
                "sync.base_backoff_secs ({}) exceeds sync.max_backoff_secs ({})",
                self.sync.base_backoff_secs, self.sync.max_backoff_secs
            )));
        }
        Ok(())
    }
}

fn warn_unknown_keys(table: &toml::Table, known: &[&str], prefix: &str) {
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            tracing::warn!(key = %format!("{prefix}{key}"), "Unknown key in config file, ignoring");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
