//! Preference manager that merges config.toml defaults with DB overrides.
//!
//! Config values serve as defaults; DB values (user_preferences table) override them.
//! Writes always go to the DB, never to the config file.
use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::dedup::{DedupPolicy, TieBreak};
use crate::storage::{is_sync_key, Database};

pub const HIDE_DUPLICATES: &str = "hide_duplicates";
pub const REFRESH_CONCURRENCY: &str = "refresh_concurrency";
pub const DEDUP_ORDER: &str = "dedup.preference_order";
pub const DEDUP_SOURCES: &str = "dedup.preferred_sources";

// ============================================================================
// PreferenceManager
// ============================================================================

/// Merged preference store: config.toml defaults + DB overrides.
///
/// On load, config values are flattened into a `HashMap<String, String>`, then
/// all DB preferences are layered on top. Reads are in-memory. Writes persist
/// to the DB and update the in-memory map.
pub struct PreferenceManager {
    prefs: HashMap<String, String>,
    defaults: Config,
}

impl PreferenceManager {
    /// Load preferences by merging config defaults with DB overrides.
    pub async fn load(config: &Config, db: &Database) -> Result<Self> {
        let mut prefs = Self::flatten_config(config);

        // DB wins over config
        for (key, value) in db.get_preferences().await? {
            prefs.insert(key, value);
        }

        Ok(Self {
            prefs,
            defaults: config.clone(),
        })
    }

    /// Create from config only (no DB).
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefs: Self::flatten_config(config),
            defaults: config.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.prefs.get(key).map(String::as_str)
    }

    /// Set a preference: validates known keys, writes to DB and updates the
    /// in-memory map. Sync settings are refused.
    pub async fn set(&mut self, db: &Database, key: &str, value: &str) -> Result<()> {
        anyhow::ensure!(
            !is_sync_key(key),
            "{key} is a sync setting; set it in the config file or {}",
            crate::config::SYNC_TOKEN_ENV
        );
        match key {
            HIDE_DUPLICATES => {
                value
                    .parse::<bool>()
                    .with_context(|| format!("{key} expects true or false"))?;
            }
            REFRESH_CONCURRENCY => {
                let n: usize = value
                    .parse()
                    .with_context(|| format!("{key} expects a positive number"))?;
                anyhow::ensure!(n > 0, "{key} must be at least 1");
            }
            DEDUP_ORDER => {
                DedupPolicy::parse_order(value).map_err(anyhow::Error::msg)?;
            }
            DEDUP_SOURCES => {
                serde_json::from_str::<Vec<String>>(value)
                    .with_context(|| format!("{key} expects a JSON array of strings"))?;
            }
            _ => {}
        }
        db.set_preference(key, value).await?;
        self.prefs.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Drop the stored override for `key`, falling back to the config value.
    /// Returns whether an override existed.
    pub async fn reset(&mut self, db: &Database, key: &str) -> Result<bool> {
        let removed = db.delete_preference(key).await?;
        match Self::flatten_config(&self.defaults).remove(key) {
            Some(default) => {
                self.prefs.insert(key.to_string(), default);
            }
            None => {
                self.prefs.remove(key);
            }
        }
        Ok(removed)
    }

    // ========================================================================
    // Type-safe Accessors
    // ========================================================================

    pub fn hide_duplicates(&self) -> bool {
        self.get(HIDE_DUPLICATES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.defaults.hide_duplicates)
    }

    pub fn refresh_concurrency(&self) -> usize {
        self.get(REFRESH_CONCURRENCY)
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(self.defaults.refresh_concurrency)
    }

    /// Duplicate tie-break policy. Unparseable stored values fall back to the
    /// config file's policy with a warning.
    pub fn dedup_policy(&self) -> DedupPolicy {
        let fallback = self.defaults.dedup.policy();

        let order = match self.get(DEDUP_ORDER).map(DedupPolicy::parse_order) {
            Some(Ok(order)) => order,
            Some(Err(e)) => {
                tracing::warn!(key = DEDUP_ORDER, error = %e, "Ignoring invalid preference");
                fallback.order.clone()
            }
            None => fallback.order.clone(),
        };

        let preferred_sources = match self
            .get(DEDUP_SOURCES)
            .map(serde_json::from_str::<Vec<String>>)
        {
            Some(Ok(sources)) => sources,
            Some(Err(e)) => {
                tracing::warn!(key = DEDUP_SOURCES, error = %e, "Ignoring invalid preference");
                fallback.preferred_sources
            }
            None => fallback.preferred_sources,
        };

        DedupPolicy {
            order,
            preferred_sources,
        }
    }

    // ========================================================================
    // Internal Helpers
    // ========================================================================

    /// Flatten Config struct into dotted key-value pairs.
    ///
    /// The sync section is not flattened: credentials must not enter the
    /// preference store.
    fn flatten_config(config: &Config) -> HashMap<String, String> {
        let mut map = HashMap::new();

        map.insert(
            HIDE_DUPLICATES.to_string(),
            config.hide_duplicates.to_string(),
        );
        map.insert(
            REFRESH_CONCURRENCY.to_string(),
            config.refresh_concurrency.to_string(),
        );
        map.insert(
            DEDUP_ORDER.to_string(),
            config
                .dedup
                .preference_order
                .iter()
                .map(|t| TieBreak::as_str(*t))
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Ok(sources) = serde_json::to_string(&config.dedup.preferred_sources) {
            map.insert(DEDUP_SOURCES.to_string(), sources);
        }

        map
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_load_defaults_from_config() {
        let db = test_db().await;
        let pm = PreferenceManager::load(&Config::default(), &db).await.unwrap();

        assert!(pm.hide_duplicates());
        assert_eq!(pm.refresh_concurrency(), 10);
        assert_eq!(pm.dedup_policy(), DedupPolicy::default());
        assert_eq!(pm.get(DEDUP_ORDER), Some("newest,preferred_source,most_content"));
    }

    #[tokio::test]
    async fn test_db_overrides_config() {
        let db = test_db().await;
        db.set_preference(HIDE_DUPLICATES, "false").await.unwrap();
        db.set_preference(DEDUP_ORDER, "most_content").await.unwrap();

        let pm = PreferenceManager::load(&Config::default(), &db).await.unwrap();
        assert!(!pm.hide_duplicates());
        assert_eq!(pm.dedup_policy().order, vec![TieBreak::MostContent]);
    }

    #[tokio::test]
    async fn test_set_persists_and_updates_memory() {
        let db = test_db().await;
        let mut pm = PreferenceManager::load(&Config::default(), &db).await.unwrap();

        pm.set(&db, DEDUP_SOURCES, r#"["Wire","Daily"]"#).await.unwrap();
        assert_eq!(
            pm.dedup_policy().preferred_sources,
            vec!["Wire".to_string(), "Daily".to_string()]
        );
        assert_eq!(
            db.get_preference(DEDUP_SOURCES).await.unwrap().as_deref(),
            Some(r#"["Wire","Daily"]"#)
        );

        // Survives a reload
        let pm2 = PreferenceManager::load(&Config::default(), &db).await.unwrap();
        assert_eq!(pm2.dedup_policy().preferred_sources.len(), 2);
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_values() {
        let db = test_db().await;
        let mut pm = PreferenceManager::load(&Config::default(), &db).await.unwrap();

        assert!(pm.set(&db, HIDE_DUPLICATES, "maybe").await.is_err());
        assert!(pm.set(&db, REFRESH_CONCURRENCY, "0").await.is_err());
        assert!(pm.set(&db, DEDUP_ORDER, "loudest").await.is_err());
        assert!(pm.set(&db, DEDUP_SOURCES, "not json").await.is_err());
        assert!(db.get_preferences().await.unwrap().is_empty());

        // Unknown keys are stored as-is
        pm.set(&db, "custom.key", "anything").await.unwrap();
        assert_eq!(pm.get("custom.key"), Some("anything"));
    }

    #[tokio::test]
    async fn test_sync_settings_cannot_be_set() {
        let db = test_db().await;
        let mut pm = PreferenceManager::load(&Config::default(), &db).await.unwrap();

        let err = pm.set(&db, "sync.api_token", "secret").await.unwrap_err();
        assert!(err.to_string().contains("sync setting"));
        assert_eq!(pm.get("sync.api_token"), None);
        assert!(db.get_preferences().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_restores_config_value() {
        let db = test_db().await;
        let mut config = Config::default();
        config.refresh_concurrency = 3;
        let mut pm = PreferenceManager::load(&config, &db).await.unwrap();

        pm.set(&db, REFRESH_CONCURRENCY, "8").await.unwrap();
        pm.set(&db, "custom.key", "anything").await.unwrap();
        assert_eq!(pm.refresh_concurrency(), 8);

        assert!(pm.reset(&db, REFRESH_CONCURRENCY).await.unwrap());
        assert_eq!(pm.refresh_concurrency(), 3);
        assert_eq!(pm.get(REFRESH_CONCURRENCY), Some("3"));

        // Keys without a config value disappear entirely
        assert!(pm.reset(&db, "custom.key").await.unwrap());
        assert_eq!(pm.get("custom.key"), None);
        assert!(!pm.reset(&db, "custom.key").await.unwrap());

        let reloaded = PreferenceManager::load(&config, &db).await.unwrap();
        assert_eq!(reloaded.refresh_concurrency(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_stored_value_falls_back_to_config() {
        let db = test_db().await;
        db.set_preference(DEDUP_ORDER, "loudest").await.unwrap();
        db.set_preference(REFRESH_CONCURRENCY, "zero").await.unwrap();

        let mut config = Config::default();
        config.refresh_concurrency = 3;
        let pm = PreferenceManager::load(&config, &db).await.unwrap();
        assert_eq!(pm.dedup_policy().order, DedupPolicy::default().order);
        assert_eq!(pm.refresh_concurrency(), 3);
    }

    #[tokio::test]
    async fn test_from_config_fallback() {
        let mut config = Config::default();
        config.hide_duplicates = false;
        config.dedup.preferred_sources = vec!["Example Daily".to_string()];

        let pm = PreferenceManager::from_config(&config);
        assert!(!pm.hide_duplicates());
        assert_eq!(
            pm.dedup_policy().preferred_sources,
            vec!["Example Daily".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sync_token_is_not_flattened() {
        let mut config = Config::default();
        config.sync.api_token = Some("secret".to_string());
        let pm = PreferenceManager::from_config(&config);
        assert!(pm.prefs.values().all(|v| !v.contains("secret")));
    }
}
