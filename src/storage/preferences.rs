use anyhow::{bail, Result};

use super::schema::Database;

/// Keys under this prefix belong to the config file's `[sync]` section and
/// are never stored as preferences.
pub const SYNC_KEY_PREFIX: &str = "sync.";

pub fn is_sync_key(key: &str) -> bool {
    key.get(..SYNC_KEY_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(SYNC_KEY_PREFIX))
}

impl Database {
    // ========================================================================
    // Preference Overrides
    // ========================================================================

    /// Stored override for `key`, if one was set.
    pub async fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM user_preferences WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Store an override for `key`, replacing any earlier one.
    ///
    /// Sync settings (`sync.*`) are refused: credentials and endpoints only
    /// come from the config file or the environment.
    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            bail!("Preference key must not be empty");
        }
        if is_sync_key(key) {
            bail!("'{}' is a sync setting; set it in the config file instead", key);
        }

        sqlx::query(
            r#"
            INSERT INTO user_preferences (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop the override for `key` so the config value applies again.
    /// Returns whether an override existed.
    pub async fn delete_preference(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_preferences WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every stored override, ordered by key.
    ///
    /// `sync.*` rows left by older versions are skipped.
    pub async fn get_preferences(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM user_preferences ORDER BY key")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().filter(|(key, _)| !is_sync_key(key)).collect())
    }
}
