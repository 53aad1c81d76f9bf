use anyhow::{Context, Result};

use super::schema::Database;
use crate::rules::{MatchMode, Rule, SmartFolder};

impl Database {
    // ========================================================================
    // Smart Folder Operations
    // ========================================================================

    /// Save a smart folder, replacing any folder with the same name.
    /// Rules are stored as a JSON array.
    pub async fn save_smart_folder(&self, folder: &SmartFolder) -> Result<i64> {
        folder.validate()?;
        let rules = serde_json::to_string(&folder.rules)?;
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO smart_folders (name, match_mode, rules, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                match_mode = excluded.match_mode,
                rules = excluded.rules,
                updated_at = excluded.updated_at
            RETURNING id
        "#,
        )
        .bind(&folder.name)
        .bind(folder.mode.as_str())
        .bind(&rules)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_smart_folder(&self, name: &str) -> Result<Option<SmartFolder>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT name, match_mode, rules FROM smart_folders WHERE name = ?",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode_smart_folder).transpose()
    }

    pub async fn get_smart_folders(&self) -> Result<Vec<SmartFolder>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT name, match_mode, rules FROM smart_folders ORDER BY name COLLATE NOCASE",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_smart_folder).collect()
    }

    pub async fn delete_smart_folder(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM smart_folders WHERE name = ?")
            .bind(name.trim())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn decode_smart_folder((name, mode, rules): (String, String, String)) -> Result<SmartFolder> {
    let mode: MatchMode = mode.parse()?;
    let rules: Vec<Rule> = serde_json::from_str(&rules)
        .with_context(|| format!("Corrupt rule list for smart folder '{}'", name))?;
    let folder = SmartFolder { name, mode, rules };
    folder.validate()?;
    Ok(folder)
}
