use anyhow::{bail, Result};

use super::schema::Database;
use super::types::{ItemType, Tag, TaggedItem};
use crate::util::{normalize_link, strip_control_chars};

impl Database {
    // ========================================================================
    // Tag Operations
    // ========================================================================

    fn sanitize_tag_name(name: &str) -> Result<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            bail!("Tag name cannot be empty or whitespace-only");
        }
        Ok(trimmed.to_owned())
    }

    /// Create a tag (or update the color of an existing one), returning its id.
    pub async fn create_tag(&self, name: &str, color: Option<&str>) -> Result<i64> {
        let clean_name = Self::sanitize_tag_name(name)?;
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tags (name, color) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET color = COALESCE(excluded.color, tags.color)
            RETURNING id
        "#,
        )
        .bind(&clean_name)
        .bind(color)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_tag_by_name(&self, name: &str) -> Result<Option<Tag>> {
        let tag = sqlx::query_as::<_, Tag>("SELECT id, name, color FROM tags WHERE name = ?")
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(tag)
    }

    pub async fn get_tags(&self) -> Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>(
            "SELECT id, name, color FROM tags ORDER BY name COLLATE NOCASE",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    /// Delete a tag and (via ON DELETE CASCADE) all its associations.
    pub async fn delete_tag(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tags WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Tagged Items
    // ========================================================================

    /// Attach a tag to an item. Idempotent; returns whether a new
    /// association was created.
    pub async fn tag_item(&self, tag_id: i64, item_id: &str, item_type: ItemType) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tagged_items (tag_id, item_id, item_type, created_at)
            VALUES (?, ?, ?, ?)
        "#,
        )
        .bind(tag_id)
        .bind(normalize_link(item_id))
        .bind(item_type.as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Detach a tag from an item, returning whether an association existed.
    pub async fn untag_item(&self, tag_id: i64, item_id: &str, item_type: ItemType) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM tagged_items WHERE tag_id = ? AND item_id = ? AND item_type = ?",
        )
        .bind(tag_id)
        .bind(normalize_link(item_id))
        .bind(item_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Tags attached to one item, ordered by name.
    pub async fn tags_for_item(&self, item_id: &str, item_type: ItemType) -> Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>(
            r#"
            SELECT t.id, t.name, t.color FROM tags t
            JOIN tagged_items ti ON ti.tag_id = t.id
            WHERE ti.item_id = ? AND ti.item_type = ?
            ORDER BY t.name COLLATE NOCASE
        "#,
        )
        .bind(normalize_link(item_id))
        .bind(item_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    /// Items carrying a tag, optionally restricted to one item type.
    pub async fn items_for_tag(
        &self,
        tag_id: i64,
        item_type: Option<ItemType>,
    ) -> Result<Vec<TaggedItem>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT tag_id, item_id, item_type FROM tagged_items
            WHERE tag_id = ?1 AND (?2 IS NULL OR item_type = ?2)
            ORDER BY created_at, item_id
        "#,
        )
        .bind(tag_id)
        .bind(item_type.map(ItemType::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(tag_id, item_id, item_type)| {
                Ok::<_, anyhow::Error>(TaggedItem {
                    tag_id,
                    item_id,
                    item_type: item_type.parse()?,
                })
            })
            .collect()
    }
}
