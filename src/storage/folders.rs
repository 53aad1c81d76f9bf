use anyhow::{bail, Result};

use super::schema::Database;
use super::types::Folder;
use crate::util::strip_control_chars;

/// Upper bound on ancestor walks. A chain this long can only come from
/// corrupted data, and stopping keeps a cycle from hanging the walk.
const MAX_ANCESTOR_WALK: usize = 256;

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    /// Strip control characters and surrounding whitespace; reject empty names.
    fn sanitize_folder_name(name: &str) -> Result<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            bail!("Folder name cannot be empty or whitespace-only");
        }
        Ok(trimmed.to_owned())
    }

    /// Create a folder, optionally inside `parent_id`, returning its id.
    pub async fn create_folder(&self, name: &str, parent_id: Option<i64>) -> Result<i64> {
        let clean_name = Self::sanitize_folder_name(name)?;

        if let Some(pid) = parent_id {
            if self.get_folder(pid).await?.is_none() {
                bail!("Parent folder {} does not exist", pid);
            }
        }

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO folders (name, parent_id, sort_order)
            VALUES (?1, ?2, (SELECT COALESCE(MAX(sort_order), -1) + 1 FROM folders
                             WHERE parent_id IS ?2))
            RETURNING id
        "#,
        )
        .bind(&clean_name)
        .bind(parent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn rename_folder(&self, id: i64, new_name: &str) -> Result<()> {
        let clean_name = Self::sanitize_folder_name(new_name)?;
        sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
            .bind(&clean_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a folder. Its child folders and feeds move up to the deleted
    /// folder's parent (or to the top level).
    pub async fn delete_folder(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let parent: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT parent_id FROM folders WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((parent_id,)) = parent else {
            bail!("Folder {} does not exist", id);
        };

        sqlx::query("UPDATE folders SET parent_id = ? WHERE parent_id = ?")
            .bind(parent_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE feeds SET folder_id = ? WHERE folder_id = ?")
            .bind(parent_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Reparent a folder, or move it to the top level with `None`.
    ///
    /// The folder tree must stay acyclic: before updating, the ancestors of
    /// `new_parent` are walked and the move is rejected if `id` is among them
    /// (which includes moving a folder into itself).
    pub async fn move_folder(&self, id: i64, new_parent: Option<i64>) -> Result<()> {
        if self.get_folder(id).await?.is_none() {
            bail!("Folder {} does not exist", id);
        }

        if let Some(target) = new_parent {
            if target == id {
                bail!("A folder cannot be its own parent");
            }
            let ancestors = self.folder_ancestors(target).await?;
            if ancestors.contains(&id) {
                bail!(
                    "Cannot move folder {} into {}: the target is inside the folder being moved",
                    id,
                    target
                );
            }
        }

        sqlx::query("UPDATE folders SET parent_id = ? WHERE id = ?")
            .bind(new_parent)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a feed into a folder, or to the top level if `folder_id` is `None`.
    pub async fn move_feed_to_folder(&self, feed_id: i64, folder_id: Option<i64>) -> Result<()> {
        if let Some(fid) = folder_id {
            if self.get_folder(fid).await?.is_none() {
                bail!("Folder {} does not exist", fid);
            }
        }
        sqlx::query("UPDATE feeds SET folder_id = ? WHERE id = ?")
            .bind(folder_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_folder(&self, id: i64) -> Result<Option<Folder>> {
        let row: Option<(i64, String, Option<i64>, i64)> =
            sqlx::query_as("SELECT id, name, parent_id, sort_order FROM folders WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name, parent_id, sort_order)| Folder {
            id,
            name,
            parent_id,
            sort_order,
        }))
    }

    /// All folders as a flat list; callers build the tree from `parent_id`.
    pub async fn get_folders(&self) -> Result<Vec<Folder>> {
        let rows: Vec<(i64, String, Option<i64>, i64)> = sqlx::query_as(
            "SELECT id, name, parent_id, sort_order FROM folders ORDER BY sort_order, name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, parent_id, sort_order)| Folder {
                id,
                name,
                parent_id,
                sort_order,
            })
            .collect())
    }

    /// Ids on the path from `id` up to the root, starting with `id` itself.
    async fn folder_ancestors(&self, id: i64) -> Result<Vec<i64>> {
        let mut chain = vec![id];
        let mut current = id;

        while chain.len() <= MAX_ANCESTOR_WALK {
            let parent: Option<(Option<i64>,)> =
                sqlx::query_as("SELECT parent_id FROM folders WHERE id = ?")
                    .bind(current)
                    .fetch_optional(&self.pool)
                    .await?;
            match parent {
                Some((Some(pid),)) => {
                    if chain.contains(&pid) {
                        tracing::warn!(folder_id = id, parent_id = pid, "Folder cycle found in stored data");
                        bail!("Folder hierarchy is corrupted: cycle through folder {}", pid);
                    }
                    chain.push(pid);
                    current = pid;
                }
                _ => return Ok(chain),
            }
        }

        bail!("Folder hierarchy deeper than {} levels", MAX_ANCESTOR_WALK)
    }
}
