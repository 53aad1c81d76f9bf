use anyhow::Result;

use super::schema::Database;
use crate::sync::{QueuedOperation, SyncOperation};

impl Database {
    // ========================================================================
    // Sync Queue Operations
    // ========================================================================

    /// Persist a sync operation, due immediately. Returns the queue id.
    pub async fn enqueue_sync_operation(&self, op: &SyncOperation, now_ms: i64) -> Result<i64> {
        let payload = serde_json::to_string(op)?;
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sync_queue (payload, retry_count, enqueued_at, next_attempt_at)
            VALUES (?, 0, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&payload)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Load the queue in FIFO order.
    ///
    /// Rows whose payload no longer decodes are deleted with a warning; they
    /// can never be delivered.
    pub async fn load_sync_operations(&self) -> Result<Vec<QueuedOperation>> {
        let rows: Vec<(i64, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, payload, retry_count, enqueued_at, next_attempt_at FROM sync_queue ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut ops = Vec::with_capacity(rows.len());
        for (id, payload, retry_count, enqueued_at, next_attempt_at) in rows {
            match serde_json::from_str::<SyncOperation>(&payload) {
                Ok(operation) => ops.push(QueuedOperation {
                    id,
                    operation,
                    retry_count: u32::try_from(retry_count).unwrap_or(0),
                    enqueued_at,
                    next_attempt_at,
                }),
                Err(e) => {
                    tracing::warn!(id = id, error = %e, "Dropping undecodable sync operation");
                    self.remove_sync_operation(id).await?;
                }
            }
        }
        Ok(ops)
    }

    pub async fn update_sync_retry(
        &self,
        id: i64,
        retry_count: u32,
        next_attempt_at: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE sync_queue SET retry_count = ?, next_attempt_at = ? WHERE id = ?")
            .bind(i64::from(retry_count))
            .bind(next_attempt_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_sync_operation(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
