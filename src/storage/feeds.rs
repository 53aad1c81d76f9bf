use anyhow::Result;

use super::schema::Database;
use super::types::{Feed, FeedDbRow, ParsedArticle};
use crate::util::normalize_link;

const FEED_COLUMNS: &str = r#"
    f.id, f.title, f.url, f.fetch_url, f.html_url, f.last_updated, f.error,
    COUNT(CASE WHEN a.is_read = 0 THEN 1 END) AS unread_count,
    f.consecutive_failures, f.folder_id
"#;

impl Database {
    /// Consecutive failures after which `refresh_all` stops trying a feed.
    pub const CIRCUIT_BREAKER_THRESHOLD: i64 = 5;

    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Subscribe to a feed, returning its id.
    ///
    /// The normalized url is the feed's identity; the url as given is kept
    /// for fetching. Subscribing to an existing url updates its title (and
    /// `html_url` when one is given).
    pub async fn insert_feed(
        &self,
        url: &str,
        title: &str,
        html_url: Option<&str>,
    ) -> Result<i64> {
        let fetch_url = url.trim();
        let url = normalize_link(fetch_url);
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, fetch_url, html_url) VALUES (?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                fetch_url = excluded.fetch_url,
                html_url = COALESCE(excluded.html_url, feeds.html_url)
            RETURNING id
        "#,
        )
        .bind(title)
        .bind(&url)
        .bind(fetch_url)
        .bind(html_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Unsubscribe from a feed. Its articles go with it (ON DELETE CASCADE),
    /// as do tag associations on the feed and its articles.
    ///
    /// Returns whether a feed was removed.
    pub async fn remove_feed(&self, url: &str) -> Result<bool> {
        let url = normalize_link(url);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM tagged_items
            WHERE (item_type = 'feed' AND item_id = ?1)
               OR (item_type = 'article' AND item_id IN (
                    SELECT a.link FROM articles a
                    JOIN feeds f ON f.id = a.feed_id
                    WHERE f.url = ?1))
        "#,
        )
        .bind(&url)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM feeds WHERE url = ?")
            .bind(&url)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// All feeds with their unread article counts, ordered by title.
    pub async fn get_feeds(&self) -> Result<Vec<Feed>> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds f LEFT JOIN articles a ON f.id = a.feed_id \
             GROUP BY f.id ORDER BY f.title COLLATE NOCASE"
        );
        let rows: Vec<FeedDbRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Look up one feed by url (normalized before matching).
    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds f LEFT JOIN articles a ON f.id = a.feed_id \
             WHERE f.url = ? GROUP BY f.id"
        );
        let row: Option<FeedDbRow> = sqlx::query_as(&sql)
            .bind(normalize_link(url))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Look up one feed by id.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds f LEFT JOIN articles a ON f.id = a.feed_id \
             WHERE f.id = ? GROUP BY f.id"
        );
        let row: Option<FeedDbRow> = sqlx::query_as(&sql)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Record (or clear) the last fetch error for a feed.
    pub async fn set_feed_error(&self, feed_id: i64, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE feeds SET error = ? WHERE id = ?")
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update error status for many feeds in a single transaction.
    pub async fn batch_set_feed_errors(&self, updates: &[(i64, Option<String>)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (feed_id, error) in updates {
            sqlx::query("UPDATE feeds SET error = ? WHERE id = ?")
                .bind(error.as_deref())
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Increment the consecutive failure count, returning the new value.
    pub async fn increment_feed_failures(&self, feed_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "UPDATE feeds SET consecutive_failures = consecutive_failures + 1 WHERE id = ? \
             RETURNING consecutive_failures",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Store the result of a successful fetch atomically: upsert articles,
    /// clear the error, reset the circuit breaker and stamp `last_updated`.
    ///
    /// Returns the number of newly inserted articles.
    pub async fn complete_feed_refresh(
        &self,
        feed_id: i64,
        articles: &[ParsedArticle],
    ) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let source: (String,) = sqlx::query_as("SELECT title FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_one(&mut *tx)
            .await?;

        let inserted = Self::upsert_articles_in(&mut tx, feed_id, &source.0, articles, now).await?;

        sqlx::query(
            "UPDATE feeds SET error = NULL, consecutive_failures = 0, last_updated = ? WHERE id = ?",
        )
        .bind(now)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }
}
