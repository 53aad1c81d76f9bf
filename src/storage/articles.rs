use anyhow::Result;
use sqlx::{QueryBuilder, Sqlite, Transaction};

use super::schema::Database;
use super::types::{Article, ArticleDbRow, ArticleFilter, ParsedArticle};
use crate::util::normalize_link;

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

/// Rows per INSERT statement; 9 columns * 50 stays well under SQLite's
/// 999 bound-parameter limit.
const BATCH_SIZE: usize = 50;

const ARTICLE_COLUMNS: &str =
    "id, feed_id, link, title, pub_date, source, author, description, content, is_read, fetched_at";

impl Database {
    // ========================================================================
    // Article Operations
    // ========================================================================

    /// Upsert articles for a feed, returning the number of new articles.
    ///
    /// Articles are keyed by normalized link. For existing articles the
    /// metadata is refreshed while `is_read` is preserved, and stored content
    /// is only replaced when the feed supplies new content.
    pub async fn upsert_articles(&self, feed_id: i64, articles: &[ParsedArticle]) -> Result<usize> {
        if articles.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let source: (String,) = sqlx::query_as("SELECT title FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_one(&mut *tx)
            .await?;
        let inserted = Self::upsert_articles_in(&mut tx, feed_id, &source.0, articles, now).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Two-phase upsert inside an open transaction: `INSERT OR IGNORE` counts
    /// new rows, then an UPDATE per article refreshes metadata.
    pub(crate) async fn upsert_articles_in(
        tx: &mut Transaction<'_, Sqlite>,
        feed_id: i64,
        source: &str,
        articles: &[ParsedArticle],
        now: i64,
    ) -> Result<usize> {
        let mut inserted = 0usize;

        for chunk in articles.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO articles \
                 (feed_id, link, title, pub_date, source, author, description, content, fetched_at) ",
            );
            builder.push_values(chunk, |mut b, article| {
                b.push_bind(feed_id)
                    .push_bind(normalize_link(&article.link))
                    .push_bind(&article.title)
                    .push_bind(article.pub_date)
                    .push_bind(source)
                    .push_bind(&article.author)
                    .push_bind(&article.description)
                    .push_bind(&article.content)
                    .push_bind(now);
            });
            let result = builder.build().execute(&mut **tx).await?;
            inserted += result.rows_affected() as usize;
        }

        for article in articles {
            // fetched_at is left alone so it keeps meaning "first seen".
            sqlx::query(
                r#"
                UPDATE articles SET
                    title = ?, pub_date = ?, author = ?, description = ?,
                    content = COALESCE(?, content)
                WHERE link = ?
            "#,
            )
            .bind(&article.title)
            .bind(article.pub_date)
            .bind(&article.author)
            .bind(&article.description)
            .bind(&article.content)
            .bind(normalize_link(&article.link))
            .execute(&mut **tx)
            .await?;
        }

        Ok(inserted)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Query articles newest first. The limit defaults to 500 and is capped
    /// at 2000.
    pub async fn get_articles(&self, filter: &ArticleFilter) -> Result<Vec<Article>> {
        let limit = filter.limit.unwrap_or(500).clamp(0, MAX_ARTICLES);

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE 1 = 1"));
        if let Some(feed_id) = filter.feed_id {
            builder.push(" AND feed_id = ").push_bind(feed_id);
        }
        if filter.unread_only {
            builder.push(" AND is_read = 0");
        }
        builder
            .push(" ORDER BY pub_date DESC, fetched_at DESC, id DESC LIMIT ")
            .push_bind(limit);

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Look up one article by link (normalized before matching).
    pub async fn get_article_by_link(&self, link: &str) -> Result<Option<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE link = ?");
        let row: Option<ArticleDbRow> = sqlx::query_as(&sql)
            .bind(normalize_link(link))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ArticleDbRow::into_article))
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set the read state of an article, returning whether anything changed.
    ///
    /// Idempotent: the row is only touched when the state differs.
    pub async fn set_read(&self, link: &str, read: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE articles SET is_read = ?1 WHERE link = ?2 AND is_read != ?1")
            .bind(read)
            .bind(normalize_link(link))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark all unread articles as read, for one feed or for all feeds.
    ///
    /// Returns the links that changed so callers can propagate them.
    pub async fn mark_all_read(&self, feed_id: Option<i64>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = match feed_id {
            Some(feed_id) => {
                sqlx::query_as(
                    "UPDATE articles SET is_read = 1 WHERE feed_id = ? AND is_read = 0 RETURNING link",
                )
                .bind(feed_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("UPDATE articles SET is_read = 1 WHERE is_read = 0 RETURNING link")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|(link,)| link).collect())
    }

    // ========================================================================
    // Offline Content
    // ========================================================================

    /// Cached full content of an article, if any.
    pub async fn get_article_content(&self, link: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT content FROM articles WHERE link = ?")
                .bind(normalize_link(link))
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(content,)| content))
    }

    /// Store full content for offline reading. Returns whether the article
    /// exists.
    pub async fn set_article_content(&self, link: &str, content: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE articles SET content = ? WHERE link = ?")
            .bind(content)
            .bind(normalize_link(link))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{ArticleFilter, Database, ParsedArticle};

    async fn test_db_with_feed() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .insert_feed("https://example.com/feed", "Example Daily", None)
            .await
            .unwrap();
        (db, feed_id)
    }

    fn parsed(link: &str, title: &str, pub_date: i64) -> ParsedArticle {
        ParsedArticle {
            link: link.to_string(),
            title: title.to_string(),
            pub_date: Some(pub_date),
            description: Some(format!("About {title}")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_counts_only_new_articles() {
        let (db, feed_id) = test_db_with_feed().await;

        let first = db
            .upsert_articles(feed_id, &[parsed("https://example.com/a", "A", 1)])
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = db
            .upsert_articles(
                feed_id,
                &[
                    parsed("http://www.example.com/a/", "A (updated)", 1),
                    parsed("https://example.com/b", "B", 2),
                ],
            )
            .await
            .unwrap();
        assert_eq!(second, 1);

        let a = db
            .get_article_by_link("https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&*a.title, "A (updated)");
        assert_eq!(&*a.source, "Example Daily");
    }

    #[tokio::test]
    async fn test_upsert_preserves_read_state_and_content() {
        let (db, feed_id) = test_db_with_feed().await;
        db.upsert_articles(feed_id, &[parsed("https://example.com/a", "A", 1)])
            .await
            .unwrap();
        db.set_read("https://example.com/a", true).await.unwrap();
        db.set_article_content("https://example.com/a", "full text")
            .await
            .unwrap();

        db.upsert_articles(feed_id, &[parsed("https://example.com/a", "A", 1)])
            .await
            .unwrap();

        let a = db
            .get_article_by_link("https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert!(a.is_read);
        assert_eq!(a.content.as_deref(), Some("full text"));
    }

    #[tokio::test]
    async fn test_set_read_is_idempotent() {
        let (db, feed_id) = test_db_with_feed().await;
        db.upsert_articles(feed_id, &[parsed("https://example.com/a", "A", 1)])
            .await
            .unwrap();

        assert!(db.set_read("https://example.com/a", true).await.unwrap());
        assert!(!db.set_read("https://example.com/a", true).await.unwrap());
        assert!(db.set_read("https://example.com/a", false).await.unwrap());
        assert!(!db.set_read("https://example.com/missing", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_articles_filters_and_orders() {
        let (db, feed_id) = test_db_with_feed().await;
        db.upsert_articles(
            feed_id,
            &[
                parsed("https://example.com/old", "Old", 100),
                parsed("https://example.com/new", "New", 300),
                parsed("https://example.com/mid", "Mid", 200),
            ],
        )
        .await
        .unwrap();
        db.set_read("https://example.com/mid", true).await.unwrap();

        let all = db.get_articles(&ArticleFilter::default()).await.unwrap();
        let titles: Vec<&str> = all.iter().map(|a| &*a.title).collect();
        assert_eq!(titles, vec!["New", "Mid", "Old"]);

        let unread = db
            .get_articles(&ArticleFilter {
                unread_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unread.len(), 2);

        let limited = db
            .get_articles(&ArticleFilter {
                feed_id: Some(feed_id),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(&*limited[0].title, "New");
    }

    #[tokio::test]
    async fn test_mark_all_read_returns_changed_links() {
        let (db, feed_id) = test_db_with_feed().await;
        db.upsert_articles(
            feed_id,
            &[
                parsed("https://example.com/a", "A", 1),
                parsed("https://example.com/b", "B", 2),
            ],
        )
        .await
        .unwrap();
        db.set_read("https://example.com/a", true).await.unwrap();

        let changed = db.mark_all_read(Some(feed_id)).await.unwrap();
        assert_eq!(changed, vec!["https://example.com/b".to_string()]);
        assert!(db.mark_all_read(None).await.unwrap().is_empty());
    }
}
