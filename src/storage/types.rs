use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another instance of gleaner appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Map lock-related sqlx errors to [`DatabaseError::InstanceLocked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface
/// through the error text only.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("database is locked")
        || lower.contains("database table is locked")
        || lower.contains("sqlite_busy")
        || lower.contains("sqlite_locked")
        || lower.contains("unable to open database file")
}

// ============================================================================
// Item Types
// ============================================================================

/// Kind of item a tag is attached to.
///
/// Together with the tag id and the item's normalized link/url this forms the
/// key of a tagged-item association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Article,
    Feed,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Article => "article",
            ItemType::Feed => "feed",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown item type: {0}")]
pub struct UnknownItemType(pub String);

impl FromStr for ItemType {
    type Err = UnknownItemType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "article" => Ok(ItemType::Article),
            "feed" => Ok(ItemType::Feed),
            other => Err(UnknownItemType(other.to_owned())),
        }
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// An article as parsed from a feed document, before it is stored.
///
/// `link` is already normalized by the parser.
#[derive(Debug, Clone, Default)]
pub struct ParsedArticle {
    pub link: String,
    pub title: String,
    pub pub_date: Option<i64>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
}

/// Row type for feed queries with unread count
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub fetch_url: String,
    pub html_url: Option<String>,
    pub last_updated: Option<i64>,
    pub error: Option<String>,
    pub unread_count: i64,
    pub consecutive_failures: i64,
    pub folder_id: Option<i64>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            title: Arc::from(self.title),
            url: self.url,
            fetch_url: self.fetch_url,
            html_url: self.html_url,
            last_updated: self.last_updated,
            error: self.error,
            unread_count: self.unread_count,
            consecutive_failures: self.consecutive_failures,
            folder_id: self.folder_id,
        }
    }
}

/// Internal row type for Article queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub link: String,
    pub title: String,
    pub pub_date: Option<i64>,
    pub source: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub is_read: bool,
    pub fetched_at: i64,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_id: self.feed_id,
            link: self.link,
            title: Arc::from(self.title),
            pub_date: self.pub_date,
            source: Arc::from(self.source),
            author: self.author,
            description: self.description,
            content: self.content,
            is_read: self.is_read,
            fetched_at: self.fetched_at,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database.
///
/// `url` is the normalized feed url and is unique; `fetch_url` is the
/// address as subscribed. `title` is an `Arc<str>` so article listings can
/// share it cheaply.
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub title: Arc<str>,
    pub url: String,
    pub fetch_url: String,
    pub html_url: Option<String>,
    pub last_updated: Option<i64>,
    pub error: Option<String>,
    pub unread_count: i64,
    /// Number of consecutive fetch failures (circuit breaker)
    pub consecutive_failures: i64,
    pub folder_id: Option<i64>,
}

/// Article data from database.
///
/// Identity is the normalized `link`; `source` is the title of the feed the
/// article came from at the time it was stored.
#[derive(Debug, Clone)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub link: String,
    pub title: Arc<str>,
    pub pub_date: Option<i64>,
    pub source: Arc<str>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub is_read: bool,
    pub fetched_at: i64,
}

impl Article {
    /// Length of the richest body text available, used to prefer fuller copies
    /// of a story.
    pub fn content_len(&self) -> usize {
        self.content
            .as_deref()
            .or(self.description.as_deref())
            .map(|s| s.chars().count())
            .unwrap_or(0)
    }
}

/// Article query options.
#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    pub feed_id: Option<i64>,
    pub unread_only: bool,
    pub limit: Option<i64>,
}

/// A folder grouping feeds. Folders nest through `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub sort_order: i64,
}

/// A user-defined tag.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
}

/// One tag-to-item association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedItem {
    pub tag_id: i64,
    pub item_id: String,
    pub item_type: ItemType,
}
