//! The local library: every user-facing write goes through here so it is
//! stored locally and, when sync is on, queued for the other devices.
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::dedup::remove_duplicates;
use crate::feed::fetch_page;
use crate::preferences::PreferenceManager;
use crate::rules::{evaluate, SmartFolder};
use crate::storage::{Article, ArticleFilter, Database, Feed, ItemType};
use crate::sync::{now_ms, SyncOperation, SyncQueue};
use crate::util::{normalize_link, validate_feed_url};

pub struct Library {
    db: Database,
    prefs: PreferenceManager,
    queue: Option<Arc<SyncQueue>>,
}

impl Library {
    /// `queue` is `None` when sync is disabled; writes are then local only.
    pub fn new(db: Database, prefs: PreferenceManager, queue: Option<Arc<SyncQueue>>) -> Self {
        Self { db, prefs, queue }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn preferences(&self) -> &PreferenceManager {
        &self.prefs
    }

    async fn record(&self, op: SyncOperation) -> Result<()> {
        if let Some(queue) = &self.queue {
            tracing::debug!(op = %op, "Queueing sync operation");
            queue
                .enqueue(op, now_ms())
                .await
                .context("Failed to queue change for sync")?;
        }
        Ok(())
    }

    // ========================================================================
    // Feeds
    // ========================================================================

    /// Subscribe to a feed after checking the url is safe to fetch.
    pub async fn subscribe(&self, url: &str, title: &str) -> Result<Feed> {
        let parsed = validate_feed_url(url)?;
        let title = title.trim();
        let title = if title.is_empty() { parsed.as_str() } else { title };

        let id = self.db.insert_feed(parsed.as_str(), title, None).await?;
        let feed = self
            .db
            .get_feed(id)
            .await?
            .context("Feed vanished right after insert")?;

        self.record(SyncOperation::AddFeed {
            url: feed.url.clone(),
            title: feed.title.to_string(),
        })
        .await?;
        tracing::info!(url = %feed.url, "Subscribed");
        Ok(feed)
    }

    /// Returns whether a subscription existed. Tags on the feed go with it.
    pub async fn unsubscribe(&self, url: &str) -> Result<bool> {
        let url = normalize_link(url);
        let tags = self.db.tags_for_item(&url, ItemType::Feed).await?;
        if !self.db.remove_feed(&url).await? {
            return Ok(false);
        }
        for tag in tags {
            self.record(SyncOperation::UntagItem {
                tag: tag.name,
                item_type: ItemType::Feed,
                item_id: url.clone(),
            })
            .await?;
        }
        self.record(SyncOperation::RemoveFeed { url }).await?;
        Ok(true)
    }

    // ========================================================================
    // Read State
    // ========================================================================

    /// Returns whether the read state changed. Unknown or already-read
    /// articles queue nothing.
    pub async fn mark_read(&self, link: &str) -> Result<bool> {
        self.set_read(link, true).await
    }

    pub async fn mark_unread(&self, link: &str) -> Result<bool> {
        self.set_read(link, false).await
    }

    async fn set_read(&self, link: &str, read: bool) -> Result<bool> {
        if !self.db.set_read(link, read).await? {
            return Ok(false);
        }
        let link = normalize_link(link);
        let op = if read {
            SyncOperation::MarkRead { link }
        } else {
            SyncOperation::MarkUnread { link }
        };
        self.record(op).await?;
        Ok(true)
    }

    /// Mark every unread article read, for one feed or all of them. Returns
    /// the number of articles changed.
    pub async fn mark_all_read(&self, feed_id: Option<i64>) -> Result<usize> {
        let links = self.db.mark_all_read(feed_id).await?;
        for link in &links {
            self.record(SyncOperation::MarkRead { link: link.clone() })
                .await?;
        }
        Ok(links.len())
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Attach `tag` to an item, creating the tag on first use.
    pub async fn tag(&self, tag: &str, item_id: &str, item_type: ItemType) -> Result<()> {
        let tag_id = self.db.create_tag(tag, None).await?;
        let created = self.db.tag_item(tag_id, item_id, item_type).await?;

        self.record(SyncOperation::AddTag {
            name: tag.trim().to_owned(),
        })
        .await?;
        if created {
            self.record(SyncOperation::TagItem {
                tag: tag.trim().to_owned(),
                item_type,
                item_id: normalize_link(item_id),
            })
            .await?;
        }
        Ok(())
    }

    /// Returns whether the association existed.
    pub async fn untag(&self, tag: &str, item_id: &str, item_type: ItemType) -> Result<bool> {
        let Some(existing) = self.db.get_tag_by_name(tag.trim()).await? else {
            return Ok(false);
        };
        let removed = self.db.untag_item(existing.id, item_id, item_type).await?;
        if removed {
            self.record(SyncOperation::UntagItem {
                tag: existing.name,
                item_type,
                item_id: normalize_link(item_id),
            })
            .await?;
        }
        Ok(removed)
    }

    /// Delete a tag and all of its associations.
    ///
    /// Each association is queued as an `UntagItem` before the `RemoveTag`,
    /// so other devices drop them too instead of re-creating the tag.
    pub async fn remove_tag(&self, tag: &str) -> Result<bool> {
        let Some(existing) = self.db.get_tag_by_name(tag.trim()).await? else {
            return Ok(false);
        };
        let items = self.db.items_for_tag(existing.id, None).await?;
        if !self.db.delete_tag(existing.id).await? {
            return Ok(false);
        }
        for item in items {
            self.record(SyncOperation::UntagItem {
                tag: existing.name.clone(),
                item_type: item.item_type,
                item_id: item.item_id,
            })
            .await?;
        }
        self.record(SyncOperation::RemoveTag {
            name: existing.name,
        })
        .await?;
        Ok(true)
    }

    // ========================================================================
    // Smart Folders
    // ========================================================================

    pub async fn save_smart_folder(&self, folder: SmartFolder) -> Result<i64> {
        let id = self.db.save_smart_folder(&folder).await?;
        self.record(SyncOperation::SaveSmartFolder { folder }).await?;
        Ok(id)
    }

    pub async fn delete_smart_folder(&self, name: &str) -> Result<bool> {
        let removed = self.db.delete_smart_folder(name.trim()).await?;
        if removed {
            self.record(SyncOperation::DeleteSmartFolder {
                name: name.trim().to_owned(),
            })
            .await?;
        }
        Ok(removed)
    }

    async fn smart_folder(&self, name: &str) -> Result<SmartFolder> {
        match self.db.get_smart_folder(name.trim()).await? {
            Some(folder) => Ok(folder),
            None => bail!("No smart folder named '{}'", name.trim()),
        }
    }

    /// Articles matching the named smart folder, newest first.
    pub async fn smart_folder_articles(&self, name: &str) -> Result<Vec<Article>> {
        let folder = self.smart_folder(name).await?;
        let articles = self
            .articles(&ArticleFilter {
                limit: Some(i64::MAX),
                ..Default::default()
            })
            .await?;
        let now = chrono::Utc::now().timestamp();
        let matched = evaluate(&folder, &articles, &self.db, now).await?;
        Ok(matched.into_iter().cloned().collect())
    }

    /// Feeds matching the named smart folder.
    pub async fn smart_folder_feeds(&self, name: &str) -> Result<Vec<Feed>> {
        let folder = self.smart_folder(name).await?;
        let feeds = self.db.get_feeds().await?;
        let now = chrono::Utc::now().timestamp();
        let matched = evaluate(&folder, &feeds, &self.db, now).await?;
        Ok(matched.into_iter().cloned().collect())
    }

    // ========================================================================
    // Offline Content
    // ========================================================================

    /// Download an article's page and keep it for offline reading. The link
    /// comes from a feed, so it passes the same url checks as a
    /// subscription. Returns the stored size in bytes.
    pub async fn save_offline(&self, client: &reqwest::Client, link: &str) -> Result<usize> {
        let article = self
            .db
            .get_article_by_link(link)
            .await?
            .with_context(|| format!("No article with link {}", link))?;
        let target = validate_feed_url(&article.link)
            .with_context(|| format!("Refusing to download {}", article.link))?;
        let page = fetch_page(client, target.as_str())
            .await
            .with_context(|| format!("Failed to download {}", article.link))?;
        self.db.set_article_content(&article.link, &page).await?;
        Ok(page.len())
    }

    // ========================================================================
    // Articles
    // ========================================================================

    /// Articles newest first, with duplicate copies of a story hidden when
    /// the `hide_duplicates` preference is on.
    pub async fn articles(&self, filter: &ArticleFilter) -> Result<Vec<Article>> {
        let articles = self.db.get_articles(filter).await?;
        if self.prefs.hide_duplicates() {
            Ok(remove_duplicates(articles, &self.prefs.dedup_policy()))
        } else {
            Ok(articles)
        }
    }
}
