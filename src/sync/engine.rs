use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::operation::{parse_tagged_item_key, RecordKey};
use super::queue::{ProcessOutcome, SyncQueue};
use super::record::SyncRecord;
use super::store::BlobStore;
use crate::rules::SmartFolder;
use crate::storage::{Database, ItemType};
use crate::util::validate_feed_url;

/// Counts of local changes made by [`SyncEngine::pull`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub records: usize,
    pub feeds_added: usize,
    pub feeds_removed: usize,
    pub read_state_changed: usize,
    pub tags_changed: usize,
    pub tagged_items_changed: usize,
    pub smart_folders_changed: usize,
}

impl PullSummary {
    pub fn total_changes(&self) -> usize {
        self.feeds_added
            + self.feeds_removed
            + self.read_state_changed
            + self.tags_changed
            + self.tagged_items_changed
            + self.smart_folders_changed
    }
}

/// Counts from one [`SyncEngine::drain`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub delivered: usize,
    pub retrying: usize,
    pub dropped: usize,
    /// Why the pass stopped
    pub stopped_at: Option<ProcessOutcome>,
}

/// Drives a [`SyncQueue`] against a blob store.
pub struct SyncEngine<S> {
    queue: Arc<SyncQueue>,
    store: Arc<S>,
    reconcile_interval: Duration,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<S: BlobStore + Send + Sync> SyncEngine<S> {
    pub fn new(queue: Arc<SyncQueue>, store: Arc<S>, reconcile_interval: Duration) -> Self {
        Self {
            queue,
            store,
            reconcile_interval,
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Deliver everything that is due right now.
    pub async fn drain(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            match self.queue.process_next(&*self.store, now_ms()).await? {
                ProcessOutcome::Delivered => summary.delivered += 1,
                ProcessOutcome::Retrying { .. } => summary.retrying += 1,
                ProcessOutcome::Dropped => summary.dropped += 1,
                other => {
                    summary.stopped_at = Some(other);
                    return Ok(summary);
                }
            }
        }
    }

    /// Worker loop: deliver due operations, sleep until the next one is due
    /// or something is enqueued, and reconcile stuck state on a fixed
    /// interval. Returns when `shutdown` flips to `true` or its sender is
    /// dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut reconcile = tokio::time::interval(self.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.drain().await {
                tracing::error!(error = %e, "Sync queue processing failed");
            }

            let wait = self.queue.next_due().await.map(|at| {
                let ms = at.saturating_sub(now_ms()).max(0);
                Duration::from_millis(u64::try_from(ms).unwrap_or(0))
            });

            tokio::select! {
                _ = self.queue.notified() => {}
                _ = sleep_or_pending(wait) => {}
                _ = reconcile.tick() => {
                    self.queue.reconcile(now_ms()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let pending = self.queue.len().await;
        tracing::info!(pending, "Sync engine stopped");
    }

    /// Bring remote state into the local database.
    ///
    /// Each record is merged with the operations still queued locally before
    /// it is applied, so unsent local changes are not rolled back by older
    /// remote state.
    pub async fn pull(&self, db: &Database) -> Result<PullSummary> {
        let pending = self.queue.pending_snapshot().await;
        let mut summary = PullSummary::default();
        // Tags are applied before tagged items; associations of a deleted
        // tag must not bring it back.
        let mut removed_tags: HashSet<String> = HashSet::new();

        for key in RecordKey::ALL {
            let blob = self.store.get(key.as_str()).await?;
            let mut record = match blob {
                Some(blob) => match SyncRecord::from_bytes(&blob.data) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(record = %key, error = %e, "Skipping corrupt remote record");
                        continue;
                    }
                },
                None => SyncRecord::default(),
            };
            for queued in pending.iter().filter(|q| q.operation.record_key() == key) {
                queued.operation.apply_to(&mut record, queued.enqueued_at)?;
            }
            if record.entries.is_empty() {
                continue;
            }

            summary.records += 1;
            match key {
                RecordKey::Feeds => apply_feeds(db, &record, &mut summary).await?,
                RecordKey::ReadState => apply_read_state(db, &record, &mut summary).await?,
                RecordKey::Tags => {
                    removed_tags.extend(record.removed_keys().map(str::to_owned));
                    apply_tags(db, &record, &mut summary).await?
                }
                RecordKey::TaggedItems => {
                    apply_tagged_items(db, &record, &removed_tags, &mut summary).await?
                }
                RecordKey::SmartFolders => apply_smart_folders(db, &record, &mut summary).await?,
            }
        }

        tracing::info!(
            records = summary.records,
            changes = summary.total_changes(),
            "Pulled remote state"
        );
        Ok(summary)
    }
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn apply_feeds(db: &Database, record: &SyncRecord, summary: &mut PullSummary) -> Result<()> {
    for (url, title) in record.live_entries() {
        if db.get_feed_by_url(url).await?.is_some() {
            continue;
        }
        if let Err(e) = validate_feed_url(url) {
            tracing::warn!(feed = %url, error = %e, "Ignoring remote feed with unsafe url");
            continue;
        }
        let title = if title.is_empty() { url } else { title };
        db.insert_feed(url, title, None).await?;
        summary.feeds_added += 1;
    }
    for url in record.removed_keys() {
        if db.remove_feed(url).await? {
            summary.feeds_removed += 1;
        }
    }
    Ok(())
}

async fn apply_read_state(
    db: &Database,
    record: &SyncRecord,
    summary: &mut PullSummary,
) -> Result<()> {
    for (link, _) in record.live_entries() {
        if db.set_read(link, true).await? {
            summary.read_state_changed += 1;
        }
    }
    for link in record.removed_keys() {
        if db.set_read(link, false).await? {
            summary.read_state_changed += 1;
        }
    }
    Ok(())
}

async fn apply_tags(db: &Database, record: &SyncRecord, summary: &mut PullSummary) -> Result<()> {
    for (name, _) in record.live_entries() {
        if db.get_tag_by_name(name).await?.is_none() {
            db.create_tag(name, None).await?;
            summary.tags_changed += 1;
        }
    }
    for name in record.removed_keys() {
        if let Some(tag) = db.get_tag_by_name(name).await? {
            if db.delete_tag(tag.id).await? {
                summary.tags_changed += 1;
            }
        }
    }
    Ok(())
}

async fn apply_tagged_items(
    db: &Database,
    record: &SyncRecord,
    removed_tags: &HashSet<String>,
    summary: &mut PullSummary,
) -> Result<()> {
    for (key, _) in record.live_entries() {
        let Some((tag, item_type, item_id)) = parse_tagged_item_key(key) else {
            tracing::warn!(key = %key, "Skipping malformed tagged item key");
            continue;
        };
        if removed_tags.contains(tag) {
            tracing::debug!(tag = %tag, item = %item_id, "Skipping association of a deleted tag");
            continue;
        }
        // Feeds arrive in the same pull; a missing one was unsubscribed
        if item_type == ItemType::Feed && db.get_feed_by_url(item_id).await?.is_none() {
            continue;
        }
        let tag_id = match db.get_tag_by_name(tag).await? {
            Some(existing) => existing.id,
            None => db.create_tag(tag, None).await?,
        };
        if db.tag_item(tag_id, item_id, item_type).await? {
            summary.tagged_items_changed += 1;
        }
    }
    for key in record.removed_keys() {
        let Some((tag, item_type, item_id)) = parse_tagged_item_key(key) else {
            continue;
        };
        if let Some(existing) = db.get_tag_by_name(tag).await? {
            if db.untag_item(existing.id, item_id, item_type).await? {
                summary.tagged_items_changed += 1;
            }
        }
    }
    Ok(())
}

async fn apply_smart_folders(
    db: &Database,
    record: &SyncRecord,
    summary: &mut PullSummary,
) -> Result<()> {
    for (name, json) in record.live_entries() {
        let folder: SmartFolder = match serde_json::from_str(json) {
            Ok(folder) => folder,
            Err(e) => {
                tracing::warn!(folder = %name, error = %e, "Skipping undecodable smart folder");
                continue;
            }
        };
        if db.get_smart_folder(name).await?.as_ref() == Some(&folder) {
            continue;
        }
        match db.save_smart_folder(&folder).await {
            Ok(_) => summary.smart_folders_changed += 1,
            Err(e) => {
                tracing::warn!(folder = %name, error = %e, "Skipping invalid smart folder");
            }
        }
    }
    for name in record.removed_keys() {
        if db.delete_smart_folder(name).await? {
            summary.smart_folders_changed += 1;
        }
    }
    Ok(())
}
