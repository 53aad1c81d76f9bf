use std::fmt;

use serde::{Deserialize, Serialize};

use super::record::SyncRecord;
use crate::rules::SmartFolder;
use crate::storage::ItemType;
use crate::util::normalize_link;

/// Separator inside tagged-item entry keys. Unit separator cannot occur in
/// tag names (control characters are stripped) or normalized links.
const KEY_SEPARATOR: char = '\u{1f}';

/// Cloud record a sync operation writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Feeds,
    ReadState,
    Tags,
    TaggedItems,
    SmartFolders,
}

impl RecordKey {
    pub const ALL: [RecordKey; 5] = [
        RecordKey::Feeds,
        RecordKey::ReadState,
        RecordKey::Tags,
        RecordKey::TaggedItems,
        RecordKey::SmartFolders,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKey::Feeds => "feeds",
            RecordKey::ReadState => "read_state",
            RecordKey::Tags => "tags",
            RecordKey::TaggedItems => "tagged_items",
            RecordKey::SmartFolders => "smart_folders",
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending write to the cloud backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncOperation {
    AddFeed {
        url: String,
        title: String,
    },
    RemoveFeed {
        url: String,
    },
    MarkRead {
        link: String,
    },
    MarkUnread {
        link: String,
    },
    AddTag {
        name: String,
    },
    RemoveTag {
        name: String,
    },
    TagItem {
        tag: String,
        item_type: ItemType,
        item_id: String,
    },
    UntagItem {
        tag: String,
        item_type: ItemType,
        item_id: String,
    },
    SaveSmartFolder {
        folder: SmartFolder,
    },
    DeleteSmartFolder {
        name: String,
    },
}

impl SyncOperation {
    pub fn record_key(&self) -> RecordKey {
        match self {
            SyncOperation::AddFeed { .. } | SyncOperation::RemoveFeed { .. } => RecordKey::Feeds,
            SyncOperation::MarkRead { .. } | SyncOperation::MarkUnread { .. } => {
                RecordKey::ReadState
            }
            SyncOperation::AddTag { .. } | SyncOperation::RemoveTag { .. } => RecordKey::Tags,
            SyncOperation::TagItem { .. } | SyncOperation::UntagItem { .. } => {
                RecordKey::TaggedItems
            }
            SyncOperation::SaveSmartFolder { .. } | SyncOperation::DeleteSmartFolder { .. } => {
                RecordKey::SmartFolders
            }
        }
    }

    /// Key of the entry this operation touches inside its record.
    pub fn entry_key(&self) -> String {
        match self {
            SyncOperation::AddFeed { url, .. } | SyncOperation::RemoveFeed { url } => {
                normalize_link(url)
            }
            SyncOperation::MarkRead { link } | SyncOperation::MarkUnread { link } => {
                normalize_link(link)
            }
            SyncOperation::AddTag { name } | SyncOperation::RemoveTag { name } => {
                name.trim().to_owned()
            }
            SyncOperation::TagItem {
                tag,
                item_type,
                item_id,
            }
            | SyncOperation::UntagItem {
                tag,
                item_type,
                item_id,
            } => tagged_item_key(tag, *item_type, item_id),
            SyncOperation::SaveSmartFolder { folder } => folder.name.clone(),
            SyncOperation::DeleteSmartFolder { name } => name.trim().to_owned(),
        }
    }

    /// Fold this operation into `record` as of `at` (Unix ms).
    pub fn apply_to(&self, record: &mut SyncRecord, at: i64) -> serde_json::Result<()> {
        let key = self.entry_key();
        match self {
            SyncOperation::AddFeed { title, .. } => record.add(&key, title, at),
            SyncOperation::MarkRead { .. }
            | SyncOperation::AddTag { .. }
            | SyncOperation::TagItem { .. } => record.add(&key, "", at),
            SyncOperation::SaveSmartFolder { folder } => {
                record.add(&key, &serde_json::to_string(folder)?, at)
            }
            SyncOperation::RemoveFeed { .. }
            | SyncOperation::MarkUnread { .. }
            | SyncOperation::RemoveTag { .. }
            | SyncOperation::UntagItem { .. }
            | SyncOperation::DeleteSmartFolder { .. } => record.remove(&key, at),
        }
        Ok(())
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            SyncOperation::AddFeed { .. } => "add feed",
            SyncOperation::RemoveFeed { .. } => "remove feed",
            SyncOperation::MarkRead { .. } => "mark read",
            SyncOperation::MarkUnread { .. } => "mark unread",
            SyncOperation::AddTag { .. } => "add tag",
            SyncOperation::RemoveTag { .. } => "remove tag",
            SyncOperation::TagItem { .. } => "tag item",
            SyncOperation::UntagItem { .. } => "untag item",
            SyncOperation::SaveSmartFolder { .. } => "save smart folder",
            SyncOperation::DeleteSmartFolder { .. } => "delete smart folder",
        };
        write!(f, "{} {}", verb, self.entry_key().replace(KEY_SEPARATOR, "/"))
    }
}

pub fn tagged_item_key(tag: &str, item_type: ItemType, item_id: &str) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        tag.trim(),
        item_type.as_str(),
        normalize_link(item_id),
        sep = KEY_SEPARATOR
    )
}

/// Split a tagged-item entry key back into `(tag, item_type, item_id)`.
pub fn parse_tagged_item_key(key: &str) -> Option<(&str, ItemType, &str)> {
    let mut parts = key.splitn(3, KEY_SEPARATOR);
    let tag = parts.next()?;
    let item_type = parts.next()?.parse().ok()?;
    let item_id = parts.next()?;
    Some((tag, item_type, item_id))
}

/// An operation waiting in the sync queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub id: i64,
    pub operation: SyncOperation,
    pub retry_count: u32,
    /// Unix ms; also the logical time of the change when merged remotely
    pub enqueued_at: i64,
    /// Unix ms
    pub next_attempt_at: i64,
}
