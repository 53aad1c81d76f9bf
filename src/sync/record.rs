use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Merge state of one entry in a cloud record.
///
/// Timestamps are Unix milliseconds; 0 means "never". The entry is live when
/// it was added after it was last removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default)]
    pub added_at: i64,
    #[serde(default)]
    pub removed_at: i64,
}

impl EntryState {
    pub fn is_live(&self) -> bool {
        self.added_at > self.removed_at
    }

    /// Join two states: latest add (with its value) and latest removal.
    ///
    /// Equal add times keep the larger value so the result does not depend on
    /// argument order.
    pub fn merge(&self, other: &EntryState) -> EntryState {
        let value = match self.added_at.cmp(&other.added_at) {
            Ordering::Greater => self.value.clone(),
            Ordering::Less => other.value.clone(),
            Ordering::Equal => self.value.clone().max(other.value.clone()),
        };
        EntryState {
            value,
            added_at: self.added_at.max(other.added_at),
            removed_at: self.removed_at.max(other.removed_at),
        }
    }
}

/// One blob in the cloud store: a keyed set of entries whose merge is a
/// per-key join.
///
/// Merging is commutative, associative and idempotent, so devices can apply
/// each other's records in any order, any number of times. Removal is
/// recorded as a timestamp rather than by dropping the key, which lets the
/// union carry deletions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    #[serde(default)]
    pub entries: BTreeMap<String, EntryState>,
}

impl SyncRecord {
    pub fn add(&mut self, key: &str, value: &str, at: i64) {
        self.join_entry(
            key,
            &EntryState {
                value: value.to_owned(),
                added_at: at,
                removed_at: 0,
            },
        );
    }

    pub fn remove(&mut self, key: &str, at: i64) {
        self.join_entry(
            key,
            &EntryState {
                value: String::new(),
                added_at: 0,
                removed_at: at,
            },
        );
    }

    fn join_entry(&mut self, key: &str, state: &EntryState) {
        let merged = match self.entries.get(key) {
            Some(existing) => existing.merge(state),
            None => state.clone(),
        };
        self.entries.insert(key.to_owned(), merged);
    }

    /// Fold `other` into `self`.
    pub fn merge_from(&mut self, other: &SyncRecord) {
        for (key, state) in &other.entries {
            self.join_entry(key, state);
        }
    }

    pub fn merged(&self, other: &SyncRecord) -> SyncRecord {
        let mut out = self.clone();
        out.merge_from(other);
        out
    }

    pub fn is_live(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(EntryState::is_live)
    }

    /// Live `(key, value)` pairs in key order.
    pub fn live_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|(_, s)| s.is_live())
            .map(|(k, s)| (k.as_str(), s.value.as_str()))
    }

    /// Keys whose latest event is a removal.
    pub fn removed_keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, s)| !s.is_live() && s.removed_at > 0)
            .map(|(k, _)| k.as_str())
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes)
    }
}
