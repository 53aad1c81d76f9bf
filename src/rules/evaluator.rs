use std::collections::HashSet;
use std::future::Future;

use futures::stream::{self, StreamExt, TryStreamExt};

use super::model::{MatchMode, Rule, RuleError, RuleField, RuleOperation, RuleValue, SmartFolder};
use super::subject::RuleSubject;
use crate::storage::{Database, ItemType};

/// Concurrent tag lookups per evaluation.
const TAG_LOOKUP_CONCURRENCY: usize = 16;

const SECONDS_PER_DAY: i64 = 86_400;

/// Resolves the tag names attached to an item.
pub trait TagSource {
    fn tag_names(
        &self,
        item_id: &str,
        item_type: ItemType,
    ) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;
}

impl TagSource for Database {
    async fn tag_names(&self, item_id: &str, item_type: ItemType) -> anyhow::Result<Vec<String>> {
        let tags = self.tags_for_item(item_id, item_type).await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }
}

/// Evaluate a smart folder against `subjects`, returning the matches in
/// input order.
///
/// When any rule looks at tags, tag sets for every subject are fetched
/// concurrently first and joined before any predicate runs; the predicates
/// themselves are synchronous. A failed lookup fails the whole evaluation.
///
/// A folder without rules matches nothing.
pub async fn evaluate<'a, S, T>(
    folder: &SmartFolder,
    subjects: &'a [S],
    tags: &T,
    now: i64,
) -> Result<Vec<&'a S>, RuleError>
where
    S: RuleSubject + Sync,
    T: TagSource + Sync,
{
    if folder.rules.is_empty() {
        return Ok(Vec::new());
    }

    let tag_sets: Option<Vec<HashSet<String>>> = if folder.needs_tags() {
        let sets = stream::iter(subjects.iter())
            .map(|subject| async move {
                tags.tag_names(subject.item_id(), subject.item_type())
                    .await
                    .map(|names| names.into_iter().map(|n| n.to_lowercase()).collect())
            })
            .buffered(TAG_LOOKUP_CONCURRENCY)
            .try_collect::<Vec<HashSet<String>>>()
            .await
            .map_err(|e| RuleError::TagLookup(e.to_string()))?;
        Some(sets)
    } else {
        None
    };

    let matched = subjects
        .iter()
        .enumerate()
        .filter(|(idx, subject)| {
            let subject_tags = tag_sets.as_ref().map(|sets| &sets[*idx]);
            folder_matches(folder, *subject, subject_tags, now)
        })
        .map(|(_, subject)| subject)
        .collect();

    Ok(matched)
}

/// Combine rule results according to the folder's match mode.
pub fn folder_matches<S: RuleSubject>(
    folder: &SmartFolder,
    subject: &S,
    tags: Option<&HashSet<String>>,
    now: i64,
) -> bool {
    if folder.rules.is_empty() {
        return false;
    }
    match folder.mode {
        MatchMode::All => folder.rules.iter().all(|r| rule_matches(r, subject, tags, now)),
        MatchMode::Any => folder.rules.iter().any(|r| rule_matches(r, subject, tags, now)),
    }
}

/// Evaluate one predicate. `tags` holds lowercased tag names; `None` means
/// no tags were resolved, which reads as an empty set.
pub fn rule_matches<S: RuleSubject>(
    rule: &Rule,
    subject: &S,
    tags: Option<&HashSet<String>>,
    now: i64,
) -> bool {
    match (&rule.operation, &rule.value) {
        (RuleOperation::HasTag, RuleValue::Text(name)) => has_tag(tags, name),
        (RuleOperation::NotHasTag, RuleValue::Text(name)) => !has_tag(tags, name),

        (RuleOperation::Is, RuleValue::Bool(expected)) => {
            rule.field == RuleField::IsRead && subject.is_read() == Some(*expected)
        }

        (RuleOperation::Before, RuleValue::Date(ts)) => subject.date().is_some_and(|d| d < *ts),
        (RuleOperation::After, RuleValue::Date(ts)) => subject.date().is_some_and(|d| d > *ts),
        (RuleOperation::WithinLastDays, RuleValue::Days(days)) => {
            let cutoff = now - i64::from(*days) * SECONDS_PER_DAY;
            subject.date().is_some_and(|d| d >= cutoff)
        }

        (op, RuleValue::Text(needle)) => {
            let haystack = subject.text(rule.field).unwrap_or("").to_lowercase();
            let needle = needle.to_lowercase();
            match op {
                RuleOperation::Contains => haystack.contains(&needle),
                RuleOperation::NotContains => !haystack.contains(&needle),
                RuleOperation::Equals => haystack.trim() == needle.trim(),
                RuleOperation::NotEquals => haystack.trim() != needle.trim(),
                RuleOperation::StartsWith => haystack.starts_with(&needle),
                RuleOperation::EndsWith => haystack.ends_with(&needle),
                _ => false,
            }
        }

        // Unvalidated rules with mismatched values never match.
        _ => false,
    }
}

fn has_tag(tags: Option<&HashSet<String>>, name: &str) -> bool {
    tags.is_some_and(|set| set.contains(&name.trim().to_lowercase()))
}
