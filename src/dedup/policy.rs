use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage::Article;
use crate::util::normalize_link;

/// One criterion for choosing which copy of a story to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Latest `pub_date` wins; undated articles lose
    Newest,
    /// Earliest position in the preferred-source list wins
    PreferredSource,
    /// Longest content (or description) wins
    MostContent,
}

impl TieBreak {
    pub fn as_str(self) -> &'static str {
        match self {
            TieBreak::Newest => "newest",
            TieBreak::PreferredSource => "preferred_source",
            TieBreak::MostContent => "most_content",
        }
    }
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "newest" => Ok(TieBreak::Newest),
            "preferred_source" | "source" => Ok(TieBreak::PreferredSource),
            "most_content" | "content" => Ok(TieBreak::MostContent),
            other => Err(format!("unknown tie-break '{}'", other)),
        }
    }
}

/// How to pick the primary article of a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupPolicy {
    pub order: Vec<TieBreak>,
    /// Source (feed) titles, most preferred first. Matched case-insensitively.
    pub preferred_sources: Vec<String>,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            order: vec![
                TieBreak::Newest,
                TieBreak::PreferredSource,
                TieBreak::MostContent,
            ],
            preferred_sources: Vec::new(),
        }
    }
}

impl DedupPolicy {
    /// Parse a comma-separated order such as `"most_content,newest"`.
    /// Repeated criteria are ignored after their first occurrence.
    pub fn parse_order(s: &str) -> Result<Vec<TieBreak>, String> {
        let mut order = Vec::new();
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            let criterion: TieBreak = part.parse()?;
            if !order.contains(&criterion) {
                order.push(criterion);
            }
        }
        Ok(order)
    }

    /// `Less` when `a` should be kept over `b`.
    ///
    /// Criteria are tried in order; the first one that tells the articles
    /// apart decides. Otherwise title, source and normalized link decide
    /// alphabetically, so the choice never depends on input order.
    pub fn compare(&self, a: &Article, b: &Article) -> Ordering {
        self.order
            .iter()
            .map(|criterion| self.compare_by(*criterion, a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| fallback(a, b))
    }

    fn compare_by(&self, criterion: TieBreak, a: &Article, b: &Article) -> Ordering {
        match criterion {
            // None < Some, so reversing puts undated articles last
            TieBreak::Newest => b.pub_date.cmp(&a.pub_date),
            TieBreak::PreferredSource => self.source_rank(&a.source).cmp(&self.source_rank(&b.source)),
            TieBreak::MostContent => b.content_len().cmp(&a.content_len()),
        }
    }

    fn source_rank(&self, source: &str) -> usize {
        self.preferred_sources
            .iter()
            .position(|s| s.trim().eq_ignore_ascii_case(source.trim()))
            .unwrap_or(usize::MAX)
    }
}

fn fallback(a: &Article, b: &Article) -> Ordering {
    a.title
        .to_lowercase()
        .cmp(&b.title.to_lowercase())
        .then_with(|| a.source.to_lowercase().cmp(&b.source.to_lowercase()))
        .then_with(|| normalize_link(&a.link).cmp(&normalize_link(&b.link)))
        .then_with(|| a.link.cmp(&b.link))
        .then_with(|| a.id.cmp(&b.id))
}
