//! Duplicate-article detection.
//!
//! The same story often arrives through several feeds, sometimes under the
//! same link (with different tracking parameters) and sometimes under a
//! slightly reworded title. Detection runs in two phases:
//!
//! 1. Exact matches on the normalized link, found with a seen-map.
//! 2. Pairwise Jaccard similarity of title word sets for everything not
//!    already grouped, with a fixed [`SIMILARITY_THRESHOLD`].
//!
//! Matches are joined with a union-find, so groups are the connected
//! components of the "same story" relation: symmetric, transitive, and
//! independent of input order. The primary of each group is chosen by a
//! [`DedupPolicy`].

mod normalize;
mod policy;

use std::collections::hash_map::Entry;
use std::collections::HashMap;

pub use normalize::{jaccard, normalize_title, title_tokens, titles_similar, SIMILARITY_THRESHOLD};
pub use policy::{DedupPolicy, TieBreak};

use crate::storage::Article;
use crate::util::normalize_link;

/// Why articles were grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    /// Every member shares one normalized link
    SameLink,
    /// At least one member joined through title similarity
    SimilarTitle,
}

/// A story reported more than once.
#[derive(Debug, Clone)]
pub struct DuplicateGroup<'a> {
    /// The copy to show
    pub primary: &'a Article,
    /// The copies to hide, in input order
    pub duplicates: Vec<&'a Article>,
    pub reason: DuplicateReason,
}

/// Disjoint-set forest over article indices.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
    }
}

struct IndexGroup {
    primary: usize,
    duplicates: Vec<usize>,
    reason: DuplicateReason,
}

fn group_indices(articles: &[Article], policy: &DedupPolicy) -> Vec<IndexGroup> {
    let n = articles.len();
    let mut sets = UnionFind::new(n);

    // Phase 1: exact normalized-link matches
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(n);
    for (idx, article) in articles.iter().enumerate() {
        match seen.entry(normalize_link(&article.link)) {
            Entry::Occupied(first) => sets.union(*first.get(), idx),
            Entry::Vacant(slot) => {
                slot.insert(idx);
            }
        }
    }

    // Phase 2: title similarity between articles not already together
    let tokens: Vec<_> = articles.iter().map(|a| title_tokens(&a.title)).collect();
    let mut title_edges = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            if sets.find(i) == sets.find(j) {
                continue;
            }
            if titles_similar(&tokens[i], &tokens[j]) {
                sets.union(i, j);
                title_edges.push(i);
            }
        }
    }

    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for idx in 0..n {
        members.entry(sets.find(idx)).or_default().push(idx);
    }
    let mut by_title = vec![false; n];
    for idx in title_edges {
        by_title[sets.find(idx)] = true;
    }

    let mut groups: Vec<IndexGroup> = members
        .into_iter()
        .filter(|(_, m)| m.len() > 1)
        .filter_map(|(root, m)| {
            let primary = *m
                .iter()
                .min_by(|&&a, &&b| policy.compare(&articles[a], &articles[b]))?;
            Some(IndexGroup {
                primary,
                duplicates: m.into_iter().filter(|&i| i != primary).collect(),
                reason: if by_title[root] {
                    DuplicateReason::SimilarTitle
                } else {
                    DuplicateReason::SameLink
                },
            })
        })
        .collect();
    groups.sort_by_key(|g| g.primary.min(g.duplicates.first().copied().unwrap_or(g.primary)));
    groups
}

/// Find groups of two or more articles that report the same story, ordered
/// by where each group first appears in `articles`.
pub fn find_duplicates<'a>(articles: &'a [Article], policy: &DedupPolicy) -> Vec<DuplicateGroup<'a>> {
    group_indices(articles, policy)
        .into_iter()
        .map(|g| DuplicateGroup {
            primary: &articles[g.primary],
            duplicates: g.duplicates.into_iter().map(|i| &articles[i]).collect(),
            reason: g.reason,
        })
        .collect()
}

/// Drop every duplicate, keeping unique articles and each group's primary
/// in their original order.
pub fn remove_duplicates(articles: Vec<Article>, policy: &DedupPolicy) -> Vec<Article> {
    let mut hidden = vec![false; articles.len()];
    for group in group_indices(&articles, policy) {
        for idx in group.duplicates {
            hidden[idx] = true;
        }
    }
    let before = articles.len();
    let kept: Vec<Article> = articles
        .into_iter()
        .zip(hidden)
        .filter(|(_, hide)| !hide)
        .map(|(article, _)| article)
        .collect();
    tracing::debug!(before = before, after = kept.len(), "Removed duplicate articles");
    kept
}
