use std::collections::BTreeSet;

/// Titles at or above this Jaccard similarity are considered the same story.
pub const SIMILARITY_THRESHOLD: f64 = 0.8;

/// Lowercase, turn punctuation into spaces and collapse whitespace.
///
/// ```
/// use gleaner::dedup::normalize_title;
///
/// assert_eq!(normalize_title("  Rust 1.80 -- Released!  "), "rust 1 80 released");
/// ```
pub fn normalize_title(title: &str) -> String {
    let spaced: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The word set of a normalized title.
pub fn title_tokens(title: &str) -> BTreeSet<String> {
    normalize_title(title)
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|`.
///
/// Two empty sets score `0.0`: untitled articles are never duplicates by
/// title alone.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / union as f64
}

pub fn titles_similar(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    jaccard(a, b) >= SIMILARITY_THRESHOLD
}
