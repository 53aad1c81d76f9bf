use anyhow::Result;
use feed_rs::model::Entry;
use feed_rs::parser;

use crate::storage::ParsedArticle;
use crate::util::{normalize_link, strip_control_chars};

/// Outcome of parsing one feed document.
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    /// The feed's own title, when it declares one
    pub title: Option<String>,
    pub articles: Vec<ParsedArticle>,
    /// Entries dropped because they had no usable http(s) link
    pub skipped: usize,
}

/// Parse RSS, Atom or JSON Feed bytes.
///
/// Entries are keyed by link, so an entry without an http(s) link cannot be
/// stored and is counted in `skipped` instead.
pub fn parse_feed(bytes: &[u8]) -> Result<ParseResult> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| clean(&t.content))
        .filter(|t| !t.is_empty());

    let mut skipped = 0;
    let articles = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let article = parse_entry(entry);
            if article.is_none() {
                skipped += 1;
            }
            article
        })
        .collect();

    Ok(ParseResult {
        title,
        articles,
        skipped,
    })
}

fn parse_entry(entry: Entry) -> Option<ParsedArticle> {
    let link = entry_link(&entry)?;

    let title = entry
        .title
        .map(|t| clean(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    let pub_date = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let author = entry
        .authors
        .into_iter()
        .map(|p| clean(&p.name))
        .find(|name| !name.is_empty());
    let description = entry.summary.map(|s| s.content);
    let content = entry.content.and_then(|c| c.body);

    Some(ParsedArticle {
        link,
        title,
        pub_date,
        author,
        description,
        content,
    })
}

/// First http(s) link of the entry, falling back to an id that is itself a
/// permalink (RSS `<guid isPermaLink="true">`).
fn entry_link(entry: &Entry) -> Option<String> {
    entry
        .links
        .iter()
        .map(|l| l.href.as_str())
        .chain(std::iter::once(entry.id.as_str()))
        .find(|href| is_web_link(href))
        .map(normalize_link)
}

fn is_web_link(href: &str) -> bool {
    url::Url::parse(href.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

fn clean(s: &str) -> String {
    strip_control_chars(s).trim().to_string()
}
