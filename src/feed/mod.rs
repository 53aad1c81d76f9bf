//! Feed retrieval: parsing RSS/Atom/JSON Feed documents and fetching them
//! over HTTP.
//!
//! - [`parser`] turns a document into [`ParsedArticle`](crate::storage::ParsedArticle)s
//!   keyed by normalized link, using `feed-rs`
//! - [`fetcher`] downloads feeds concurrently with retry, a body size cap and
//!   a per-feed circuit breaker, then stores the articles

mod fetcher;
mod parser;

pub use fetcher::{fetch_page, fetch_title, refresh_all, refresh_one, FetchError, FetchResult};
pub use parser::{parse_feed, ParseResult};
