//! Utility functions shared across the crate.
//!
//! - **Links**: canonical link normalization (article/feed identity) and
//!   feed URL validation
//! - **Text**: control-character stripping and width-aware truncation for
//!   terminal output
//!
//! # Examples
//!
//! ```
//! use gleaner::util::{normalize_link, truncate_to_width};
//!
//! assert_eq!(
//!     normalize_link("http://www.Example.com/post/?utm_source=rss#top"),
//!     "https://example.com/post"
//! );
//! assert_eq!(truncate_to_width("Long article title", 10), "Long ar...");
//! ```

mod link;
mod text;

pub use link::{normalize_link, validate_feed_url, LinkError};
pub use text::{display_width, strip_control_chars, truncate_to_width};
