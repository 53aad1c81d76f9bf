//! gleaner: a feed reader core.
//!
//! - [`dedup`] groups copies of the same story arriving through different feeds
//! - [`rules`] evaluates smart folders over articles and feeds
//! - [`sync`] queues local changes and merges them into a cloud blob store
//!
//! [`storage`] keeps everything in SQLite, [`feed`] fetches and parses
//! subscriptions, and [`library::Library`] ties writes to the sync queue.

pub mod config;
pub mod dedup;
pub mod feed;
pub mod library;
pub mod preferences;
pub mod rules;
pub mod storage;
pub mod sync;
pub mod util;
