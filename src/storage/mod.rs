mod articles;
mod feeds;
mod folders;
mod preferences;
mod schema;
mod smart_folders;
mod sync_queue;
mod tags;
mod types;

pub use preferences::{is_sync_key, SYNC_KEY_PREFIX};
pub use schema::Database;
pub use types::{
    Article, ArticleFilter, DatabaseError, Feed, Folder, ItemType, ParsedArticle, Tag, TaggedItem,
    UnknownItemType,
};
