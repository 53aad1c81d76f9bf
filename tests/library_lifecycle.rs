//! Integration tests for the reading workflow: fetch, dedupe, organize.
//!
//! Each test creates its own in-memory SQLite database for isolation and
//! serves feeds from a local mock server.

use gleaner::config::Config;
use gleaner::feed::{refresh_all, refresh_one};
use gleaner::library::Library;
use gleaner::preferences::PreferenceManager;
use gleaner::rules::{MatchMode, SmartFolder};
use gleaner::storage::{ArticleFilter, Database, ItemType};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WIRE_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>The Wire</title>
    <item>
        <title>Apple releases new iPhone today</title>
        <link>https://wire.example.com/iphone?utm_source=rss</link>
        <pubDate>Tue, 01 Oct 2024 10:00:00 GMT</pubDate>
    </item>
    <item>
        <title>Rust 1.82 released</title>
        <link>https://wire.example.com/rust</link>
        <pubDate>Tue, 01 Oct 2024 09:00:00 GMT</pubDate>
    </item>
</channel></rss>"#;

const DAILY_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example Daily</title>
    <item>
        <title>Apple Releases New iPhone</title>
        <link>https://daily.example.com/apple</link>
        <description>A much longer write-up of the launch event.</description>
        <pubDate>Tue, 01 Oct 2024 12:00:00 GMT</pubDate>
    </item>
    <item>
        <title>Rust 1.82 released</title>
        <link>http://www.wire.example.com/rust/</link>
    </item>
</channel></rss>"#;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

async fn serve(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("Content-Type", "application/rss+xml"),
        )
        .mount(server)
        .await;
}

/// Two feeds carrying overlapping stories, fetched into `db`.
async fn fetch_both(db: &Database) -> MockServer {
    let server = MockServer::start().await;
    serve(&server, "/wire", WIRE_RSS).await;
    serve(&server, "/daily", DAILY_RSS).await;

    db.insert_feed(&format!("{}/wire", server.uri()), "The Wire", None)
        .await
        .unwrap();
    db.insert_feed(&format!("{}/daily", server.uri()), "Example Daily", None)
        .await
        .unwrap();

    let feeds = db.get_feeds().await.unwrap();
    let results = refresh_all(db, &reqwest::Client::new(), &feeds, 2).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.result.is_ok()));
    server
}

async fn library_with(db: &Database, config: &Config) -> Library {
    let prefs = PreferenceManager::load(config, db).await.unwrap();
    Library::new(db.clone(), prefs, None)
}

// ============================================================================
// Fetch + Dedup
// ============================================================================

#[tokio::test]
async fn test_shared_link_is_stored_once() {
    let db = test_db().await;
    let _server = fetch_both(&db).await;

    // The Rust story arrives through both feeds under equivalent links
    let all = db.get_articles(&ArticleFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    let rust = db
        .get_article_by_link("https://wire.example.com/rust")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&*rust.title, "Rust 1.82 released");
}

#[tokio::test]
async fn test_similar_titles_hidden_newest_wins() {
    let db = test_db().await;
    let _server = fetch_both(&db).await;

    let library = library_with(&db, &Config::default()).await;
    let visible = library.articles(&ArticleFilter::default()).await.unwrap();
    let links: Vec<&str> = visible.iter().map(|a| a.link.as_str()).collect();
    assert_eq!(
        links,
        vec!["https://daily.example.com/apple", "https://wire.example.com/rust"]
    );
}

#[tokio::test]
async fn test_preferred_source_overrides_recency() {
    let db = test_db().await;
    let _server = fetch_both(&db).await;

    let mut config = Config::default();
    config.dedup.preference_order = "preferred_source,newest"
        .split(',')
        .map(|s| s.parse().unwrap())
        .collect();
    config.dedup.preferred_sources = vec!["The Wire".to_string()];

    let library = library_with(&db, &config).await;
    let visible = library.articles(&ArticleFilter::default()).await.unwrap();
    assert!(visible
        .iter()
        .any(|a| a.link == "https://wire.example.com/iphone"));
    assert!(!visible
        .iter()
        .any(|a| a.link == "https://daily.example.com/apple"));
}

#[tokio::test]
async fn test_refresh_preserves_read_state() {
    let db = test_db().await;
    let server = fetch_both(&db).await;
    let library = library_with(&db, &Config::default()).await;

    assert!(library
        .mark_read("https://wire.example.com/iphone")
        .await
        .unwrap());

    let feed = db
        .get_feed_by_url(&format!("{}/wire", server.uri()))
        .await
        .unwrap()
        .unwrap();
    let result = refresh_one(&db, &reqwest::Client::new(), &feed).await;
    assert_eq!(result.result.unwrap(), 0);

    let article = db
        .get_article_by_link("https://wire.example.com/iphone")
        .await
        .unwrap()
        .unwrap();
    assert!(article.is_read);
}

// ============================================================================
// Smart Folders
// ============================================================================

#[tokio::test]
async fn test_smart_folder_over_fetched_articles() {
    let db = test_db().await;
    let _server = fetch_both(&db).await;
    let library = library_with(&db, &Config::default()).await;

    library
        .tag("phones", "https://daily.example.com/apple", ItemType::Article)
        .await
        .unwrap();
    library
        .save_smart_folder(
            SmartFolder::new(
                "Unread phones",
                MatchMode::All,
                vec![
                    "tag has_tag phones".parse().unwrap(),
                    "is_read is false".parse().unwrap(),
                ],
            )
            .unwrap(),
        )
        .await
        .unwrap();

    let matched = library.smart_folder_articles("Unread phones").await.unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].link, "https://daily.example.com/apple");

    library
        .mark_read("https://daily.example.com/apple")
        .await
        .unwrap();
    assert!(library
        .smart_folder_articles("Unread phones")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_empty_smart_folder_matches_nothing() {
    let db = test_db().await;
    let _server = fetch_both(&db).await;
    let library = library_with(&db, &Config::default()).await;

    library
        .save_smart_folder(SmartFolder::new("Empty", MatchMode::Any, vec![]).unwrap())
        .await
        .unwrap();
    assert!(library
        .smart_folder_articles("Empty")
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Folders
// ============================================================================

#[tokio::test]
async fn test_folder_tree_rejects_cycles_and_rehomes_children() {
    let db = test_db().await;
    let news = db.create_folder("News", None).await.unwrap();
    let tech = db.create_folder("Tech", Some(news)).await.unwrap();
    let rust = db.create_folder("Rust", Some(tech)).await.unwrap();

    assert!(db.move_folder(news, Some(rust)).await.is_err());
    assert!(db.move_folder(tech, Some(tech)).await.is_err());

    let feed = db
        .insert_feed("https://example.com/feed", "Example", None)
        .await
        .unwrap();
    db.move_feed_to_folder(feed, Some(tech)).await.unwrap();

    db.delete_folder(tech).await.unwrap();
    let rust_folder = db.get_folder(rust).await.unwrap().unwrap();
    assert_eq!(rust_folder.parent_id, Some(news));
    let feeds = db.get_feeds().await.unwrap();
    assert_eq!(feeds[0].folder_id, Some(news));
}
