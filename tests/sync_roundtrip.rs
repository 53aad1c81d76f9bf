//! Integration tests for multi-device sync: local writes are queued,
//! delivered to a shared blob store and pulled by another device.

use std::sync::Arc;
use std::time::Duration;

use gleaner::config::Config;
use gleaner::library::Library;
use gleaner::preferences::PreferenceManager;
use gleaner::rules::{MatchMode, SmartFolder};
use gleaner::storage::{Database, ItemType, ParsedArticle};
use gleaner::sync::{
    BlobStore, CloudError, HttpBlobStore, MemoryBlobStore, ProcessOutcome, RetryPolicy,
    SyncEngine, SyncOperation, SyncQueue,
};
use pretty_assertions::assert_eq;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Device<S> {
    db: Database,
    library: Library,
    engine: SyncEngine<S>,
}

async fn device<S: BlobStore + Send + Sync>(store: Arc<S>) -> Device<S> {
    let db = Database::open(":memory:").await.unwrap();
    let queue = Arc::new(
        SyncQueue::load(db.clone(), RetryPolicy::default())
            .await
            .unwrap(),
    );
    let prefs = PreferenceManager::load(&Config::default(), &db).await.unwrap();
    let library = Library::new(db.clone(), prefs, Some(queue.clone()));
    let engine = SyncEngine::new(queue, store, Duration::from_secs(60));
    Device {
        db,
        library,
        engine,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Two Devices, One Store
// ============================================================================

#[tokio::test]
async fn test_changes_flow_between_devices() {
    let store = Arc::new(MemoryBlobStore::new());
    let phone = device(store.clone()).await;
    let tablet = device(store.clone()).await;

    phone
        .library
        .subscribe("https://example.com/feed.xml", "Example")
        .await
        .unwrap();
    phone
        .library
        .tag("reading", "https://example.com/feed.xml", ItemType::Feed)
        .await
        .unwrap();
    phone
        .library
        .save_smart_folder(
            SmartFolder::new(
                "Long reads",
                MatchMode::All,
                vec!["content contains essay".parse().unwrap()],
            )
            .unwrap(),
        )
        .await
        .unwrap();

    let pushed = phone.engine.drain().await.unwrap();
    assert_eq!(pushed.delivered, 4);
    assert_eq!(pushed.stopped_at, Some(ProcessOutcome::Idle));

    let pulled = tablet.engine.pull(&tablet.db).await.unwrap();
    assert_eq!(pulled.feeds_added, 1);
    assert_eq!(pulled.tags_changed, 1);
    assert_eq!(pulled.tagged_items_changed, 1);
    assert_eq!(pulled.smart_folders_changed, 1);

    let feeds = tablet.db.get_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(&*feeds[0].title, "Example");
    let tags = tablet
        .db
        .tags_for_item("https://example.com/feed.xml", ItemType::Feed)
        .await
        .unwrap();
    assert_eq!(tags[0].name, "reading");

    // The tablet unsubscribes; the phone follows
    assert!(tablet
        .library
        .unsubscribe("https://example.com/feed.xml")
        .await
        .unwrap());
    // The feed's tag association is withdrawn along with the feed
    assert_eq!(tablet.engine.drain().await.unwrap().delivered, 2);

    let pulled = phone.engine.pull(&phone.db).await.unwrap();
    assert_eq!(pulled.feeds_removed, 1);
    assert!(phone.db.get_feeds().await.unwrap().is_empty());
    assert!(phone
        .db
        .tags_for_item("https://example.com/feed.xml", ItemType::Feed)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_deleted_tag_stays_deleted_on_every_device() {
    let store = Arc::new(MemoryBlobStore::new());
    let phone = device(store.clone()).await;
    let tablet = device(store.clone()).await;

    let feed = phone
        .library
        .subscribe("https://example.com/feed.xml", "Example")
        .await
        .unwrap();
    phone
        .db
        .complete_feed_refresh(
            feed.id,
            &[ParsedArticle {
                link: "https://example.com/story".into(),
                title: "Story".into(),
                ..Default::default()
            }],
        )
        .await
        .unwrap();
    phone
        .library
        .tag("work", "https://example.com/story", ItemType::Article)
        .await
        .unwrap();
    phone.engine.drain().await.unwrap();

    tablet.engine.pull(&tablet.db).await.unwrap();
    assert_eq!(tablet.db.get_tags().await.unwrap().len(), 1);

    assert!(phone.library.remove_tag("work").await.unwrap());
    // UntagItem for the article, then RemoveTag
    assert_eq!(phone.engine.drain().await.unwrap().delivered, 2);

    // The deleting device does not get the tag back
    let pulled = phone.engine.pull(&phone.db).await.unwrap();
    assert_eq!(pulled.tagged_items_changed, 0);
    assert!(phone.db.get_tags().await.unwrap().is_empty());

    // And the other device drops it along with its association
    tablet.engine.pull(&tablet.db).await.unwrap();
    assert!(tablet.db.get_tags().await.unwrap().is_empty());
    assert!(tablet
        .db
        .tags_for_item("https://example.com/story", ItemType::Article)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_concurrent_edits_merge_instead_of_overwriting() {
    let store = Arc::new(MemoryBlobStore::new());
    let phone = device(store.clone()).await;
    let laptop = device(store.clone()).await;

    phone
        .library
        .subscribe("https://a.example.com/feed", "A")
        .await
        .unwrap();
    laptop
        .library
        .subscribe("https://b.example.com/feed", "B")
        .await
        .unwrap();

    phone.engine.drain().await.unwrap();
    laptop.engine.drain().await.unwrap();

    // Each device ends up with both subscriptions
    phone.engine.pull(&phone.db).await.unwrap();
    laptop.engine.pull(&laptop.db).await.unwrap();
    for db in [&phone.db, &laptop.db] {
        let mut urls: Vec<String> = db
            .get_feeds()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.url)
            .collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://a.example.com/feed".to_string(),
                "https://b.example.com/feed".to_string()
            ]
        );
    }
}

// ============================================================================
// Failure Handling
// ============================================================================

#[tokio::test]
async fn test_transient_failure_backs_off_and_survives_restart() {
    let store = MemoryBlobStore::new();
    let db = Database::open(":memory:").await.unwrap();
    let queue = SyncQueue::load(db.clone(), RetryPolicy::default())
        .await
        .unwrap();

    let start = now_ms();
    queue
        .enqueue(SyncOperation::AddTag { name: "later".into() }, start)
        .await
        .unwrap();
    store
        .fail_next_put(CloudError::Transient("connection reset".into()))
        .await;

    let outcome = queue.process_next(&store, start).await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Retrying {
            retry_count: 1,
            next_attempt_at: start + 2_000
        }
    );

    // A fresh process sees the same retry schedule
    let reloaded = SyncQueue::load(db.clone(), RetryPolicy::default())
        .await
        .unwrap();
    let pending = reloaded.pending_snapshot().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(pending[0].next_attempt_at, start + 2_000);

    assert_eq!(
        reloaded.process_next(&store, start + 1_000).await.unwrap(),
        ProcessOutcome::NotDue { at: start + 2_000 }
    );
    assert_eq!(
        reloaded.process_next(&store, start + 2_000).await.unwrap(),
        ProcessOutcome::Delivered
    );
    assert!(reloaded.is_empty().await);
}

// ============================================================================
// HTTP Backend
// ============================================================================

fn http_store(server: &MockServer) -> HttpBlobStore {
    HttpBlobStore::new(
        reqwest::Client::new(),
        &server.uri(),
        None,
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn test_delivery_over_http_creates_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/records/tags"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/records/tags"))
        .and(header("If-None-Match", "*"))
        .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"1\""))
        .expect(1)
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let queue = Arc::new(
        SyncQueue::load(db.clone(), RetryPolicy::default())
            .await
            .unwrap(),
    );
    let engine = SyncEngine::new(queue.clone(), Arc::new(http_store(&server)), Duration::from_secs(60));
    queue
        .enqueue(SyncOperation::AddTag { name: "work".into() }, now_ms())
        .await
        .unwrap();

    let summary = engine.drain().await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn test_rate_limit_pauses_queue_without_spending_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
        .expect(1)
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let queue = SyncQueue::load(db.clone(), RetryPolicy::default())
        .await
        .unwrap();
    let store = http_store(&server);
    let start = now_ms();
    queue
        .enqueue(SyncOperation::MarkRead { link: "https://example.com/a".into() }, start)
        .await
        .unwrap();

    let until = start + 120_000;
    assert_eq!(
        queue.process_next(&store, start).await.unwrap(),
        ProcessOutcome::Paused { until }
    );
    // Nothing is sent while paused
    assert_eq!(
        queue.process_next(&store, start + 60_000).await.unwrap(),
        ProcessOutcome::Paused { until }
    );
    assert_eq!(queue.pending_snapshot().await[0].retry_count, 0);
}
