use crate::feed::parser::{parse_feed, ParseResult};
use crate::storage::{Database, Feed};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use thiserror::Error;

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur during feed fetching operations.
///
/// These errors cover the full lifecycle of a fetch: network issues,
/// HTTP errors, parsing failures, and database problems.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed document could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Database operation failed during article storage
    #[error("Database error: {0}")]
    Database(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Result of a single feed fetch operation.
///
/// Contains the feed ID for correlation and either the count of new
/// articles inserted or the error that occurred.
#[derive(Debug)]
pub struct FetchResult {
    /// Database ID of the feed that was fetched
    pub feed_id: i64,
    /// Number of new articles inserted, or the error that occurred
    pub result: Result<usize, FetchError>,
}

/// Refreshes feeds concurrently.
///
/// Fetches up to `concurrency` feeds at once, parsing each document and
/// upserting its articles. Results are returned in completion order, not
/// input order.
///
/// # Behavior
///
/// - Skips feeds with 5+ consecutive failures (circuit breaker)
/// - Each request has a 30-second timeout
/// - 429 and 5xx responses are retried with exponential backoff, up to 3 times
/// - Response bodies are limited to 10MB
/// - Feed error statuses are written in a single transaction after all
///   fetches complete
pub async fn refresh_all(
    db: &Database,
    client: &reqwest::Client,
    feeds: &[Feed],
    concurrency: usize,
) -> Vec<FetchResult> {
    // Filter out feeds that have tripped the circuit breaker
    let active_feeds: Vec<&Feed> = feeds
        .iter()
        .filter(|f| f.consecutive_failures < Database::CIRCUIT_BREAKER_THRESHOLD)
        .collect();

    let skipped = feeds.len() - active_feeds.len();
    if skipped > 0 {
        tracing::info!(
            skipped = skipped,
            threshold = Database::CIRCUIT_BREAKER_THRESHOLD,
            "Skipping feeds due to consecutive failures (refresh them individually to retry)"
        );
    }

    if active_feeds.is_empty() {
        return Vec::new();
    }

    let results: Vec<FetchResult> = stream::iter(active_feeds)
        .map(|feed| async move {
            let result = fetch_one(db, client, feed).await;
            if result.is_err() {
                count_failure(db, feed).await;
            }
            FetchResult {
                feed_id: feed.id,
                result,
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let updates: Vec<(i64, Option<String>)> = results
        .iter()
        .map(|r| (r.feed_id, r.result.as_ref().err().map(ToString::to_string)))
        .collect();

    if let Err(e) = db.batch_set_feed_errors(&updates).await {
        tracing::warn!(error = %e, "Failed to batch update feed error statuses");
    }

    results
}

/// Refreshes a single feed and stores new articles.
///
/// Bypasses the circuit breaker used by [`refresh_all`], so a feed that was
/// skipped can be retried by hand. Success resets the failure counter.
pub async fn refresh_one(db: &Database, client: &reqwest::Client, feed: &Feed) -> FetchResult {
    let result = fetch_one(db, client, feed).await;

    match &result {
        Ok(_) => {
            if let Err(e) = db.set_feed_error(feed.id, None).await {
                tracing::warn!(feed_id = feed.id, error = %e, "Failed to clear feed error");
            }
        }
        Err(fetch_err) => {
            if let Err(e) = db.set_feed_error(feed.id, Some(&fetch_err.to_string())).await {
                tracing::warn!(feed_id = feed.id, error = %e, "Failed to record feed error");
            }
            count_failure(db, feed).await;
        }
    }

    FetchResult {
        feed_id: feed.id,
        result,
    }
}

/// Fetch a document for subscription-time title discovery, without storing
/// anything.
pub async fn fetch_title(client: &reqwest::Client, url: &str) -> Result<Option<String>, FetchError> {
    let bytes = download(client, url).await?;
    let ParseResult { title, .. } = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
    Ok(title)
}

/// Download an article page for offline reading.
///
/// Uses the same retry, timeout and size limits as feed downloads. Invalid
/// UTF-8 is replaced rather than rejected.
pub async fn fetch_page(client: &reqwest::Client, link: &str) -> Result<String, FetchError> {
    let bytes = download(client, link).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn count_failure(db: &Database, feed: &Feed) {
    match db.increment_feed_failures(feed.id).await {
        Ok(failures) => {
            if failures >= Database::CIRCUIT_BREAKER_THRESHOLD {
                tracing::info!(
                    feed_id = feed.id,
                    title = %feed.title,
                    failures = failures,
                    "Feed circuit breaker tripped - will be skipped until manual retry"
                );
            }
        }
        Err(db_err) => {
            tracing::warn!(
                feed_id = feed.id,
                error = %db_err,
                "Failed to increment feed failure count"
            );
        }
    }
}

async fn fetch_one(db: &Database, client: &reqwest::Client, feed: &Feed) -> Result<usize, FetchError> {
    let bytes = download(client, &feed.fetch_url).await?;

    let ParseResult {
        articles, skipped, ..
    } = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    if skipped > 0 {
        tracing::warn!(
            feed = %feed.url,
            filtered = skipped,
            "Entries without a usable link skipped"
        );
    }

    // Upsert, clear error and stamp last_updated in one transaction
    db.complete_feed_refresh(feed.id, &articles)
        .await
        .map_err(|e| FetchError::Database(e.to_string()))
}

/// Delay before retry number `retry` (0-based): 2s, 4s, 8s.
#[cfg(not(test))]
fn retry_delay(retry: u32) -> Duration {
    Duration::from_secs(2u64.pow(retry + 1))
}

#[cfg(test)]
fn retry_delay(retry: u32) -> Duration {
    Duration::from_millis(2u64.pow(retry + 1))
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let mut retry_count = 0;

    loop {
        let response = tokio::time::timeout(REQUEST_TIMEOUT, client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            if retry_count >= MAX_RETRIES {
                return Err(if status.is_server_error() {
                    FetchError::HttpStatus(status.as_u16())
                } else {
                    FetchError::RateLimited(MAX_RETRIES)
                });
            }

            let delay = retry_delay(retry_count);
            tracing::warn!(
                feed = %url,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Feed server refused, backing off"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        // 4xx errors fail immediately
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        match read_limited_bytes(response, MAX_FEED_SIZE).await {
            Ok(bytes) => return Ok(bytes),
            Err(FetchError::IncompleteResponse { expected, received }) => {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }

                let delay = retry_delay(retry_count);
                tracing::debug!(
                    feed = %url,
                    expected = expected,
                    received = received,
                    attempt = retry_count + 1,
                    "Retrying incomplete download"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // Fewer bytes than Content-Length: the connection dropped mid-body
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ArticleFilter, Database};
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Mock Feed</title>
    <item><title>Test</title><link>https://example.com/test</link></item>
</channel></rss>"#;

    async fn setup_db_with_feed(url: &str) -> (Database, Feed) {
        let db = Database::open(":memory:").await.unwrap();
        db.insert_feed(url, "Test", None).await.unwrap();
        let feeds = db.get_feeds().await.unwrap();
        (db, feeds.into_iter().next().unwrap())
    }

    fn rss_response() -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_string(VALID_RSS)
            .insert_header("Content-Type", "application/xml")
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(rss_response())
            .mount(&mock_server)
            .await;

        let (db, feed) = setup_db_with_feed(&format!("{}/feed", mock_server.uri())).await;
        let client = reqwest::Client::new();

        let result = refresh_one(&db, &client, &feed).await;
        assert_eq!(result.result.unwrap(), 1);

        let articles = db.get_articles(&ArticleFilter::default()).await.unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(&*articles[0].source, "Test");
    }

    #[tokio::test]
    async fn test_refresh_twice_inserts_once() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(rss_response())
            .mount(&mock_server)
            .await;

        let (db, feed) = setup_db_with_feed(&format!("{}/feed", mock_server.uri())).await;
        let client = reqwest::Client::new();

        assert_eq!(refresh_one(&db, &client, &feed).await.result.unwrap(), 1);
        assert_eq!(refresh_one(&db, &client, &feed).await.result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (db, feed) = setup_db_with_feed(&format!("{}/feed", mock_server.uri())).await;
        let client = reqwest::Client::new();

        let result = refresh_one(&db, &client, &feed).await;
        match result.result.unwrap_err() {
            FetchError::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }

        let stored = db.get_feed(feed.id).await.unwrap().unwrap();
        assert!(stored.error.is_some());
        assert_eq!(stored.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_refresh_500_error_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let (db, feed) = setup_db_with_feed(&format!("{}/feed", mock_server.uri())).await;
        let client = reqwest::Client::new();

        let result = refresh_one(&db, &client, &feed).await;
        match result.result.unwrap_err() {
            FetchError::HttpStatus(500) => {}
            e => panic!("Expected HttpStatus(500), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_refresh_429_gives_up_as_rate_limited() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&mock_server)
            .await;

        let (db, feed) = setup_db_with_feed(&format!("{}/feed", mock_server.uri())).await;
        let client = reqwest::Client::new();

        match refresh_one(&db, &client, &feed).await.result.unwrap_err() {
            FetchError::RateLimited(3) => {}
            e => panic!("Expected RateLimited(3), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_refresh_503_retry_then_success() {
        let mock_server = MockServer::start().await;

        // First two requests return 503, third succeeds
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(rss_response())
            .mount(&mock_server)
            .await;

        let (db, feed) = setup_db_with_feed(&format!("{}/feed", mock_server.uri())).await;
        let client = reqwest::Client::new();

        let result = refresh_one(&db, &client, &feed).await;
        assert_eq!(result.result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&mock_server)
            .await;

        let (db, feed) = setup_db_with_feed(&format!("{}/feed", mock_server.uri())).await;
        let client = reqwest::Client::new();

        match refresh_one(&db, &client, &feed).await.result.unwrap_err() {
            FetchError::Parse(_) => {}
            e => panic!("Expected Parse error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_empty_feed_success() {
        let empty_rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel></channel></rss>"#;

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(empty_rss))
            .mount(&mock_server)
            .await;

        let (db, feed) = setup_db_with_feed(&format!("{}/feed", mock_server.uri())).await;
        let client = reqwest::Client::new();

        assert_eq!(refresh_one(&db, &client, &feed).await.result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_all_skips_circuit_broken_feeds() {
        let mock_server = MockServer::start().await;
        Mock::given(path("/good"))
            .respond_with(rss_response())
            .mount(&mock_server)
            .await;
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(404))
            .expect(0)
            .mount(&mock_server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        db.insert_feed(&format!("{}/good", mock_server.uri()), "Good", None)
            .await
            .unwrap();
        let broken = db
            .insert_feed(&format!("{}/broken", mock_server.uri()), "Broken", None)
            .await
            .unwrap();
        for _ in 0..Database::CIRCUIT_BREAKER_THRESHOLD {
            db.increment_feed_failures(broken).await.unwrap();
        }

        let feeds = db.get_feeds().await.unwrap();
        let results = refresh_all(&db, &reqwest::Client::new(), &feeds, 4).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result.as_ref().unwrap(), &1);
    }

    #[tokio::test]
    async fn test_fetch_title() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(rss_response())
            .mount(&mock_server)
            .await;

        let title = fetch_title(&reqwest::Client::new(), &format!("{}/feed", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(title.as_deref(), Some("Mock Feed"));
    }

    #[tokio::test]
    async fn test_fetch_page_replaces_invalid_utf8() {
        let mock_server = MockServer::start().await;
        let mut body = b"<p>caf".to_vec();
        body.push(0xff);
        body.extend_from_slice(b"</p>");
        Mock::given(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&mock_server)
            .await;

        let page = fetch_page(&reqwest::Client::new(), &format!("{}/story", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(page, "<p>caf\u{fffd}</p>");
    }
}
