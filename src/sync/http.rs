use std::time::Duration;

use reqwest::header::{AUTHORIZATION, ETAG, IF_MATCH, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};

use super::store::{BlobStore, CloudError, VersionedBlob};

const MAX_RECORD_SIZE: usize = 10 * 1024 * 1024; // 10MB
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Blob store backed by a plain HTTP record service.
///
/// Records live at `{endpoint}/records/{key}`. Versions travel in the
/// `ETag` header; writes send `If-Match: "<version>"` or, for a record that
/// must not exist yet, `If-None-Match: *`.
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: String,
    token: Option<SecretString>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBlobStore")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpBlobStore {
    /// Build a store for `endpoint`. Plain HTTP is only accepted for
    /// localhost.
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, CloudError> {
        let parsed = url::Url::parse(endpoint)
            .map_err(|e| CloudError::Permanent(format!("Invalid sync endpoint: {e}")))?;
        let is_local = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
        if parsed.scheme() != "https" && !(parsed.scheme() == "http" && is_local) {
            return Err(CloudError::Permanent(
                "Sync endpoint must use HTTPS".to_string(),
            ));
        }

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            timeout,
        })
    }

    fn record_url(&self, key: &str) -> String {
        format!("{}/records/{}", self.endpoint, key)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret())),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, CloudError> {
        tokio::time::timeout(self.timeout, self.authorize(request).send())
            .await
            .map_err(|_| CloudError::Transient("Request timed out".to_string()))?
            .map_err(|e| CloudError::Transient(e.to_string()))
    }
}

impl BlobStore for HttpBlobStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedBlob>, CloudError> {
        let response = self.send(self.client.get(self.record_url(key))).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response)?;
        let version = etag_version(&response)?;
        let data = read_limited_bytes(response).await?;
        Ok(Some(VersionedBlob { data, version }))
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, CloudError> {
        let mut request = self
            .client
            .put(self.record_url(key))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data);
        request = match expected_version {
            Some(v) => request.header(IF_MATCH, format!("\"{v}\"")),
            None => request.header(IF_NONE_MATCH, "*"),
        };

        let response = check_status(self.send(request).await?)?;
        etag_version(&response)
    }
}

fn check_status(response: Response) -> Result<Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            Err(CloudError::Conflict(format!("status {}", status.as_u16())))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            Err(CloudError::RateLimited { retry_after })
        }
        s if s.is_server_error() => Err(CloudError::Transient(format!("status {}", s.as_u16()))),
        s => Err(CloudError::Permanent(format!("status {}", s.as_u16()))),
    }
}

fn etag_version(response: &Response) -> Result<u64, CloudError> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_start_matches("W/").trim_matches('"'))
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| CloudError::Permanent("Missing or invalid ETag".to_string()))
}

async fn read_limited_bytes(response: Response) -> Result<Vec<u8>, CloudError> {
    use futures::StreamExt;

    if let Some(len) = response.content_length() {
        if len as usize > MAX_RECORD_SIZE {
            return Err(CloudError::Permanent("Record too large".to_string()));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CloudError::Transient(e.to_string()))?;
        if bytes.len().saturating_add(chunk.len()) > MAX_RECORD_SIZE {
            return Err(CloudError::Permanent("Record too large".to_string()));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> HttpBlobStore {
        HttpBlobStore::new(
            reqwest::Client::new(),
            &server.uri(),
            Some(SecretString::from("s3cret")),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_plain_http_for_remote_hosts() {
        let result = HttpBlobStore::new(
            reqwest::Client::new(),
            "http://sync.example.com",
            None,
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(CloudError::Permanent(_))));
    }

    #[test]
    fn test_debug_hides_token() {
        let store = HttpBlobStore::new(
            reqwest::Client::new(),
            "https://sync.example.com/",
            Some(SecretString::from("s3cret")),
            Duration::from_secs(5),
        )
        .unwrap();
        let debug = format!("{store:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_get_missing_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records/feeds"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(store_for(&server).get("feeds").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_reads_version_from_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records/tags"))
            .and(header("Authorization", "Bearer s3cret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"7\"")
                    .set_body_string("{\"entries\":{}}"),
            )
            .mount(&server)
            .await;

        let blob = store_for(&server).get("tags").await.unwrap().unwrap();
        assert_eq!(blob.version, 7);
        assert_eq!(blob.data, b"{\"entries\":{}}");
    }

    #[tokio::test]
    async fn test_put_sends_preconditions() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/records/feeds"))
            .and(header("If-None-Match", "*"))
            .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"1\""))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/records/feeds"))
            .and(header("If-Match", "\"1\""))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"2\""))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert_eq!(store.put("feeds", b"{}".to_vec(), None).await.unwrap(), 1);
        assert_eq!(store.put("feeds", b"{}".to_vec(), Some(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/records/conflict"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/records/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/records/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/records/forbidden"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert!(matches!(
            store.put("conflict", vec![], Some(1)).await,
            Err(CloudError::Conflict(_))
        ));
        assert_eq!(
            store.put("limited", vec![], None).await,
            Err(CloudError::RateLimited {
                retry_after: Duration::from_secs(12)
            })
        );
        assert!(matches!(
            store.put("down", vec![], None).await,
            Err(CloudError::Transient(_))
        ));
        assert!(matches!(
            store.put("forbidden", vec![], None).await,
            Err(CloudError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_without_header_uses_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        assert_eq!(
            store_for(&server).get("feeds").await,
            Err(CloudError::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER
            })
        );
    }
}
