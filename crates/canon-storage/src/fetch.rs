//! Remote document fetching for ingest, and the immutable raw-document archive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use canon_core::host_of;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub requested_uri: String,
    pub final_uri: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {uri}")]
    HttpStatus { status: u16, uri: String },
    #[error("document unavailable: {0}")]
    Unavailable(String),
}

/// Anything that can produce the raw bytes behind a resource URI.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<FetchedDocument, FetchError>;
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
            },
        }
    }
}

/// HTTP source with global and per-host concurrency limits and retry on 5xx/429.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    async fn fetch_with_retry(&self, uri: &str) -> Result<FetchedDocument, FetchError> {
        let mut attempt = 0usize;
        loop {
            let outcome = self
                .client
                .get(uri)
                .header(ACCEPT, "application/json")
                .send()
                .await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    let final_uri = resp.url().to_string();
                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedDocument {
                            requested_uri: uri.to_string(),
                            final_uri,
                            content_type,
                            body,
                            fetched_at: Utc::now(),
                        });
                    }
                    if !is_retryable_status(status) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            uri: final_uri,
                        });
                    }
                    warn!(uri, status = status.as_u16(), attempt, "retrying fetch");
                }
                Err(err) => {
                    if !is_retryable_error(&err) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::Request(err));
                    }
                    warn!(uri, error = %err, attempt, "retrying fetch");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl DocumentSource for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<FetchedDocument, FetchError> {
        let host = host_of(uri).ok_or_else(|| FetchError::Unavailable(format!("not a URL: {uri}")))?;
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        let per_host = self.host_semaphore(&host).await;
        let _host = per_host
            .acquire()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        self.fetch_with_retry(uri)
            .instrument(info_span!("http_fetch", uri, host = host.as_str()))
            .await
    }
}

/// Documents served from memory, keyed by URI. Used for fixtures and tests.
#[derive(Debug, Default)]
pub struct FixtureSource {
    documents: Mutex<HashMap<String, Vec<u8>>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, uri: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.documents.lock().await.insert(uri.into(), body.into());
    }
}

#[async_trait]
impl DocumentSource for FixtureSource {
    async fn fetch(&self, uri: &str) -> Result<FetchedDocument, FetchError> {
        let body = self
            .documents
            .lock()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| FetchError::Unavailable(uri.to_string()))?;
        Ok(FetchedDocument {
            requested_uri: uri.to_string(),
            final_uri: uri.to_string(),
            content_type: Some("application/json".to_string()),
            body,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed store of every raw document ingest has fetched.
#[derive(Debug, Clone)]
pub struct DocumentArchive {
    root: PathBuf,
}

impl DocumentArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<host>/<first two hash chars>/<hash>.json`
    pub fn relative_path_for(uri: &str, content_hash: &str) -> PathBuf {
        let host = host_of(uri).unwrap_or_else(|| "local".to_string());
        let shard = content_hash.get(..2).unwrap_or("00");
        PathBuf::from(host)
            .join(shard)
            .join(format!("{content_hash}.json"))
    }

    /// Write the body once, via a temp file renamed into place.
    pub async fn store(&self, document: &FetchedDocument) -> anyhow::Result<ArchivedDocument> {
        let content_hash = Self::sha256_hex(&document.body);
        let relative_path = Self::relative_path_for(&document.final_uri, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedDocument {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: document.body.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(&document.body)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves `statuses` in order, one per connection, repeating the last one.
    async fn scripted_server(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let code = statuses[n.min(statuses.len() - 1)];
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }
                let body = "{}";
                let response = format!(
                    "HTTP/1.1 {code} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/doc"), hits)
    }

    fn fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..HttpClientConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn fetch_retries_server_errors_until_success() {
        let (uri, hits) = scripted_server(vec![503, 500, 200]).await;
        let document = fetcher(3).fetch_with_retry(&uri).await.expect("fetch");
        assert_eq!(document.body, b"{}".to_vec());
        assert_eq!(document.content_type.as_deref(), Some("application/json"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_gives_up_after_max_retries() {
        let (uri, hits) = scripted_server(vec![503]).await;
        let err = fetcher(2).fetch_with_retry(&uri).await.expect_err("exhausted");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (uri, hits) = scripted_server(vec![404, 200]).await;
        let err = fetcher(3).fetch_with_retry(&uri).await.expect_err("not found");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_failures_are_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = fetcher(1)
            .fetch_with_retry(&format!("http://{addr}/doc"))
            .await
            .expect_err("refused");
        match err {
            FetchError::Request(inner) => assert!(is_retryable_error(&inner)),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn archive_paths_are_host_sharded() {
        let hash = DocumentArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let path = DocumentArchive::relative_path_for("http://dbpedia.org/resource/Big_Ben", &hash);
        assert_eq!(path, PathBuf::from("dbpedia.org").join("b9").join(format!("{hash}.json")));
    }

    #[tokio::test]
    async fn archive_writes_are_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let archive = DocumentArchive::new(dir.path());
        let fixtures = FixtureSource::new();
        fixtures
            .insert("http://dbpedia.org/resource/Big_Ben", br#"{"iris":[],"kind":"place"}"#.to_vec())
            .await;
        let document = fixtures
            .fetch("http://dbpedia.org/resource/Big_Ben")
            .await
            .expect("fixture");

        let first = archive.store(&document).await.expect("first");
        let second = archive.store(&document).await.expect("second");
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn fixture_source_reports_missing_documents() {
        let fixtures = FixtureSource::new();
        let err = fixtures.fetch("http://nowhere/").await.expect_err("missing");
        assert!(matches!(err, FetchError::Unavailable(_)));
    }
}
