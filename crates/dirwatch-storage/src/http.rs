//! Shared HTTP client: bounded concurrency, optional token bucket, one
//! attempt per request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.is_zero() {
                return;
            }
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {0:?}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid json: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

/// Every request makes exactly one attempt; callers decide what a failure means.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<TokenBucket>>,
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
        let token_bucket = config.token_bucket.map(|c| Arc::new(TokenBucket::new(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    fn parse_url(url: &str) -> Result<(Url, String), FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?
            .to_string();
        Ok((parsed, host))
    }

    async fn send(
        &self,
        host: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_host = self.per_host_semaphore(host).await;
        let _host = per_host.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            debug!(status = status.as_u16(), url = %final_url, "non-success response");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// GET with an optional per-request timeout overriding the client default.
    pub async fn get(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let (parsed, host) = Self::parse_url(url)?;
        let mut request = self.client.get(parsed);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let span = info_span!("http_get", url, host = %host);
        self.send(&host, request).instrument(span).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        let (parsed, host) = Self::parse_url(url)?;
        let mut request = self.client.post(parsed).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let span = info_span!("http_post", url, host = %host);
        let fetched = self.send(&host, request).instrument(span).await?;
        serde_json::from_slice(&fetched.body).map_err(|source| FetchError::Decode {
            url: fetched.final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            request
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn get_returns_body_on_success() {
        let (base, server) = serve_once("200 OK", "<html>hi</html>").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = fetcher.get(&format!("{base}/"), None).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"<html>hi</html>");
        assert!(server.await.unwrap().starts_with("GET / "));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (base, _server) = serve_once("404 Not Found", "gone").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.get(&format!("{base}/missing"), None).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }), "{err}");
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn post_json_sends_headers_and_decodes() {
        let (base, server) = serve_once("200 OK", r#"{"results":[{"hits":[]}]}"#).await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let value = fetcher
            .post_json(&format!("{base}/q"), &[("X-Test-Key", "k1")], &json!({"page": 0}))
            .await
            .unwrap();
        assert_eq!(value["results"][0]["hits"], json!([]));
        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /q "));
        assert!(request.contains("x-test-key: k1"));
        assert!(request.contains(r#"{"page":0}"#));
    }

    #[tokio::test]
    async fn invalid_urls_are_rejected_before_sending() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        for url in ["", "https://", "not a url", "mailto:someone@acme.io"] {
            let err = fetcher.get(url, None).await.unwrap_err();
            assert!(matches!(err, FetchError::InvalidUrl(_)), "{url}: {err}");
        }
    }

    #[tokio::test]
    async fn hanging_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher
            .get(&format!("http://{addr}/"), Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn token_bucket_spaces_out_requests_beyond_capacity() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::from_millis(40),
        });
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(40));
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(39));
    }
}
