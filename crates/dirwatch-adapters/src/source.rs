//! Upstream listing sources: the public search index and a fixture-backed
//! stand-in for tests and dry runs.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dirwatch_core::RawCompany;
use dirwatch_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub query: String,
    pub page: u32,
    pub hits_per_page: u32,
    pub filters: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed listing response: {0}")]
    Malformed(String),
    #[error("page {0} unavailable")]
    PageUnavailable(u32),
}

/// One page of the upstream company listing.
#[async_trait]
pub trait ListSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawCompany>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct AlgoliaConfig {
    pub endpoint: String,
    pub app_id: String,
    pub api_key: String,
    pub index_name: String,
}

impl AlgoliaConfig {
    /// Multi-query endpoint derived from the application id.
    pub fn default_endpoint(app_id: &str) -> String {
        format!(
            "https://{}-dsn.algolia.net/1/indexes/*/queries",
            app_id.to_ascii_lowercase()
        )
    }
}

/// Paginated search-index source. Sends a single-query multi-query body
/// and reads hits from the first result set.
pub struct AlgoliaSource {
    http: Arc<HttpFetcher>,
    config: AlgoliaConfig,
}

impl AlgoliaSource {
    pub fn new(http: Arc<HttpFetcher>, config: AlgoliaConfig) -> Self {
        Self { http, config }
    }

    pub fn request_body(&self, request: &PageRequest) -> JsonValue {
        let mut query = json!({
            "indexName": self.config.index_name,
            "query": request.query,
            "page": request.page,
            "hitsPerPage": request.hits_per_page,
        });
        if let Some(filters) = request.filters.as_deref().filter(|f| !f.trim().is_empty()) {
            query["filters"] = JsonValue::String(filters.to_string());
        }
        json!({ "requests": [query] })
    }
}

/// Pulls `results[0].hits` out of a multi-query response. Hits that are not
/// objects are skipped.
pub fn parse_hits(response: &JsonValue) -> Result<Vec<RawCompany>, SourceError> {
    let hits = response
        .get("results")
        .and_then(JsonValue::as_array)
        .and_then(|results| results.first())
        .and_then(|first| first.get("hits"))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SourceError::Malformed("missing results[0].hits".to_string()))?;

    let mut records = Vec::with_capacity(hits.len());
    for hit in hits {
        match RawCompany::from_value(hit.clone()) {
            Some(record) => records.push(record),
            None => warn!("skipping non-object hit in listing response"),
        }
    }
    Ok(records)
}

#[async_trait]
impl ListSource for AlgoliaSource {
    fn source_id(&self) -> &str {
        &self.config.index_name
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawCompany>, SourceError> {
        let body = self.request_body(request);
        let headers = [
            ("X-Algolia-Application-Id", self.config.app_id.as_str()),
            ("X-Algolia-API-Key", self.config.api_key.as_str()),
        ];
        let response = self
            .http
            .post_json(&self.config.endpoint, &headers, &body)
            .await?;
        let records = parse_hits(&response)?;
        debug!(page = request.page, hits = records.len(), "listing page decoded");
        Ok(records)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureListing {
    pub source_id: String,
    pub hits: Vec<JsonValue>,
}

/// Serves a fixed set of records, sliced into pages by `hits_per_page`.
#[derive(Debug)]
pub struct FixtureSource {
    source_id: String,
    records: Vec<RawCompany>,
    fail_on_page: Option<u32>,
    requests: Mutex<Vec<PageRequest>>,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, records: Vec<RawCompany>) -> Self {
        Self {
            source_id: source_id.into(),
            records,
            fail_on_page: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let listing: FixtureListing = read_json_file(path)?;
        let records = listing
            .hits
            .into_iter()
            .filter_map(RawCompany::from_value)
            .collect();
        Ok(Self::new(listing.source_id, records))
    }

    /// Requests for `page` fail instead of returning data.
    pub fn failing_on_page(mut self, page: u32) -> Self {
        self.fail_on_page = Some(page);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ListSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawCompany>, SourceError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        if self.fail_on_page == Some(request.page) {
            return Err(SourceError::PageUnavailable(request.page));
        }
        let size = request.hits_per_page.max(1) as usize;
        let start = (request.page as usize).saturating_mul(size);
        Ok(self
            .records
            .iter()
            .skip(start)
            .take(size)
            .cloned()
            .collect())
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirwatch_storage::HttpClientConfig;

    fn records(n: usize) -> Vec<RawCompany> {
        (0..n)
            .map(|i| {
                RawCompany::from_value(json!({"id": format!("c{i}"), "name": format!("Co {i}")}))
                    .unwrap()
            })
            .collect()
    }

    fn request(page: u32, hits_per_page: u32) -> PageRequest {
        PageRequest {
            query: String::new(),
            page,
            hits_per_page,
            filters: None,
        }
    }

    #[test]
    fn request_body_matches_multi_query_shape() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let source = AlgoliaSource::new(
            http,
            AlgoliaConfig {
                endpoint: "http://127.0.0.1:1/q".to_string(),
                app_id: "APP".to_string(),
                api_key: "key".to_string(),
                index_name: "Companies".to_string(),
            },
        );
        let mut req = request(3, 100);
        req.filters = Some("batch:W21".to_string());
        assert_eq!(
            source.request_body(&req),
            json!({"requests": [{
                "indexName": "Companies",
                "query": "",
                "page": 3,
                "hitsPerPage": 100,
                "filters": "batch:W21",
            }]})
        );

        req.filters = Some("  ".to_string());
        assert!(source.request_body(&req)["requests"][0].get("filters").is_none());
    }

    #[test]
    fn default_endpoint_uses_lowercased_app_id() {
        assert_eq!(
            AlgoliaConfig::default_endpoint("ABC123"),
            "https://abc123-dsn.algolia.net/1/indexes/*/queries"
        );
    }

    #[test]
    fn parse_hits_skips_non_objects() {
        let response = json!({"results": [{"hits": [{"id": "a"}, 7, {"id": "b"}]}]});
        let hits = parse_hits(&response).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].get("id"), Some(&json!("b")));
    }

    #[test]
    fn parse_hits_rejects_missing_result_set() {
        for response in [json!({}), json!({"results": []}), json!({"results": [{"nbHits": 0}]})] {
            assert!(matches!(parse_hits(&response), Err(SourceError::Malformed(_))));
        }
    }

    #[tokio::test]
    async fn fixture_source_slices_pages() {
        let source = FixtureSource::new("fixture", records(5));
        assert_eq!(source.fetch_page(&request(0, 2)).await.unwrap().len(), 2);
        assert_eq!(source.fetch_page(&request(2, 2)).await.unwrap().len(), 1);
        assert!(source.fetch_page(&request(3, 2)).await.unwrap().is_empty());
        assert_eq!(source.requests().len(), 3);
    }

    #[tokio::test]
    async fn fixture_source_fails_on_requested_page() {
        let source = FixtureSource::new("fixture", records(5)).failing_on_page(1);
        assert!(source.fetch_page(&request(0, 2)).await.is_ok());
        assert!(matches!(
            source.fetch_page(&request(1, 2)).await,
            Err(SourceError::PageUnavailable(1))
        ));
    }
}
