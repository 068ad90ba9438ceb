use dirwatch_core::{ListingStop, RawCompany};
use tracing::{error, info, warn};

use crate::source::{ListSource, PageRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFetcherConfig {
    pub query: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub filters: Option<String>,
}

impl Default for ListFetcherConfig {
    fn default() -> Self {
        Self {
            query: String::new(),
            page_size: 100,
            max_pages: 500,
            filters: None,
        }
    }
}

/// Every record gathered before pagination stopped, and why it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub records: Vec<RawCompany>,
    pub pages_fetched: u32,
    pub stop: ListingStop,
}

impl Listing {
    pub fn is_complete(&self) -> bool {
        self.stop.is_complete()
    }
}

/// Walks pages from 0 until an empty or short page, a failed request, or
/// the page cap. A failed page is never retried; records from earlier pages
/// are kept.
pub async fn fetch_listing(source: &dyn ListSource, config: &ListFetcherConfig) -> Listing {
    let page_size = config.page_size.max(1);
    let mut records = Vec::new();
    let mut pages_fetched = 0;

    for page in 0..config.max_pages {
        let request = PageRequest {
            query: config.query.clone(),
            page,
            hits_per_page: page_size,
            filters: config.filters.clone(),
        };
        match source.fetch_page(&request).await {
            Ok(hits) => {
                pages_fetched += 1;
                let count = hits.len();
                records.extend(hits);
                info!(
                    source = source.source_id(),
                    page,
                    hits = count,
                    total = records.len(),
                    "fetched listing page"
                );
                if count == 0 {
                    return Listing {
                        records,
                        pages_fetched,
                        stop: ListingStop::EmptyPage,
                    };
                }
                if count < page_size as usize {
                    return Listing {
                        records,
                        pages_fetched,
                        stop: ListingStop::ShortPage,
                    };
                }
            }
            Err(err) => {
                error!(
                    source = source.source_id(),
                    page,
                    error = %err,
                    "listing page failed; stopping pagination"
                );
                return Listing {
                    records,
                    pages_fetched,
                    stop: ListingStop::PageFailed,
                };
            }
        }
    }

    warn!(
        source = source.source_id(),
        max_pages = config.max_pages,
        total = records.len(),
        "page cap reached before end of listing"
    );
    Listing {
        records,
        pages_fetched,
        stop: ListingStop::PageCap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FixtureSource;
    use serde_json::json;

    fn records(n: usize) -> Vec<RawCompany> {
        (0..n)
            .map(|i| RawCompany::from_value(json!({"id": format!("c{i}")})).unwrap())
            .collect()
    }

    fn config(page_size: u32, max_pages: u32) -> ListFetcherConfig {
        ListFetcherConfig {
            page_size,
            max_pages,
            ..ListFetcherConfig::default()
        }
    }

    #[tokio::test]
    async fn short_page_ends_listing() {
        let source = FixtureSource::new("fixture", records(5));
        let listing = fetch_listing(&source, &config(2, 10)).await;
        assert_eq!(listing.records.len(), 5);
        assert_eq!(listing.pages_fetched, 3);
        assert_eq!(listing.stop, ListingStop::ShortPage);
        assert!(listing.is_complete());
    }

    #[tokio::test]
    async fn exact_multiple_ends_on_empty_page() {
        let source = FixtureSource::new("fixture", records(4));
        let listing = fetch_listing(&source, &config(2, 10)).await;
        assert_eq!(listing.records.len(), 4);
        assert_eq!(listing.pages_fetched, 3);
        assert_eq!(listing.stop, ListingStop::EmptyPage);
    }

    #[tokio::test]
    async fn failed_page_keeps_earlier_records_without_retry() {
        let source = FixtureSource::new("fixture", records(6)).failing_on_page(1);
        let listing = fetch_listing(&source, &config(2, 10)).await;
        assert_eq!(listing.records.len(), 2);
        assert_eq!(listing.pages_fetched, 1);
        assert_eq!(listing.stop, ListingStop::PageFailed);
        assert!(!listing.is_complete());
        assert_eq!(source.requests().len(), 2);
    }

    #[tokio::test]
    async fn page_cap_bounds_requests() {
        let source = FixtureSource::new("fixture", records(10));
        let listing = fetch_listing(&source, &config(2, 3)).await;
        assert_eq!(listing.records.len(), 6);
        assert_eq!(listing.stop, ListingStop::PageCap);
        assert_eq!(source.requests().len(), 3);
    }

    #[tokio::test]
    async fn filters_and_page_size_reach_the_source() {
        let source = FixtureSource::new("fixture", records(1));
        let cfg = ListFetcherConfig {
            filters: Some("batch:S21".to_string()),
            ..config(50, 5)
        };
        fetch_listing(&source, &cfg).await;
        let requests = source.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].hits_per_page, 50);
        assert_eq!(requests[0].filters.as_deref(), Some("batch:S21"));
    }
}
