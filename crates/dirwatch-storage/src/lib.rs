//! HTTP fetch utilities and the persistence boundary for dirwatch.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use http::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, TokenBucket, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{CompanyStore, EnrichmentTarget, EntityUpsert, SnapshotAppend, StoreError};

pub const CRATE_NAME: &str = "dirwatch-storage";
