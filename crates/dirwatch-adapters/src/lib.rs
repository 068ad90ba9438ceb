//! Upstream listing sources, paginated listing fetch and website probing.

pub mod listing;
pub mod probe;
pub mod source;

pub use listing::{fetch_listing, ListFetcherConfig, Listing};
pub use probe::{scan_html, HttpProber, ProbeRuleSet, ProbeRules, RuleError, SiteProber};
pub use source::{
    parse_hits, AlgoliaConfig, AlgoliaSource, FixtureListing, FixtureSource, ListSource,
    PageRequest, SourceError,
};

pub const CRATE_NAME: &str = "dirwatch-adapters";
