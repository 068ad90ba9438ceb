//! Core domain model for dirwatch: tracked companies, snapshot history,
//! website enrichment and run summaries.

pub mod fingerprint;
pub mod normalize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub use fingerprint::{fingerprint, fingerprint_fields, Fingerprint};
pub use normalize::{
    extract_domain, normalize_record, slugify, upstream_identity, NormalizeError,
};

pub const CRATE_NAME: &str = "dirwatch-core";

/// Stage recorded when the upstream record carries none.
pub const DEFAULT_STAGE: &str = "Active";

/// Store-assigned entity key.
pub type EntityId = i64;

/// One hit from the upstream search index. The shape belongs to the
/// third party, so every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCompany(pub Map<String, JsonValue>);

impl RawCompany {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Accepts JSON objects only; anything else is not a company record.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(map)),
            _ => None,
        }
    }
}

impl From<Map<String, JsonValue>> for RawCompany {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

/// Attributes tracked by the snapshot history. Declaration order has no
/// effect on the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyAttributes {
    pub batch: Option<String>,
    pub stage: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub tags: Vec<String>,
    pub employee_range: Option<String>,
}

impl Default for CompanyAttributes {
    fn default() -> Self {
        Self {
            batch: None,
            stage: DEFAULT_STAGE.to_string(),
            description: None,
            location: None,
            tags: Vec::new(),
            employee_range: None,
        }
    }
}

/// Canonical form of an upstream record, ready for hashing and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedCompany {
    pub upstream_id: String,
    pub name: String,
    pub domain: Option<String>,
    pub slug: Option<String>,
    pub attributes: CompanyAttributes,
}

/// Persisted company. Never deleted; `active` drops to false once the
/// company disappears from a complete listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub upstream_id: String,
    pub name: String,
    pub domain: Option<String>,
    pub slug: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}

/// Immutable capture of an entity's attributes. `seq` starts at 1 and
/// increases by one per appended snapshot of the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub entity_id: EntityId,
    pub seq: i64,
    pub attributes: CompanyAttributes,
    pub fingerprint: Fingerprint,
    pub captured_at: DateTime<Utc>,
}

/// Signals scraped from a company's landing page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WebSignals {
    pub has_careers_page: bool,
    pub has_blog: bool,
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum UnavailableReason {
    EmptyDomain,
    InvalidDomain,
    HttpStatus(u16),
    Timeout,
    Network,
    Body,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDomain => f.write_str("empty domain"),
            Self::InvalidDomain => f.write_str("invalid domain"),
            Self::HttpStatus(status) => write!(f, "http status {status}"),
            Self::Timeout => f.write_str("timed out"),
            Self::Network => f.write_str("network error"),
            Self::Body => f.write_str("unreadable body"),
        }
    }
}

/// Result of probing one website. Probing never fails; a site that could
/// not be read is `Unavailable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Signals(WebSignals),
    Unavailable(UnavailableReason),
}

impl ProbeOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Signals(_))
    }

    /// Signals for this outcome, all negative when the site was unavailable.
    pub fn signals(&self) -> WebSignals {
        match self {
            Self::Signals(signals) => signals.clone(),
            Self::Unavailable(_) => WebSignals::default(),
        }
    }
}

/// Point-in-time cache of the last successful probe for an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub entity_id: EntityId,
    pub has_careers_page: bool,
    pub has_blog: bool,
    pub contact_email: Option<String>,
    pub probed_at: DateTime<Utc>,
}

impl EnrichmentRecord {
    pub fn from_signals(
        entity_id: EntityId,
        signals: WebSignals,
        probed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id,
            has_careers_page: signals.has_careers_page,
            has_blog: signals.has_blog,
            contact_email: signals.contact_email,
            probed_at,
        }
    }
}

/// Per-entity result of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOutcome {
    New,
    Updated,
    Unchanged,
    Failed,
}

impl EntityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
        }
    }
}

/// Why pagination of the upstream listing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStop {
    EmptyPage,
    ShortPage,
    PageFailed,
    PageCap,
}

impl ListingStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyPage => "empty_page",
            Self::ShortPage => "short_page",
            Self::PageFailed => "page_failed",
            Self::PageCap => "page_cap",
        }
    }

    /// Only a natural end of the listing proves absent companies are gone.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::EmptyPage | Self::ShortPage)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "empty_page" => Some(Self::EmptyPage),
            "short_page" => Some(Self::ShortPage),
            "page_failed" => Some(Self::PageFailed),
            "page_cap" => Some(Self::PageCap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnrichmentStats {
    pub targets: u64,
    pub enriched: u64,
    pub unavailable: u64,
    pub write_failures: u64,
    pub deadline_elapsed: bool,
}

/// Outcome counters and timings for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: u64,
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub slowest_ms: f64,
    pub slowest_entity: Option<String>,
    pub pages_fetched: u32,
    pub listing_stop: ListingStop,
    pub deactivated: u64,
    pub enrichment: EnrichmentStats,
}

impl RunSummary {
    pub fn listing_complete(&self) -> bool {
        self.listing_stop.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_company_only_wraps_objects() {
        assert!(RawCompany::from_value(json!({"id": "abc"})).is_some());
        assert!(RawCompany::from_value(json!(["abc"])).is_none());
        assert!(RawCompany::from_value(json!(null)).is_none());
    }

    #[test]
    fn unavailable_probe_yields_negative_signals() {
        let outcome = ProbeOutcome::Unavailable(UnavailableReason::Timeout);
        assert!(!outcome.is_available());
        assert_eq!(outcome.signals(), WebSignals::default());
    }

    #[test]
    fn listing_stop_round_trips_through_str() {
        for stop in [
            ListingStop::EmptyPage,
            ListingStop::ShortPage,
            ListingStop::PageFailed,
            ListingStop::PageCap,
        ] {
            assert_eq!(ListingStop::parse(stop.as_str()), Some(stop));
        }
        assert!(ListingStop::ShortPage.is_complete());
        assert!(!ListingStop::PageFailed.is_complete());
        assert!(!ListingStop::PageCap.is_complete());
    }
}
