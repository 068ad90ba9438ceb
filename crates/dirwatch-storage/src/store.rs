use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dirwatch_core::{
    CompanyAttributes, EnrichmentRecord, Entity, EntityId, Fingerprint, NormalizedCompany,
    RunSummary, Snapshot,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("applying migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityUpsert {
    pub entity: Entity,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotAppend {
    /// A snapshot was inserted. `previous` is the fingerprint it replaced,
    /// `None` when the entity had no history yet.
    Appended {
        snapshot: Snapshot,
        previous: Option<Fingerprint>,
    },
    /// The latest snapshot already carries this fingerprint.
    Unchanged { latest_seq: i64 },
}

/// Active entity with a domain worth probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentTarget {
    pub entity_id: EntityId,
    pub name: String,
    pub domain: String,
}

/// Persistence boundary of the ingestion pipeline.
///
/// `append_snapshot_if_changed` is a compare-and-insert: reading the latest
/// fingerprint and inserting the next snapshot happen atomically per entity,
/// so two writers can never both append the same state.
#[async_trait]
pub trait CompanyStore: Send + Sync {
    /// Insert by upstream identity, or refresh name/domain/slug, `last_seen`
    /// and `active` on an existing entity.
    async fn upsert_entity(
        &self,
        company: &NormalizedCompany,
        seen_at: DateTime<Utc>,
    ) -> Result<EntityUpsert, StoreError>;

    async fn append_snapshot_if_changed(
        &self,
        entity_id: EntityId,
        attributes: &CompanyAttributes,
        fingerprint: &Fingerprint,
        captured_at: DateTime<Utc>,
    ) -> Result<SnapshotAppend, StoreError>;

    /// Overwrite (or create) the enrichment row of one entity.
    async fn upsert_enrichment(&self, record: &EnrichmentRecord) -> Result<(), StoreError>;

    async fn insert_run_summary(&self, summary: &RunSummary) -> Result<(), StoreError>;

    /// Mark every active entity whose upstream id is not in `present`
    /// inactive. Returns the number of entities deactivated.
    async fn deactivate_absent(&self, present: &[String]) -> Result<u64, StoreError>;

    async fn enrichment_targets(&self) -> Result<Vec<EnrichmentTarget>, StoreError>;

    async fn entity_by_upstream_id(&self, upstream_id: &str) -> Result<Option<Entity>, StoreError>;

    /// Full history of one entity, oldest first.
    async fn snapshots_for(&self, entity_id: EntityId) -> Result<Vec<Snapshot>, StoreError>;

    async fn enrichment_for(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EnrichmentRecord>, StoreError>;

    /// Most recent runs first.
    async fn run_summaries(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError>;
}
