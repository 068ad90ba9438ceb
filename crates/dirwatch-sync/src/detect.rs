use std::sync::Arc;

use chrono::{DateTime, Utc};
use dirwatch_core::{
    fingerprint, normalize_record, EntityOutcome, NormalizeError, NormalizedCompany, RawCompany,
};
use dirwatch_storage::{CompanyStore, SnapshotAppend, StoreError};
use tracing::{debug, warn};

/// What happened to one upstream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub name: String,
    pub outcome: EntityOutcome,
}

/// Normalizes a record, upserts its entity and appends a snapshot when the
/// fingerprint moved. Errors stop at this boundary as `Failed`.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn CompanyStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn CompanyStore>) -> Self {
        Self { store }
    }

    pub async fn process(&self, raw: &RawCompany, seen_at: DateTime<Utc>) -> Detection {
        let company = match normalize_record(raw) {
            Ok(company) => company,
            Err(err) => {
                warn!(error = %err, "skipping record");
                let NormalizeError::MissingIdentity { name } = err;
                return Detection {
                    name,
                    outcome: EntityOutcome::Failed,
                };
            }
        };

        match self.apply(&company, seen_at).await {
            Ok(outcome) => Detection {
                name: company.name,
                outcome,
            },
            Err(err) => {
                warn!(
                    upstream_id = %company.upstream_id,
                    name = %company.name,
                    error = %err,
                    "entity failed"
                );
                Detection {
                    name: company.name,
                    outcome: EntityOutcome::Failed,
                }
            }
        }
    }

    async fn apply(
        &self,
        company: &NormalizedCompany,
        seen_at: DateTime<Utc>,
    ) -> Result<EntityOutcome, StoreError> {
        let fp = fingerprint(&company.attributes);
        let upsert = self.store.upsert_entity(company, seen_at).await?;
        let append = self
            .store
            .append_snapshot_if_changed(upsert.entity.id, &company.attributes, &fp, Utc::now())
            .await?;

        let outcome = match &append {
            SnapshotAppend::Appended { previous: None, .. } => EntityOutcome::New,
            SnapshotAppend::Appended { .. } if upsert.created => EntityOutcome::New,
            SnapshotAppend::Appended { .. } => EntityOutcome::Updated,
            SnapshotAppend::Unchanged { .. } if upsert.created => EntityOutcome::New,
            SnapshotAppend::Unchanged { .. } => EntityOutcome::Unchanged,
        };

        match &append {
            SnapshotAppend::Appended { snapshot, previous } => debug!(
                upstream_id = %company.upstream_id,
                seq = snapshot.seq,
                fingerprint = %fp.short(),
                previous = previous.as_ref().map(|p| p.short()).unwrap_or("-"),
                outcome = outcome.as_str(),
                "snapshot appended"
            ),
            SnapshotAppend::Unchanged { latest_seq } => debug!(
                upstream_id = %company.upstream_id,
                seq = latest_seq,
                fingerprint = %fp.short(),
                "fingerprint unchanged"
            ),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirwatch_storage::MemoryStore;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawCompany {
        RawCompany::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn first_changed_and_unchanged_sightings() {
        let store = Arc::new(MemoryStore::new());
        let detector = ChangeDetector::new(store.clone());
        let record = raw(json!({"id": "abc", "name": "Acme", "batch": "W21"}));

        let first = detector.process(&record, Utc::now()).await;
        assert_eq!(
            first,
            Detection {
                name: "Acme".into(),
                outcome: EntityOutcome::New,
            }
        );
        assert_eq!(detector.process(&record, Utc::now()).await.outcome, EntityOutcome::Unchanged);

        let moved = raw(json!({"id": "abc", "name": "Acme", "batch": "S21"}));
        assert_eq!(detector.process(&moved, Utc::now()).await.outcome, EntityOutcome::Updated);
        assert_eq!(store.snapshot_count().await, 2);
    }

    #[tokio::test]
    async fn identity_change_alone_is_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let detector = ChangeDetector::new(store.clone());
        detector
            .process(&raw(json!({"id": "abc", "name": "Acme", "website": "acme.io"})), Utc::now())
            .await;
        let renamed = raw(json!({"id": "abc", "name": "Acme Inc", "website": "acme.com"}));
        assert_eq!(detector.process(&renamed, Utc::now()).await.outcome, EntityOutcome::Unchanged);

        let entity = store.entity_by_upstream_id("abc").await.unwrap().unwrap();
        assert_eq!(entity.name, "Acme Inc");
        assert_eq!(entity.domain.as_deref(), Some("acme.com"));
        assert_eq!(store.snapshot_count().await, 1);
    }

    #[tokio::test]
    async fn missing_identity_fails_with_name() {
        let detector = ChangeDetector::new(Arc::new(MemoryStore::new()));
        let detection = detector.process(&raw(json!({"name": "Ghost"})), Utc::now()).await;
        assert_eq!(
            detection,
            Detection {
                name: "Ghost".into(),
                outcome: EntityOutcome::Failed,
            }
        );
    }

    #[tokio::test]
    async fn store_failure_is_contained() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes_for("abc").await;
        let detector = ChangeDetector::new(store.clone());
        let record = raw(json!({"id": "abc", "name": "Acme"}));
        let detection = detector.process(&record, Utc::now()).await;
        assert_eq!(detection.outcome, EntityOutcome::Failed);
        assert_eq!(store.snapshot_count().await, 0);
    }
}
