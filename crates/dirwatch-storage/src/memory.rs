//! In-process `CompanyStore` for tests and dry runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dirwatch_core::{
    CompanyAttributes, EnrichmentRecord, Entity, EntityId, Fingerprint, NormalizedCompany,
    RunSummary, Snapshot,
};
use tokio::sync::Mutex;

use crate::store::{CompanyStore, EnrichmentTarget, EntityUpsert, SnapshotAppend, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    entities: Vec<Entity>,
    by_upstream: HashMap<String, EntityId>,
    snapshots: HashMap<EntityId, Vec<Snapshot>>,
    next_snapshot_id: i64,
    enrichment: HashMap<EntityId, EnrichmentRecord>,
    runs: Vec<RunSummary>,
    failing_upstream_ids: HashSet<String>,
    fail_enrichment_writes: bool,
}

impl MemoryState {
    fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.entities.get_mut(idx)
    }
}

/// All state lives behind one lock, which makes every operation atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write touching `upstream_id` fail until cleared.
    pub async fn fail_writes_for(&self, upstream_id: &str) {
        self.state
            .lock()
            .await
            .failing_upstream_ids
            .insert(upstream_id.to_string());
    }

    pub async fn set_fail_enrichment_writes(&self, fail: bool) {
        self.state.lock().await.fail_enrichment_writes = fail;
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.failing_upstream_ids.clear();
        state.fail_enrichment_writes = false;
    }

    pub async fn entity_count(&self) -> usize {
        self.state.lock().await.entities.len()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.state.lock().await.snapshots.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl CompanyStore for MemoryStore {
    async fn upsert_entity(
        &self,
        company: &NormalizedCompany,
        seen_at: DateTime<Utc>,
    ) -> Result<EntityUpsert, StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_upstream_ids.contains(&company.upstream_id) {
            return Err(StoreError::Unavailable(format!(
                "writes for {} are failing",
                company.upstream_id
            )));
        }

        if let Some(id) = state.by_upstream.get(&company.upstream_id).copied() {
            let entity = state
                .entity_mut(id)
                .ok_or(StoreError::UnknownEntity(id))?;
            entity.name = company.name.clone();
            entity.domain = company.domain.clone();
            entity.slug = company.slug.clone();
            entity.last_seen = entity.last_seen.max(seen_at);
            entity.active = true;
            return Ok(EntityUpsert {
                entity: entity.clone(),
                created: false,
            });
        }

        let id = state.entities.len() as EntityId + 1;
        let entity = Entity {
            id,
            upstream_id: company.upstream_id.clone(),
            name: company.name.clone(),
            domain: company.domain.clone(),
            slug: company.slug.clone(),
            first_seen: seen_at,
            last_seen: seen_at,
            active: true,
        };
        state.entities.push(entity.clone());
        state.by_upstream.insert(company.upstream_id.clone(), id);
        Ok(EntityUpsert {
            entity,
            created: true,
        })
    }

    async fn append_snapshot_if_changed(
        &self,
        entity_id: EntityId,
        attributes: &CompanyAttributes,
        fingerprint: &Fingerprint,
        captured_at: DateTime<Utc>,
    ) -> Result<SnapshotAppend, StoreError> {
        let mut state = self.state.lock().await;
        let upstream_id = state
            .entity_mut(entity_id)
            .map(|e| e.upstream_id.clone())
            .ok_or(StoreError::UnknownEntity(entity_id))?;
        if state.failing_upstream_ids.contains(&upstream_id) {
            return Err(StoreError::Unavailable(format!(
                "writes for {upstream_id} are failing"
            )));
        }

        let latest = state
            .snapshots
            .get(&entity_id)
            .and_then(|history| history.last())
            .map(|s| (s.seq, s.fingerprint.clone()));
        if let Some((latest_seq, latest_print)) = &latest {
            if latest_print == fingerprint {
                return Ok(SnapshotAppend::Unchanged {
                    latest_seq: *latest_seq,
                });
            }
        }

        state.next_snapshot_id += 1;
        let snapshot = Snapshot {
            id: state.next_snapshot_id,
            entity_id,
            seq: latest.as_ref().map(|(seq, _)| seq + 1).unwrap_or(1),
            attributes: attributes.clone(),
            fingerprint: fingerprint.clone(),
            captured_at,
        };
        state
            .snapshots
            .entry(entity_id)
            .or_default()
            .push(snapshot.clone());
        Ok(SnapshotAppend::Appended {
            snapshot,
            previous: latest.map(|(_, print)| print),
        })
    }

    async fn upsert_enrichment(&self, record: &EnrichmentRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_enrichment_writes {
            return Err(StoreError::Unavailable("enrichment writes are failing".into()));
        }
        if state.entity_mut(record.entity_id).is_none() {
            return Err(StoreError::UnknownEntity(record.entity_id));
        }
        state.enrichment.insert(record.entity_id, record.clone());
        Ok(())
    }

    async fn insert_run_summary(&self, summary: &RunSummary) -> Result<(), StoreError> {
        self.state.lock().await.runs.push(summary.clone());
        Ok(())
    }

    async fn deactivate_absent(&self, present: &[String]) -> Result<u64, StoreError> {
        let present: HashSet<&str> = present.iter().map(String::as_str).collect();
        let mut state = self.state.lock().await;
        let mut deactivated = 0;
        for entity in state
            .entities
            .iter_mut()
            .filter(|e| e.active && !present.contains(e.upstream_id.as_str()))
        {
            entity.active = false;
            deactivated += 1;
        }
        Ok(deactivated)
    }

    async fn enrichment_targets(&self) -> Result<Vec<EnrichmentTarget>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .iter()
            .filter(|e| e.active)
            .filter_map(|e| {
                e.domain.as_ref().map(|domain| EnrichmentTarget {
                    entity_id: e.id,
                    name: e.name.clone(),
                    domain: domain.clone(),
                })
            })
            .collect())
    }

    async fn entity_by_upstream_id(&self, upstream_id: &str) -> Result<Option<Entity>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .by_upstream
            .get(upstream_id)
            .and_then(|id| usize::try_from(*id).ok()?.checked_sub(1))
            .and_then(|idx| state.entities.get(idx))
            .cloned())
    }

    async fn snapshots_for(&self, entity_id: EntityId) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.snapshots.get(&entity_id).cloned().unwrap_or_default())
    }

    async fn enrichment_for(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EnrichmentRecord>, StoreError> {
        Ok(self.state.lock().await.enrichment.get(&entity_id).cloned())
    }

    async fn run_summaries(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().rev().take(limit).cloned().collect())
    }
}
