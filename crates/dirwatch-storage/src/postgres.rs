//! Postgres-backed `CompanyStore`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dirwatch_core::{
    CompanyAttributes, EnrichmentRecord, EnrichmentStats, Entity, EntityId, Fingerprint,
    ListingStop, NormalizedCompany, RunSummary, Snapshot,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use crate::store::{CompanyStore, EnrichmentTarget, EntityUpsert, SnapshotAppend, StoreError};

const ENTITY_COLUMNS: &str =
    "id, upstream_id, name, domain, slug, first_seen_at, last_seen_at, is_active";

const SNAPSHOT_COLUMNS: &str = "id, company_id, seq, batch, stage, description, location, tags, \
    employee_range, data_hash, captured_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }
}

fn entity_from_row(row: &PgRow) -> Result<Entity, StoreError> {
    Ok(Entity {
        id: row.try_get("id")?,
        upstream_id: row.try_get("upstream_id")?,
        name: row.try_get("name")?,
        domain: row.try_get("domain")?,
        slug: row.try_get("slug")?,
        first_seen: row.try_get("first_seen_at")?,
        last_seen: row.try_get("last_seen_at")?,
        active: row.try_get("is_active")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, StoreError> {
    let tags: Json<Vec<String>> = row.try_get("tags")?;
    let data_hash: String = row.try_get("data_hash")?;
    Ok(Snapshot {
        id: row.try_get("id")?,
        entity_id: row.try_get("company_id")?,
        seq: row.try_get("seq")?,
        attributes: CompanyAttributes {
            batch: row.try_get("batch")?,
            stage: row.try_get("stage")?,
            description: row.try_get("description")?,
            location: row.try_get("location")?,
            tags: tags.0,
            employee_range: row.try_get("employee_range")?,
        },
        fingerprint: Fingerprint::from_hex(data_hash),
        captured_at: row.try_get("captured_at")?,
    })
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn run_from_row(row: &PgRow) -> Result<RunSummary, StoreError> {
    let stop: String = row.try_get("listing_stop")?;
    let listing_stop = ListingStop::parse(&stop).ok_or_else(|| StoreError::Corrupt {
        table: "scrape_runs",
        detail: format!("unknown listing_stop {stop:?}"),
    })?;
    let pages: i32 = row.try_get("pages_fetched")?;
    Ok(RunSummary {
        run_id: row.try_get("run_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("ended_at")?,
        total: count(row.try_get("total_companies")?),
        new: count(row.try_get("new_companies")?),
        updated: count(row.try_get("updated_companies")?),
        unchanged: count(row.try_get("unchanged_companies")?),
        failed: count(row.try_get("failed_companies")?),
        avg_ms: row.try_get("avg_time_ms")?,
        min_ms: row.try_get("min_time_ms")?,
        slowest_ms: row.try_get("slowest_time_ms")?,
        slowest_entity: row.try_get("slowest_company")?,
        pages_fetched: u32::try_from(pages).unwrap_or_default(),
        listing_stop,
        deactivated: count(row.try_get("deactivated_companies")?),
        enrichment: EnrichmentStats {
            targets: count(row.try_get("enrich_targets")?),
            enriched: count(row.try_get("enrich_succeeded")?),
            unavailable: count(row.try_get("enrich_unavailable")?),
            write_failures: count(row.try_get("enrich_write_failures")?),
            deadline_elapsed: row.try_get("enrich_deadline_hit")?,
        },
    })
}

#[async_trait]
impl CompanyStore for PgStore {
    async fn upsert_entity(
        &self,
        company: &NormalizedCompany,
        seen_at: DateTime<Utc>,
    ) -> Result<EntityUpsert, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO companies (upstream_id, name, domain, slug, first_seen_at, last_seen_at, is_active)
            VALUES ($1, $2, $3, $4, $5, $5, TRUE)
            ON CONFLICT (upstream_id) DO UPDATE SET
                name = EXCLUDED.name,
                domain = EXCLUDED.domain,
                slug = EXCLUDED.slug,
                last_seen_at = GREATEST(companies.last_seen_at, EXCLUDED.last_seen_at),
                is_active = TRUE
            RETURNING {ENTITY_COLUMNS}, (xmax = 0) AS inserted
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&company.upstream_id)
            .bind(&company.name)
            .bind(&company.domain)
            .bind(&company.slug)
            .bind(seen_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(EntityUpsert {
            entity: entity_from_row(&row)?,
            created: row.try_get("inserted")?,
        })
    }

    async fn append_snapshot_if_changed(
        &self,
        entity_id: EntityId,
        attributes: &CompanyAttributes,
        fingerprint: &Fingerprint,
        captured_at: DateTime<Utc>,
    ) -> Result<SnapshotAppend, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes compare-and-insert per entity.
        let locked = sqlx::query("SELECT id FROM companies WHERE id = $1 FOR UPDATE")
            .bind(entity_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::UnknownEntity(entity_id));
        }

        let latest = sqlx::query(
            r#"
            SELECT seq, data_hash
              FROM company_snapshots
             WHERE company_id = $1
             ORDER BY seq DESC
             LIMIT 1
            "#,
        )
        .bind(entity_id)
        .fetch_optional(&mut *tx)
        .await?;

        let latest = match latest {
            Some(row) => {
                let seq: i64 = row.try_get("seq")?;
                let hash: String = row.try_get("data_hash")?;
                Some((seq, Fingerprint::from_hex(hash)))
            }
            None => None,
        };

        if let Some((latest_seq, latest_print)) = &latest {
            if latest_print == fingerprint {
                tx.commit().await?;
                return Ok(SnapshotAppend::Unchanged {
                    latest_seq: *latest_seq,
                });
            }
        }

        let seq = latest.as_ref().map(|(seq, _)| seq + 1).unwrap_or(1);
        let sql = format!(
            r#"
            INSERT INTO company_snapshots
                (company_id, seq, batch, stage, description, location, tags, employee_range, data_hash, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {SNAPSHOT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(entity_id)
            .bind(seq)
            .bind(&attributes.batch)
            .bind(&attributes.stage)
            .bind(&attributes.description)
            .bind(&attributes.location)
            .bind(Json(&attributes.tags))
            .bind(&attributes.employee_range)
            .bind(fingerprint.as_str())
            .bind(captured_at)
            .fetch_one(&mut *tx)
            .await?;
        let snapshot = snapshot_from_row(&row)?;
        tx.commit().await?;

        Ok(SnapshotAppend::Appended {
            snapshot,
            previous: latest.map(|(_, print)| print),
        })
    }

    async fn upsert_enrichment(&self, record: &EnrichmentRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO company_web_enrichment (company_id, has_careers_page, has_blog, contact_email, probed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (company_id) DO UPDATE SET
                has_careers_page = EXCLUDED.has_careers_page,
                has_blog = EXCLUDED.has_blog,
                contact_email = EXCLUDED.contact_email,
                probed_at = EXCLUDED.probed_at
            "#,
        )
        .bind(record.entity_id)
        .bind(record.has_careers_page)
        .bind(record.has_blog)
        .bind(&record.contact_email)
        .bind(record.probed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_run_summary(&self, summary: &RunSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_runs (
                run_id, started_at, ended_at,
                total_companies, new_companies, updated_companies, unchanged_companies, failed_companies,
                avg_time_ms, min_time_ms, slowest_time_ms, slowest_company,
                pages_fetched, listing_stop, deactivated_companies,
                enrich_targets, enrich_succeeded, enrich_unavailable, enrich_write_failures, enrich_deadline_hit
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.total as i64)
        .bind(summary.new as i64)
        .bind(summary.updated as i64)
        .bind(summary.unchanged as i64)
        .bind(summary.failed as i64)
        .bind(summary.avg_ms)
        .bind(summary.min_ms)
        .bind(summary.slowest_ms)
        .bind(&summary.slowest_entity)
        .bind(summary.pages_fetched as i32)
        .bind(summary.listing_stop.as_str())
        .bind(summary.deactivated as i64)
        .bind(summary.enrichment.targets as i64)
        .bind(summary.enrichment.enriched as i64)
        .bind(summary.enrichment.unavailable as i64)
        .bind(summary.enrichment.write_failures as i64)
        .bind(summary.enrichment.deadline_elapsed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_absent(&self, present: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE companies
               SET is_active = FALSE
             WHERE is_active AND NOT (upstream_id = ANY($1))
            "#,
        )
        .bind(present)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn enrichment_targets(&self) -> Result<Vec<EnrichmentTarget>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, domain
              FROM companies
             WHERE is_active AND domain IS NOT NULL AND domain <> ''
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<EnrichmentTarget, StoreError> {
                Ok(EnrichmentTarget {
                    entity_id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    domain: row.try_get("domain")?,
                })
            })
            .collect()
    }

    async fn entity_by_upstream_id(&self, upstream_id: &str) -> Result<Option<Entity>, StoreError> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM companies WHERE upstream_id = $1");
        let row = sqlx::query(&sql)
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn snapshots_for(&self, entity_id: EntityId) -> Result<Vec<Snapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM company_snapshots WHERE company_id = $1 ORDER BY seq"
        );
        let rows = sqlx::query(&sql)
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn enrichment_for(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EnrichmentRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT company_id, has_careers_page, has_blog, contact_email, probed_at
              FROM company_web_enrichment
             WHERE company_id = $1
            "#,
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(EnrichmentRecord {
            entity_id: row.try_get("company_id")?,
            has_careers_page: row.try_get("has_careers_page")?,
            has_blog: row.try_get("has_blog")?,
            contact_email: row.try_get("contact_email")?,
            probed_at: row.try_get("probed_at")?,
        }))
    }

    async fn run_summaries(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query("SELECT * FROM scrape_runs ORDER BY started_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }
}
