use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{SubsecRound, Utc};
use dirwatch_adapters::{fetch_listing, AlgoliaSource, HttpProber, ListSource, SiteProber};
use dirwatch_core::{upstream_identity, EnrichmentStats, RunSummary};
use dirwatch_storage::{CompanyStore, HttpClientConfig, HttpFetcher, PgStore};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{load_probe_rules, SyncConfig};
use crate::detect::ChangeDetector;
use crate::enrich::run_enrichment;
use crate::recorder::RunRecorder;

const PROGRESS_EVERY: usize = 100;

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn CompanyStore>,
    source: Box<dyn ListSource>,
    prober: Option<Arc<dyn SiteProber>>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn CompanyStore>,
        source: Box<dyn ListSource>,
    ) -> Self {
        Self {
            config,
            store,
            source,
            prober: None,
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn SiteProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// List, detect changes, deactivate, enrich, then persist one summary.
    /// Only a failure to persist the summary is returned as an error.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        // Stored timestamps keep microseconds; the run start doubles as the
        // sighting time, so it must compare equal after a round trip.
        let started_at = Utc::now().trunc_subsecs(6);
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        self.run(run_id, started_at).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, started_at: chrono::DateTime<Utc>) -> Result<RunSummary> {
        info!("sync run started");
        let mut recorder = RunRecorder::start(run_id, started_at);

        let listing = fetch_listing(self.source.as_ref(), &self.config.listing()).await;
        recorder.set_listing(listing.pages_fetched, listing.stop);
        info!(
            records = listing.records.len(),
            pages = listing.pages_fetched,
            stop = listing.stop.as_str(),
            "listing fetched"
        );

        let detector = ChangeDetector::new(self.store.clone());
        let pause = self.config.entity_pause();
        let total = listing.records.len();
        for (idx, raw) in listing.records.iter().enumerate() {
            if idx > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let began = Instant::now();
            let detection = detector.process(raw, started_at).await;
            recorder.record(detection.outcome, began.elapsed(), &detection.name);

            let processed = idx + 1;
            if processed % PROGRESS_EVERY == 0 {
                info!(processed, total, "sync progress");
            }
        }

        if listing.is_complete() {
            // Listed entities whose write failed this run are still present.
            let present: Vec<String> = listing
                .records
                .iter()
                .filter_map(upstream_identity)
                .collect();
            match self.store.deactivate_absent(&present).await {
                Ok(count) => {
                    if count > 0 {
                        info!(count, "deactivated companies missing from listing");
                    }
                    recorder.set_deactivated(count);
                }
                Err(err) => warn!(error = %err, "deactivation failed"),
            }
        } else {
            warn!(stop = listing.stop.as_str(), "listing incomplete; skipping deactivation");
        }

        if self.config.enrich_enabled {
            recorder.set_enrichment(self.enrich().await);
        }

        let summary = recorder.finish(Utc::now());
        self.store
            .insert_run_summary(&summary)
            .await
            .context("persisting run summary")?;

        info!(
            total = summary.total,
            new = summary.new,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            avg_ms = summary.avg_ms,
            slowest_ms = summary.slowest_ms,
            slowest = summary.slowest_entity.as_deref().unwrap_or("-"),
            deactivated = summary.deactivated,
            enriched = summary.enrichment.enriched,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn enrich(&self) -> EnrichmentStats {
        let Some(prober) = &self.prober else {
            warn!("enrichment enabled but no prober configured");
            return EnrichmentStats::default();
        };
        match run_enrichment(self.store.clone(), prober.clone(), &self.config.enrichment()).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "enrichment sweep skipped");
                EnrichmentStats::default()
            }
        }
    }

    /// Enrichment sweep on its own, outside a sync run.
    pub async fn enrich_only(&self) -> Result<EnrichmentStats> {
        let prober = self.prober.clone().context("no prober configured")?;
        run_enrichment(self.store.clone(), prober, &self.config.enrichment()).await
    }
}

/// Connects to Postgres and applies bundled migrations.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

pub fn algolia_source(config: &SyncConfig) -> Result<Box<dyn ListSource>> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        token_bucket: config.list_rate_limit(),
        ..Default::default()
    })?;
    Ok(Box::new(AlgoliaSource::new(Arc::new(http), config.algolia()?)))
}

pub fn http_prober(config: &SyncConfig) -> Result<Arc<dyn SiteProber>> {
    let rules = load_probe_rules(&config.workspace_root)?;
    let timeout = Duration::from_secs(config.probe_timeout_secs);
    let http = HttpFetcher::new(HttpClientConfig {
        timeout,
        user_agent: Some(config.user_agent.clone()),
        global_concurrency: config.probe_concurrency.max(1),
        ..Default::default()
    })?;
    Ok(Arc::new(HttpProber::new(Arc::new(http), Arc::new(rules), timeout)))
}

/// Postgres-backed pipeline reading the public search index.
pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let store = connect_store(&config).await?;
    let source = algolia_source(&config)?;
    let prober = http_prober(&config)?;
    Ok(SyncPipeline::new(config, store, source).with_prober(prober))
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    pipeline_from_env().await?.run_once().await
}

pub async fn run_enrichment_from_env() -> Result<EnrichmentStats> {
    let config = SyncConfig::from_env();
    let store = connect_store(&config).await?;
    let prober = http_prober(&config)?;
    run_enrichment(store, prober, &config.enrichment()).await
}

/// Runs the pipeline unless another run holds `running`. `None` means the
/// run was skipped.
async fn run_exclusive(
    pipeline: &SyncPipeline,
    running: &Mutex<()>,
) -> Option<Result<RunSummary>> {
    let Ok(_guard) = running.try_lock() else {
        warn!("previous sync still running; skipping scheduled run");
        return None;
    };
    Some(pipeline.run_once().await)
}

/// One cron job running the pipeline. A tick that fires while the previous
/// run is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            match run_exclusive(&pipeline, &running).await {
                Some(Ok(summary)) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                Some(Err(err)) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                None => {}
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs scheduled syncs until ctrl-c.
pub async fn run_scheduler_from_env() -> Result<()> {
    if !SyncConfig::from_env().scheduler_enabled {
        anyhow::bail!("scheduler disabled; set DIRWATCH_SCHEDULER_ENABLED=true");
    }
    let pipeline = Arc::new(pipeline_from_env().await?);
    let cron = pipeline.config().sync_cron.clone();
    let mut sched = build_scheduler(pipeline, &cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %cron, "scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
