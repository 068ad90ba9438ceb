//! Bounded fan-out over active entities with a domain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dirwatch_adapters::SiteProber;
use dirwatch_core::{EnrichmentRecord, EnrichmentStats, ProbeOutcome, UnavailableReason};
use dirwatch_storage::{CompanyStore, EnrichmentTarget};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};

/// Headroom over the prober's own timeout before the sweep gives up on a probe.
const PROBE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentConfig {
    pub concurrency: usize,
    pub probe_timeout: Duration,
    pub deadline: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            probe_timeout: Duration::from_secs(3),
            deadline: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct Counters {
    enriched: AtomicU64,
    unavailable: AtomicU64,
    write_failures: AtomicU64,
}

async fn enrich_one(
    store: &dyn CompanyStore,
    prober: &dyn SiteProber,
    target: EnrichmentTarget,
    probe_timeout: Duration,
    counters: &Counters,
) {
    let outcome = tokio::time::timeout(probe_timeout + PROBE_GRACE, prober.probe(&target.domain))
        .await
        .unwrap_or(ProbeOutcome::Unavailable(UnavailableReason::Timeout));

    match outcome {
        ProbeOutcome::Signals(signals) => {
            let record = EnrichmentRecord::from_signals(target.entity_id, signals, Utc::now());
            match store.upsert_enrichment(&record).await {
                Ok(()) => {
                    counters.enriched.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(domain = %target.domain, error = %err, "enrichment write failed");
                }
            }
        }
        ProbeOutcome::Unavailable(reason) => {
            counters.unavailable.fetch_add(1, Ordering::Relaxed);
            debug!(domain = %target.domain, %reason, "site unavailable");
        }
    }
}

/// Probe every enrichment target and upsert what was found. Only listing the
/// targets can fail; individual probes and writes are counted instead.
pub async fn run_enrichment(
    store: Arc<dyn CompanyStore>,
    prober: Arc<dyn SiteProber>,
    config: &EnrichmentConfig,
) -> Result<EnrichmentStats> {
    let targets = store
        .enrichment_targets()
        .await
        .context("loading enrichment targets")?;
    let target_count = targets.len() as u64;
    let counters = Counters::default();

    let sweep = {
        let store = store.as_ref();
        let prober = prober.as_ref();
        let counters = &counters;
        let probe_timeout = config.probe_timeout;
        stream::iter(targets).for_each_concurrent(config.concurrency.max(1), move |target| {
            enrich_one(store, prober, target, probe_timeout, counters)
        })
    };

    let span = info_span!("enrichment", targets = target_count);
    let deadline_elapsed = tokio::time::timeout(config.deadline, sweep.instrument(span))
        .await
        .is_err();
    if deadline_elapsed {
        warn!(
            deadline_secs = config.deadline.as_secs(),
            "enrichment deadline elapsed; outstanding probes dropped"
        );
    }

    let stats = EnrichmentStats {
        targets: target_count,
        enriched: counters.enriched.load(Ordering::Relaxed),
        unavailable: counters.unavailable.load(Ordering::Relaxed),
        write_failures: counters.write_failures.load(Ordering::Relaxed),
        deadline_elapsed,
    };
    info!(
        targets = stats.targets,
        enriched = stats.enriched,
        unavailable = stats.unavailable,
        write_failures = stats.write_failures,
        deadline_elapsed,
        "enrichment sweep finished"
    );
    Ok(stats)
}
