use std::time::Duration;

use chrono::{DateTime, Utc};
use dirwatch_core::{EnrichmentStats, EntityOutcome, ListingStop, RunSummary};
use uuid::Uuid;

/// Accumulates per-entity outcomes and timings for one run. Owned by the
/// sweep loop and consumed by `finish`.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    new: u64,
    updated: u64,
    unchanged: u64,
    failed: u64,
    total_ms: f64,
    min_ms: Option<f64>,
    slowest: Option<(f64, String)>,
    pages_fetched: u32,
    listing_stop: ListingStop,
    deactivated: u64,
    enrichment: EnrichmentStats,
}

impl RunRecorder {
    pub fn start(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            new: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            total_ms: 0.0,
            min_ms: None,
            slowest: None,
            pages_fetched: 0,
            listing_stop: ListingStop::EmptyPage,
            deactivated: 0,
            enrichment: EnrichmentStats::default(),
        }
    }

    pub fn total(&self) -> u64 {
        self.new + self.updated + self.unchanged + self.failed
    }

    pub fn record(&mut self, outcome: EntityOutcome, elapsed: Duration, name: &str) {
        match outcome {
            EntityOutcome::New => self.new += 1,
            EntityOutcome::Updated => self.updated += 1,
            EntityOutcome::Unchanged => self.unchanged += 1,
            EntityOutcome::Failed => self.failed += 1,
        }

        let ms = elapsed.as_secs_f64() * 1000.0;
        self.total_ms += ms;
        self.min_ms = Some(self.min_ms.map_or(ms, |min| min.min(ms)));
        if self.slowest.as_ref().map_or(true, |(slowest, _)| ms > *slowest) {
            self.slowest = Some((ms, name.to_string()));
        }
    }

    pub fn set_listing(&mut self, pages_fetched: u32, stop: ListingStop) {
        self.pages_fetched = pages_fetched;
        self.listing_stop = stop;
    }

    pub fn set_deactivated(&mut self, deactivated: u64) {
        self.deactivated = deactivated;
    }

    pub fn set_enrichment(&mut self, stats: EnrichmentStats) {
        self.enrichment = stats;
    }

    /// Timing aggregates are zero for a run that processed nothing.
    pub fn finish(self, finished_at: DateTime<Utc>) -> RunSummary {
        let total = self.total();
        let avg_ms = if total == 0 { 0.0 } else { self.total_ms / total as f64 };
        let (slowest_ms, slowest_entity) = match self.slowest {
            Some((ms, name)) => (ms, Some(name)),
            None => (0.0, None),
        };
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            total,
            new: self.new,
            updated: self.updated,
            unchanged: self.unchanged,
            failed: self.failed,
            avg_ms,
            min_ms: self.min_ms.unwrap_or(0.0),
            slowest_ms,
            slowest_entity,
            pages_fetched: self.pages_fetched,
            listing_stop: self.listing_stop,
            deactivated: self.deactivated,
            enrichment: self.enrichment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_run_has_zero_timings() {
        let summary = RunRecorder::start(Uuid::new_v4(), Utc::now()).finish(Utc::now());
        assert_eq!(summary.total, 0);
        assert_eq!(summary.avg_ms, 0.0);
        assert_eq!(summary.min_ms, 0.0);
        assert_eq!(summary.slowest_ms, 0.0);
        assert_eq!(summary.slowest_entity, None);
    }

    #[test]
    fn counts_and_timings_aggregate() {
        let mut recorder = RunRecorder::start(Uuid::new_v4(), Utc::now());
        recorder.record(EntityOutcome::New, Duration::from_millis(10), "Acme");
        recorder.record(EntityOutcome::Unchanged, Duration::from_millis(30), "Bolt");
        recorder.record(EntityOutcome::Failed, Duration::from_millis(20), "Crux");
        recorder.record(EntityOutcome::Unchanged, Duration::from_millis(30), "Dune");
        recorder.set_listing(2, ListingStop::ShortPage);
        recorder.set_deactivated(3);

        let summary = recorder.finish(Utc::now());
        assert_eq!(summary.total, 4);
        assert_eq!(
            (summary.new, summary.updated, summary.unchanged, summary.failed),
            (1, 0, 2, 1)
        );
        assert!((summary.avg_ms - 22.5).abs() < 1e-9);
        assert!((summary.min_ms - 10.0).abs() < 1e-9);
        assert!((summary.slowest_ms - 30.0).abs() < 1e-9);
        // Ties keep the first entity that hit the maximum.
        assert_eq!(summary.slowest_entity.as_deref(), Some("Bolt"));
        assert_eq!(summary.pages_fetched, 2);
        assert!(summary.listing_complete());
        assert_eq!(summary.deactivated, 3);
    }
}
