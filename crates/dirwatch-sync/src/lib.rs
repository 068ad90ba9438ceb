//! Sync pipeline orchestration: listing, change detection, enrichment and
//! run summaries.

pub mod config;
pub mod detect;
pub mod enrich;
pub mod pipeline;
pub mod recorder;

pub use config::{load_probe_rules, SyncConfig};
pub use detect::{ChangeDetector, Detection};
pub use enrich::{run_enrichment, EnrichmentConfig};
pub use pipeline::{
    algolia_source, build_scheduler, connect_store, http_prober, pipeline_from_env,
    run_enrichment_from_env, run_scheduler_from_env, run_sync_once_from_env, SyncPipeline,
};
pub use recorder::RunRecorder;

pub const CRATE_NAME: &str = "dirwatch-sync";
