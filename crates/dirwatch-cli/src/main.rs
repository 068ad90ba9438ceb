use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dirwatch_adapters::{FixtureSource, ListSource};
use dirwatch_storage::{CompanyStore, MemoryStore};
use dirwatch_sync::{
    algolia_source, connect_store, http_prober, run_enrichment_from_env, run_scheduler_from_env,
    SyncConfig, SyncPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "dirwatch")]
#[command(about = "Company directory ingestion and change tracking")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync: list, detect changes, deactivate, enrich, record.
    Sync(SyncArgs),
    /// Probe the websites of active companies.
    Enrich,
    /// Apply database migrations.
    Migrate,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Keep all state in memory instead of postgres.
    #[arg(long)]
    dry_run: bool,
    /// Read the listing from a JSON fixture instead of the search index.
    #[arg(long)]
    fixture: Option<PathBuf>,
    /// Skip the enrichment sweep.
    #[arg(long)]
    no_enrich: bool,
}

async fn sync(args: SyncArgs) -> Result<()> {
    let mut config = SyncConfig::from_env();
    if args.no_enrich {
        config.enrich_enabled = false;
    }

    let store: Arc<dyn CompanyStore> = if args.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        connect_store(&config).await?
    };
    let source: Box<dyn ListSource> = match &args.fixture {
        Some(path) => Box::new(FixtureSource::load(path)?),
        None => algolia_source(&config)?,
    };
    let prober = http_prober(&config)?;

    let summary = SyncPipeline::new(config, store, source)
        .with_prober(prober)
        .run_once()
        .await?;
    println!(
        "sync complete: run_id={} total={} new={} updated={} unchanged={} failed={} deactivated={} enriched={}",
        summary.run_id,
        summary.total,
        summary.new,
        summary.updated,
        summary.unchanged,
        summary.failed,
        summary.deactivated,
        summary.enrichment.enriched
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await?,
        Commands::Enrich => {
            let stats = run_enrichment_from_env().await?;
            println!(
                "enrichment complete: targets={} enriched={} unavailable={} write_failures={} deadline_elapsed={}",
                stats.targets,
                stats.enriched,
                stats.unavailable,
                stats.write_failures,
                stats.deadline_elapsed
            );
        }
        Commands::Migrate => {
            connect_store(&SyncConfig::from_env()).await?;
            println!("migrations applied");
        }
        Commands::Schedule => run_scheduler_from_env().await?,
    }

    Ok(())
}
