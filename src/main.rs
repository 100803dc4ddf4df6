mod automation;
mod catalog;
mod checkpoint;
mod config;
mod http;
mod input;
mod metrics;
mod models;
mod planner;
mod portal;
mod report;
mod resolver;
mod sequencer;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod variant;

use automation::{Automation, WebDriverSession};
use catalog::{
    CachedSource, CandidateSource, LookupCache, PokemonTcgSource, PortalSearchSource,
    ScryfallSource,
};
use checkpoint::{Checkpoint, FileCheckpoint};
use clap::Parser;
use config::{SourceName, SyncConfig};
use eyre::{WrapErr, bail};
use models::{CatalogId, Mode};
use planner::PlanOptions;
use portal::Portal;
use report::ReportPaths;
use resolver::Resolver;
use sequencer::HaltReason;
use std::{path::PathBuf, sync::Arc};
use store::PortalStore;
use sync::{RunOptions, SyncRun};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

/// Reconcile a seller portal's inventory against a desired-state CSV.
#[derive(Debug, Parser)]
#[command(name = "tcg-sync", version)]
struct Cli {
    /// Desired inventory (Product ID, Name, Variant, Qty, Price).
    csv: PathBuf,
    /// Apply changes. Without this flag the run only reports its plan.
    #[arg(long)]
    live: bool,
    /// Resume after the last checkpointed product.
    #[arg(long, conflicts_with = "resume_from")]
    resume: bool,
    /// Resume from an explicit product id.
    #[arg(long, value_name = "PRODUCT_ID")]
    resume_from: Option<String>,
    #[arg(long, env = "SYNC_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Price rows without an explicit price at the current market price.
    #[arg(long)]
    match_market: bool,
    /// Candidate sources in priority order.
    #[arg(long, value_delimiter = ',')]
    sources: Option<Vec<SourceName>>,
    /// Ignore and do not update the saved catalog lookups.
    #[arg(long)]
    no_cache: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::load(cli.config.as_deref()).wrap_err("loading configuration")?;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(sources) = cli.sources {
        config.sources = sources;
    }
    config.match_market |= cli.match_market;
    config.lookup_cache &= !cli.no_cache;

    let run_id = Uuid::new_v4();
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let paths = ReportPaths::new(&config.output_dir, &stamp);
    let report_file = paths
        .inventory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let checkpoint = Arc::new(FileCheckpoint::in_dir(
        &config.output_dir,
        run_id,
        report_file,
    ));

    let resume_from = match (cli.resume_from.as_deref(), cli.resume) {
        (Some(raw), _) => Some(
            CatalogId::parse(raw).ok_or_else(|| eyre::eyre!("--resume-from needs a product id"))?,
        ),
        (None, true) => {
            let last = checkpoint
                .last()
                .await
                .wrap_err("reading the progress file")?;
            if last.is_none() {
                warn!(target = "tcgsync.cli", path = %checkpoint.path().display(), "no checkpoint found; starting from the beginning");
            }
            last
        }
        (None, false) => None,
    };

    let session = WebDriverSession::attach(&config.webdriver_url, &config.debugger_address)
        .await
        .wrap_err("attaching to the logged-in browser")?;
    let automation: Arc<dyn Automation> = Arc::new(session);
    let portal = Portal::new(
        automation,
        &config.portal_base_url,
        config.selectors.clone(),
    );

    let cache = if config.lookup_cache {
        Some(Arc::new(
            LookupCache::load(LookupCache::in_dir(&config.output_dir)).await,
        ))
    } else {
        None
    };
    let sources: Vec<Box<dyn CandidateSource>> = config
        .sources
        .iter()
        .map(|name| -> Box<dyn CandidateSource> {
            let source: Box<dyn CandidateSource> = match name {
                SourceName::Scryfall => Box::new(ScryfallSource::from_env()),
                SourceName::Pokemon => Box::new(PokemonTcgSource::from_env()),
                SourceName::Portal => Box::new(PortalSearchSource::new(portal.clone())),
            };
            match &cache {
                Some(cache) => Box::new(CachedSource::new(source, cache.clone())),
                None => source,
            }
        })
        .collect();

    let mode = if cli.live { Mode::Live } else { Mode::DryRun };
    let run = SyncRun::new(
        Resolver::new(sources, config.match_threshold),
        Arc::new(PortalStore::new(portal)),
        checkpoint,
        RunOptions {
            run_id,
            mode,
            resume_from,
            retry: config.retry,
            plan: PlanOptions {
                match_market: config.match_market,
            },
        },
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target = "tcgsync.cli", "interrupt received; stopping after the current operation");
            let _ = stop_tx.send(true);
        }
    });

    let outcome = run.run(&cli.csv, &stop_rx).await;
    if let Some(cache) = &cache
        && let Err(err) = cache.save().await
    {
        warn!(target = "tcgsync.cli", path = %cache.path().display(), error = %err, "could not save the lookup cache");
    }
    let report = outcome?;
    report::write_reports(&report, &paths)
        .await
        .wrap_err("writing reports")?;
    report::log_summary(&report);

    match &report.halted {
        Some(HaltReason::SessionLost {
            identifier,
            message,
        }) => bail!("portal session lost at product {identifier}: {message}; log in again and rerun with --resume"),
        Some(HaltReason::CheckpointFailed {
            identifier,
            message,
        }) => bail!("could not record progress after product {identifier}: {message}"),
        Some(HaltReason::Cancelled { before }) => {
            info!(target = "tcgsync.cli", next = %before, "run interrupted; rerun with --resume to continue");
            Ok(())
        }
        None => Ok(()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
