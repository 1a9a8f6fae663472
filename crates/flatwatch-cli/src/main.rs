use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flatwatch_adapters::{Extraction, Extractor};
use flatwatch_core::{AccessMode, SearchTarget, Source, SUBSCRIPTION_DAYS};
use flatwatch_storage::{FileStore, HttpFetcher, PgStore, Store};
use flatwatch_sync::registry::{self, load_recipient_file};
use flatwatch_sync::{
    build_scheduler, AccessCommand, ConsoleChannel, CycleEngine, CycleOutcome, MessagingChannel, SyncConfig,
    TelegramChannel,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for a running cycle at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(90);

#[derive(Debug, Parser)]
#[command(name = "flatwatch")]
#[command(about = "Watch rental marketplaces and notify recipients about new listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one cycle now, then one on every grid tick until interrupted
    Run,
    /// Run a single cycle
    Once {
        #[arg(long)]
        ignore_window: bool,
    },
    /// Process one recipient immediately, ignoring its cadence
    Recipient {
        id: String,
        #[arg(long)]
        respect_window: bool,
    },
    /// Extract listings from a saved page
    Extract {
        file: PathBuf,
        /// Address the page was fetched from
        #[arg(long)]
        url: String,
        /// Treat the file as a single listing page
        #[arg(long)]
        detail: bool,
    },
    /// Create or update recipients from a YAML file
    Import { file: PathBuf },
    /// Grant a subscription
    Grant {
        id: String,
        #[arg(long, default_value_t = SUBSCRIPTION_DAYS)]
        days: i64,
    },
    /// Replace a recipient's search targets
    Assign {
        id: String,
        #[arg(long = "url", required = true)]
        urls: Vec<String>,
        #[arg(long = "location")]
        locations: Vec<String>,
        #[arg(long, conflicts_with = "subscription")]
        trial: bool,
        #[arg(long)]
        subscription: bool,
    },
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let engine = Arc::new(build_engine(config).await?);
            run_daemon(engine).await?;
        }
        Commands::Once { ignore_window } => {
            let engine = build_engine(config).await?;
            print_outcome(engine.run_cycle(Utc::now(), ignore_window).await?);
        }
        Commands::Recipient { id, respect_window } => {
            let engine = build_engine(config).await?;
            print_outcome(engine.run_for_recipient(&id, Utc::now(), !respect_window).await?);
        }
        Commands::Extract { file, url, detail } => extract_file(&config, &file, &url, detail)?,
        Commands::Import { file } => {
            let recipients = load_recipient_file(&file)?;
            let store = open_store(&config).await?;
            let count = registry::import_recipients(store.as_ref(), &recipients, Utc::now()).await?;
            println!("imported {count} recipients from {}", file.display());
        }
        Commands::Grant { id, days } => {
            let store = open_store(&config).await?;
            let recipient = registry::apply_access(
                store.as_ref(),
                &id,
                AccessCommand::GrantSubscription { days: Some(days) },
                Utc::now(),
            )
            .await?;
            if let Some(expires_at) = recipient.access.subscription_expires_at {
                println!("{} subscribed until {}", recipient.label(), expires_at.to_rfc3339());
            }
        }
        Commands::Assign {
            id,
            urls,
            locations,
            trial,
            subscription,
        } => {
            for url in &urls {
                if Source::from_url(url).is_none() {
                    bail!("no supported marketplace matches {url}");
                }
            }
            let mode = match (trial, subscription) {
                (true, _) => Some(AccessMode::Trial),
                (_, true) => Some(AccessMode::Subscription),
                _ => None,
            };
            let targets = urls
                .into_iter()
                .map(|url| SearchTarget::new(url).with_location_filters(locations.clone()))
                .collect();
            let store = open_store(&config).await?;
            let recipient = registry::apply_access(
                store.as_ref(),
                &id,
                AccessCommand::AssignTargets { targets, mode },
                Utc::now(),
            )
            .await?;
            println!("{} now watches {} targets", recipient.label(), recipient.targets.len());
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set; the file store needs no migrations");
            };
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = matches!(
        std::env::var("FLATWATCH_LOG_JSON").as_deref(),
        Ok("1" | "true" | "TRUE")
    );
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn Store>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            let store = FileStore::open(&config.state_path)
                .await
                .with_context(|| format!("opening {}", config.state_path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

async fn build_engine(config: SyncConfig) -> Result<CycleEngine> {
    let store = open_store(&config).await?;
    let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let channel: Arc<dyn MessagingChannel> = match config.telegram_bot_token.as_deref() {
        Some(token) => Arc::new(TelegramChannel::new(
            token,
            Duration::from_secs(config.http_timeout_secs),
        )?),
        None => {
            warn!("TELEGRAM_BOT_TOKEN not set; messages go to the log");
            Arc::new(ConsoleChannel)
        }
    };
    Ok(CycleEngine::new(config, store, fetcher, channel)?)
}

async fn run_daemon(engine: Arc<CycleEngine>) -> Result<()> {
    let interval = engine.config().notify_interval_minutes;

    tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            match engine.run_cycle(Utc::now(), false).await {
                Ok(outcome) => log_outcome(&outcome),
                Err(err) => error!(error = %err, "initial cycle failed"),
            }
        }
    });

    let mut sched = build_scheduler(Arc::clone(&engine), interval).await?;
    sched.start().await.context("starting scheduler")?;
    info!(interval_minutes = interval, "scheduler started");

    shutdown_signal().await?;

    sched.shutdown().await.context("stopping scheduler")?;
    if tokio::time::timeout(SHUTDOWN_GRACE, engine.wait_idle()).await.is_err() {
        warn!("running cycle did not finish before the shutdown deadline");
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("listening for Ctrl-C")?;
                info!("received Ctrl-C, shutting down");
            }
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("listening for Ctrl-C")?;
        info!("received Ctrl-C, shutting down");
    }
    Ok(())
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Completed(report) => info!(
            run_id = %report.run_id,
            sent = report.totals.sent,
            found = report.totals.found,
            "cycle finished"
        ),
        CycleOutcome::SkippedBusy => warn!("cycle skipped: another cycle is running"),
        CycleOutcome::OutsideWindow => info!("cycle skipped: outside the active window"),
    }
}

fn print_outcome(outcome: CycleOutcome) {
    match outcome {
        CycleOutcome::Completed(report) => println!("{}", report.summary()),
        CycleOutcome::SkippedBusy => println!("skipped: another cycle is running"),
        CycleOutcome::OutsideWindow => println!("skipped: outside the active window (use --ignore-window)"),
    }
}

fn extract_file(config: &SyncConfig, file: &Path, url: &str, detail: bool) -> Result<()> {
    let Some(source) = Source::from_url(url) else {
        bail!("no supported marketplace matches {url}");
    };
    let html = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let extractor = Extractor::new(config.extractor_config())?;
    let now = Utc::now();
    let outcomes = if detail {
        vec![extractor.extract_document(source, &html, url, now)]
    } else {
        extractor.extract_result_set(source, &html, url, now)
    };

    let mut listings = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(Extraction::Listing(listing)) => listings.push(*listing),
            Ok(Extraction::TooOld { title, date_posted }) => {
                eprintln!("too old: {title} ({})", date_posted.map(|d| d.to_rfc3339()).unwrap_or_default())
            }
            Err(err) => eprintln!("skipped: {err}"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&listings)?);
    Ok(())
}
