use anyhow::Context;
use clap::Parser;
use fujical::config::Config;
use fujical::ops::AdminOps;
use fujical::queue::JobQueue;
use fujical::scheduler::Scheduler;
use fujical::settings::RuntimeSettings;
use fujical::store::admins::AdminRepo;
use fujical::store::events::EventRepo;
use fujical::store::locations::LocationRepo;
use fujical::store::Database;
use fujical::worker::{WorkerEnv, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Fujical worker — Diamond & Pearl Fuji event pipeline.
///
/// Drains the calculation queue, runs the alignment finder for every
/// (location, day), and keeps the event calendar populated. Flags
/// override the FUJICAL_* environment variables.
///
/// Examples:
///   fujical
///   fujical --db-path /var/lib/fujical/events.db --concurrency 4
///   fujical --scheduler-only
#[derive(Parser)]
#[command(name = "fujical", version, about, long_about = None)]
struct Cli {
    /// SQLite file holding the relational store and the job queue.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log filter (tracing env-filter syntax, e.g. "fujical=debug").
    #[arg(long)]
    log: Option<String>,

    /// Initial worker concurrency (1-10); persisted into settings.
    #[arg(long)]
    concurrency: Option<u32>,

    /// Run the nightly scheduler without the worker role.
    #[arg(long)]
    scheduler_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(path) = cli.db_path {
        config.db_path = path;
    }
    if let Some(filter) = cli.log {
        config.log_filter = filter;
    }
    if cli.concurrency.is_some() {
        config.initial_concurrency = cli.concurrency;
    }
    config.scheduler_only |= cli.scheduler_only;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).context("invalid log filter")?,
        )
        .init();

    // Explicit construction, leaves first: store, settings, repos,
    // queue, then the moving parts. No cycles, no registry.
    let db = Database::open(&config.db_path)
        .with_context(|| format!("cannot open database at {}", config.db_path.display()))?;
    let settings = Arc::new(RuntimeSettings::new(db.clone()));

    if let Some(workers) = config.initial_concurrency {
        settings
            .set("worker_concurrency", &workers.to_string())
            .context("invalid initial concurrency")?;
    }

    let queue = JobQueue::new(db.clone());
    let locations = LocationRepo::new(db.clone());
    let events = EventRepo::new(db.clone());
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        locations.clone(),
        events.clone(),
        settings.clone(),
    ));
    // Handed to the external HTTP layer in deployment; constructed here
    // so a fatal wiring error fails startup, not the first request.
    let _ops = AdminOps::new(
        queue.clone(),
        settings.clone(),
        scheduler.clone(),
        AdminRepo::new(db.clone()),
    );

    eprintln!("--------------------------------------------------");
    eprintln!("  Fujical worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("  Store:       {}", config.db_path.display());
    eprintln!("  Concurrency: {}", settings.worker_concurrency());
    eprintln!(
        "  Role:        {}",
        if config.scheduler_only { "scheduler only" } else { "scheduler + workers" }
    );
    eprintln!("  Press Ctrl+C to drain and stop.");
    eprintln!("--------------------------------------------------");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let nightly = tokio::spawn(scheduler.clone().run_nightly(shutdown_rx));

    let pool = if config.scheduler_only {
        None
    } else {
        Some(
            WorkerPool::start(WorkerEnv::new(db.clone(), settings.clone()))
                .context("worker pool failed to start")?,
        )
    };

    tokio::signal::ctrl_c().await.context("signal handler")?;
    tracing::info!("termination signal received; draining");

    let _ = shutdown_tx.send(true);
    if let Some(pool) = pool {
        pool.shutdown(SHUTDOWN_GRACE).await;
    }
    nightly.abort();

    tracing::info!("drained; goodbye");
    Ok(())
}
