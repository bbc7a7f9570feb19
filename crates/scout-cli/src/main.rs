use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use scout_core::JobTrigger;
use scout_storage::PgStore;
use scout_sync::{
    build_scheduler, load_market_seeds, run_until_idle, seed_markets, BufferedQueue, ChannelQueue, Engine,
    StoreKind, SyncConfig, WorkerPool,
};
use scout_web::AppState;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "scout")]
#[command(about = "Market scrape scheduler and listing freshness engine")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one dispatch tick and the scrapes it enqueues.
    Dispatch {
        /// Start every dispatched scrape immediately instead of staggering.
        #[arg(long)]
        no_stagger: bool,
    },
    /// Run one decay tick and the verifications it enqueues.
    Decay,
    /// Run the daily maintenance sweep.
    Maintenance,
    /// Scrape one market now, regardless of cadence or circuit state.
    Scrape { market_id: String },
    /// Verify one pending listing now.
    Verify { listing_id: Uuid },
    /// Scheduler, worker pool and admin server in one process.
    Run,
    /// Admin server with a worker pool for manual scrapes.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Register markets from the seed file; existing ids are skipped.
    SeedMarkets {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing report")?
    );
    Ok(())
}

/// Engine fed by an in-process buffer, drained before the command exits.
async fn one_shot(config: &SyncConfig) -> Result<(Arc<Engine>, Arc<BufferedQueue>)> {
    let queue = Arc::new(BufferedQueue::new());
    let engine = Engine::from_config(config, queue.clone()).await?;
    Ok((Arc::new(engine), queue))
}

/// Engine fed by a channel into a long-running worker pool.
async fn pooled(config: &SyncConfig) -> Result<(Arc<Engine>, WorkerPool)> {
    let (queue, rx) = ChannelQueue::new();
    let engine = Arc::new(Engine::from_config(config, Arc::new(queue)).await?);
    let pool = WorkerPool::start(engine.clone(), rx, config.workers);
    Ok((engine, pool))
}

#[derive(Debug, Serialize)]
struct TickOutput<T> {
    report: T,
    executed: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Dispatch { no_stagger: false }) {
        Commands::Dispatch { no_stagger } => {
            let (engine, queue) = one_shot(&config).await?;
            let report = engine.dispatch_tick().await?;
            let executed = run_until_idle(engine, &queue, config.workers, !no_stagger).await;
            print_json(&TickOutput { report, executed })?;
        }
        Commands::Decay => {
            let (engine, queue) = one_shot(&config).await?;
            let report = engine.decay_tick().await?;
            let executed = run_until_idle(engine, &queue, config.workers, false).await;
            print_json(&TickOutput { report, executed })?;
        }
        Commands::Maintenance => {
            let (engine, _queue) = one_shot(&config).await?;
            print_json(&engine.maintenance_sweep().await?)?;
        }
        Commands::Scrape { market_id } => {
            let (engine, _queue) = one_shot(&config).await?;
            print_json(&engine.scrape(&market_id, JobTrigger::Manual).await?)?;
        }
        Commands::Verify { listing_id } => {
            let (engine, _queue) = one_shot(&config).await?;
            print_json(&engine.verify(listing_id).await?)?;
        }
        Commands::Run => {
            let (engine, pool) = pooled(&config).await?;
            let mut sched = build_scheduler(engine.clone(), &config).await?;
            sched.start().await.context("starting scheduler")?;
            info!(port = config.web_port, workers = config.workers, "scout running");

            tokio::select! {
                served = scout_web::serve(AppState::new(engine), config.web_port) => served?,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listening for ctrl-c")?;
                    info!("shutdown requested");
                }
            }
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "scheduler shutdown failed");
            }
            pool.abort();
            pool.join().await;
        }
        Commands::Serve => {
            let (engine, pool) = pooled(&config).await?;
            scout_web::serve(AppState::new(engine), config.web_port).await?;
            pool.abort();
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::SeedMarkets { file } => {
            let path = file.unwrap_or_else(|| config.markets_file.clone());
            let seeds = load_market_seeds(&path).await?;
            let report = match config.store {
                StoreKind::Postgres => {
                    let store = PgStore::connect(&config.database_url)
                        .await
                        .context("connecting to postgres")?;
                    seed_markets(&store, seeds, Utc::now()).await?
                }
                StoreKind::Memory => {
                    warn!("SCOUT_STORE=memory; seeded markets are not persisted");
                    let (engine, _queue) = one_shot(&config).await?;
                    seed_markets(engine.stores().markets.as_ref(), seeds, Utc::now()).await?
                }
            };
            print_json(&report)?;
        }
    }

    Ok(())
}
