//! Scrape scheduling and listing freshness engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scout_connectors::{
    BasicNormalizer, FixtureConnector, GoneDetector, HttpJsonConnector, HttpListingProbe, ListingProbe,
    Normalizer, ScraperConnector,
};
use scout_core::JobTrigger;
use scout_storage::{
    DataSource, HttpClientConfig, HttpFetcher, JobLedger, ListingStore, MarketRegistry, MemoryStore,
    PgStore, RatePeriod, RateLimitBudget, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod freshness;
pub mod maintenance;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;
pub mod seed;

pub use config::{ConnectorKind, RetryPolicy, StoreKind, SyncConfig};
pub use dedup::{DedupEngine, FuzzyAddressMatcher, ResightingMatcher};
pub use dispatcher::{DispatchReport, Dispatcher, SkipReason};
pub use freshness::{DecayReport, DecayTick, ListingVerifier, VerificationOutcome};
pub use maintenance::{MaintenanceReport, MaintenanceSweep};
pub use orchestrator::{OrchestratorError, ScrapeOrchestrator, ScrapeReport};
pub use pool::{run_until_idle, BufferedQueue, ChannelQueue, QueueError, TaskQueue, WorkItem, WorkerPool};
pub use scheduler::build_scheduler;
pub use seed::{load_market_seeds, seed_markets, MarketSeedFile, SeedReport};

pub const CRATE_NAME: &str = "scout-sync";

/// Default hourly and daily request budgets for a freshly registered data source.
pub const DEFAULT_HOURLY_BUDGET: u32 = 100;
pub const DEFAULT_DAILY_BUDGET: u32 = 1000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// The four storage seams, usually all backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub markets: Arc<dyn MarketRegistry>,
    pub jobs: Arc<dyn JobLedger>,
    pub listings: Arc<dyn ListingStore>,
    pub budget: Arc<dyn RateLimitBudget>,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: MarketRegistry + JobLedger + ListingStore + RateLimitBudget + 'static,
    {
        Self {
            markets: store.clone(),
            jobs: store.clone(),
            listings: store.clone(),
            budget: store,
        }
    }
}

/// Collaborators outside the storage layer.
pub struct Collaborators {
    pub connector: Arc<dyn ScraperConnector>,
    pub normalizer: Arc<dyn Normalizer>,
    pub probe: Arc<dyn ListingProbe>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub max_stagger: Duration,
    pub stale_after: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_stagger: Duration::from_secs(60),
            stale_after: chrono::Duration::minutes(30),
        }
    }
}

/// Result of executing one queued work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Execution {
    Scrape(ScrapeReport),
    Verify {
        listing_id: Uuid,
        outcome: VerificationOutcome,
    },
}

pub struct Engine {
    stores: Stores,
    queue: Arc<dyn TaskQueue>,
    dispatcher: Dispatcher,
    decay: DecayTick,
    orchestrator: ScrapeOrchestrator,
    verifier: ListingVerifier,
    maintenance: MaintenanceSweep,
}

impl Engine {
    pub fn new(
        stores: Stores,
        queue: Arc<dyn TaskQueue>,
        collaborators: Collaborators,
        settings: EngineSettings,
    ) -> Self {
        let Collaborators {
            connector,
            normalizer,
            probe,
        } = collaborators;
        Self {
            dispatcher: Dispatcher::new(
                stores.markets.clone(),
                stores.jobs.clone(),
                queue.clone(),
                settings.max_stagger,
            ),
            decay: DecayTick::new(stores.listings.clone(), queue.clone()),
            orchestrator: ScrapeOrchestrator::new(
                stores.markets.clone(),
                stores.jobs.clone(),
                stores.listings.clone(),
                stores.budget.clone(),
                connector,
                normalizer,
                DedupEngine::default(),
                settings.retry,
            ),
            verifier: ListingVerifier::new(stores.listings.clone(), probe),
            maintenance: MaintenanceSweep::new(
                stores.markets.clone(),
                stores.jobs.clone(),
                stores.listings.clone(),
                stores.budget.clone(),
                settings.stale_after,
            ),
            stores,
            queue,
        }
    }

    /// Wires stores and collaborators from the environment-derived config.
    pub async fn from_config(config: &SyncConfig, queue: Arc<dyn TaskQueue>) -> Result<Self> {
        let stores = match config.store {
            StoreKind::Postgres => {
                let store = PgStore::connect(&config.database_url)
                    .await
                    .context("connecting to postgres")?;
                Stores::shared(Arc::new(store))
            }
            StoreKind::Memory => {
                let store = Arc::new(MemoryStore::new());
                store
                    .register_source(DataSource::new(
                        config.source_id.clone(),
                        DEFAULT_HOURLY_BUDGET,
                        DEFAULT_DAILY_BUDGET,
                    ))
                    .await;
                if config.markets_file.exists() {
                    let seeds = load_market_seeds(&config.markets_file).await?;
                    seed_markets(store.as_ref(), seeds, Utc::now()).await?;
                } else {
                    warn!(path = %config.markets_file.display(), "no market seed file; memory store starts empty");
                }
                Stores::shared(store)
            }
        };

        // The orchestrator owns per-attempt deadlines; the client only caps the longest one.
        let retry = config.retry_policy();
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: retry.timeout_for(retry.max_timeout_retries),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?);

        let connector: Arc<dyn ScraperConnector> = match config.connector {
            ConnectorKind::Fixture => Arc::new(FixtureConnector::new(
                config.source_id.clone(),
                config.fixtures_dir.clone(),
            )),
            ConnectorKind::Http => {
                let base_url = config
                    .connector_url
                    .clone()
                    .context("SCOUT_CONNECTOR_URL is required for the http connector")?;
                Arc::new(HttpJsonConnector::new(config.source_id.clone(), base_url, fetcher.clone()))
            }
        };
        let probe = Arc::new(HttpListingProbe::new(
            fetcher,
            GoneDetector::default(),
            config.verify_timeout(),
        ));

        info!(store = ?config.store, connector = ?config.connector, source_id = %config.source_id, "engine configured");
        Ok(Self::new(
            stores,
            queue,
            Collaborators {
                connector,
                normalizer: Arc::new(BasicNormalizer::new()),
                probe,
            },
            EngineSettings {
                retry,
                max_stagger: config.max_stagger(),
                stale_after: config.stale_after(),
            },
        ))
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        self.queue.clone()
    }

    pub async fn dispatch_tick(&self) -> Result<DispatchReport, EngineError> {
        self.dispatch_tick_at(Utc::now()).await
    }

    pub async fn dispatch_tick_at(&self, now: DateTime<Utc>) -> Result<DispatchReport, EngineError> {
        self.dispatcher.tick(now).await
    }

    pub async fn decay_tick(&self) -> Result<DecayReport, EngineError> {
        self.decay_tick_at(Utc::now()).await
    }

    pub async fn decay_tick_at(&self, now: DateTime<Utc>) -> Result<DecayReport, EngineError> {
        self.decay.run(now).await
    }

    pub async fn maintenance_sweep(&self) -> Result<MaintenanceReport, EngineError> {
        self.maintenance_sweep_at(Utc::now()).await
    }

    pub async fn maintenance_sweep_at(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, EngineError> {
        Ok(self.maintenance.run(now).await?)
    }

    /// Hourly counter reset for every data source.
    pub async fn rate_reset(&self) -> Result<u64, EngineError> {
        Ok(self.stores.budget.reset(RatePeriod::Hour).await?)
    }

    /// Runs one scrape inline, bypassing the queue.
    pub async fn scrape(&self, market_id: &str, trigger: JobTrigger) -> Result<ScrapeReport, EngineError> {
        Ok(self.orchestrator.run(market_id, trigger).await?)
    }

    /// Out-of-band scrape: no stagger, no due or circuit check.
    pub async fn enqueue_manual_scrape(&self, market_id: &str) -> Result<(), EngineError> {
        if self.stores.markets.get_market(market_id).await?.is_none() {
            return Err(OrchestratorError::MarketNotFound(market_id.to_string()).into());
        }
        self.queue.enqueue(WorkItem::Scrape {
            market_id: market_id.to_string(),
            trigger: JobTrigger::Manual,
            delay: Duration::ZERO,
        })?;
        info!(%market_id, "manual scrape enqueued");
        Ok(())
    }

    pub async fn verify(&self, listing_id: Uuid) -> Result<VerificationOutcome, EngineError> {
        self.verify_at(listing_id, Utc::now()).await
    }

    pub async fn verify_at(&self, listing_id: Uuid, now: DateTime<Utc>) -> Result<VerificationOutcome, EngineError> {
        Ok(self.verifier.verify(listing_id, now).await?)
    }

    pub async fn execute(&self, item: WorkItem) -> Result<Execution, EngineError> {
        match item {
            WorkItem::Scrape {
                market_id, trigger, ..
            } => Ok(Execution::Scrape(self.scrape(&market_id, trigger).await?)),
            WorkItem::Verify { listing_id } => Ok(Execution::Verify {
                listing_id,
                outcome: self.verify(listing_id).await?,
            }),
        }
    }
}
