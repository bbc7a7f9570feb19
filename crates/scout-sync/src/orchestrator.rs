//! One scrape of one market: budget check, connector call with retry
//! discipline, normalization, dedup, persistence and bookkeeping.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use scout_connectors::{ConnectorError, Normalizer, ScraperConnector};
use scout_core::{
    JobMetrics, JobStatus, JobTrigger, Listing, Market, NormalizedListing, RawListing,
    ScrapeJob, ScrapeOutcome, ScrapeStatus,
};
use scout_storage::{JobLedger, ListingStore, MarketRegistry, RateLimitBudget, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::dedup::DedupEngine;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("market {0} not found")]
    MarketNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeReport {
    pub job_id: Uuid,
    pub market_id: String,
    pub status: ScrapeStatus,
    pub metrics: JobMetrics,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Why the connector call finally gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FetchFailure {
    error: ConnectorError,
    attempts: u32,
}

pub struct ScrapeOrchestrator {
    markets: Arc<dyn MarketRegistry>,
    jobs: Arc<dyn JobLedger>,
    listings: Arc<dyn ListingStore>,
    budget: Arc<dyn RateLimitBudget>,
    connector: Arc<dyn ScraperConnector>,
    normalizer: Arc<dyn Normalizer>,
    dedup: DedupEngine,
    retry: RetryPolicy,
}

impl ScrapeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        markets: Arc<dyn MarketRegistry>,
        jobs: Arc<dyn JobLedger>,
        listings: Arc<dyn ListingStore>,
        budget: Arc<dyn RateLimitBudget>,
        connector: Arc<dyn ScraperConnector>,
        normalizer: Arc<dyn Normalizer>,
        dedup: DedupEngine,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            markets,
            jobs,
            listings,
            budget,
            connector,
            normalizer,
            dedup,
            retry,
        }
    }

    pub fn source_id(&self) -> &str {
        self.connector.source_id()
    }

    pub async fn run(
        &self,
        market_id: &str,
        trigger: JobTrigger,
    ) -> Result<ScrapeReport, OrchestratorError> {
        let market = self
            .markets
            .get_market(market_id)
            .await?
            .ok_or_else(|| OrchestratorError::MarketNotFound(market_id.to_string()))?;

        let job = ScrapeJob::start(&market.id, self.source_id(), trigger, Utc::now());
        self.jobs.start_job(&job).await?;

        let span = info_span!("scrape", market_id = %market.id, job_id = %job.id, ?trigger);
        self.run_job(market, job).instrument(span).await
    }

    async fn run_job(&self, market: Market, mut job: ScrapeJob) -> Result<ScrapeReport, OrchestratorError> {
        let acquired = self
            .with_persist_retry("check rate limit budget", || self.budget.try_acquire(&job.source_id))
            .await;
        match acquired {
            Ok(true) => {}
            Ok(false) => {
                warn!(source_id = %job.source_id, "rate limit budget exhausted; market not penalized");
                return self
                    .fail(job, ScrapeStatus::RateLimited, "rate limit budget exhausted".into(), 0, None)
                    .await;
            }
            Err(err) => {
                warn!(error = %err, "rate limit budget unavailable after retry");
                return self
                    .fail(
                        job,
                        ScrapeStatus::Failed,
                        format!("checking rate limit budget: {err}"),
                        0,
                        Some(ScrapeOutcome::failed(Utc::now())),
                    )
                    .await;
            }
        }

        let raw = match self.fetch_with_retry(&market).await {
            Ok((raw, attempts)) => {
                debug!(count = raw.len(), attempts, "connector returned listings");
                job.metrics.found = count_u32(raw.len());
                (raw, attempts)
            }
            Err(FetchFailure {
                error: ConnectorError::RateLimited(detail),
                attempts,
            }) => {
                warn!(attempts, "source kept rate limiting; market not penalized");
                return self
                    .fail(
                        job,
                        ScrapeStatus::RateLimited,
                        format!("rate limited by source after {attempts} attempts: {detail}"),
                        attempts,
                        None,
                    )
                    .await;
            }
            Err(FetchFailure { error, attempts }) => {
                warn!(attempts, error = %error, "connector failed; counting against circuit breaker");
                let message = format!("{error} (after {attempts} attempts)");
                return self
                    .fail(
                        job,
                        ScrapeStatus::Failed,
                        message,
                        attempts,
                        Some(ScrapeOutcome::failed(Utc::now())),
                    )
                    .await;
            }
        };
        let (raw, attempts) = raw;

        let normalized = self.normalize_batch(&raw, &mut job.metrics).await;
        let index = match self
            .with_persist_retry("load market index", || self.listings.market_index(&market.id))
            .await
        {
            Ok(index) => index,
            Err(err) => {
                warn!(error = %err, "market index unavailable after retry");
                return self
                    .fail(
                        job,
                        ScrapeStatus::Failed,
                        format!("loading market index: {err}"),
                        attempts,
                        Some(ScrapeOutcome::failed(Utc::now())),
                    )
                    .await;
            }
        };
        let outcome = self.dedup.classify(normalized, &index);
        let counts = outcome.counts();
        job.metrics.new = count_u32(counts.new);
        job.metrics.updated = count_u32(counts.updated);
        job.metrics.duplicates = count_u32(counts.duplicates);

        let now = Utc::now();
        let fresh: Vec<Listing> = outcome
            .new
            .into_iter()
            .map(|sighting| Listing::first_sighting(&market.id, sighting.fingerprint, sighting.listing, now))
            .collect();
        let resightings = outcome.updates;

        let persisted = async {
            if !fresh.is_empty() {
                self.with_persist_retry("insert new listings", || self.listings.insert_listings(&fresh))
                    .await?;
            }
            if !resightings.is_empty() {
                self.with_persist_retry("refresh re-seen listings", || {
                    self.listings.apply_resightings(&resightings, now)
                })
                .await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;

        if let Err(err) = persisted {
            warn!(error = %err, "persistence failed after retry");
            return self
                .fail(
                    job,
                    ScrapeStatus::Failed,
                    format!("persisting listings: {err}"),
                    attempts,
                    Some(ScrapeOutcome::failed(Utc::now())),
                )
                .await;
        }

        let finished_at = Utc::now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(finished_at);
        self.close(&job, Some(ScrapeOutcome::completed(finished_at))).await?;

        info!(
            found = job.metrics.found,
            new = job.metrics.new,
            updated = job.metrics.updated,
            duplicates = job.metrics.duplicates,
            errors = job.metrics.errors,
            "scrape completed"
        );
        Ok(ScrapeReport {
            job_id: job.id,
            market_id: job.market_id,
            status: ScrapeStatus::Completed,
            metrics: job.metrics,
            attempts,
            error: None,
        })
    }

    /// Timeouts retry with a doubled timeout, 429s after a fixed backoff, server and
    /// network errors with exponential backoff. Rejections are not retried.
    async fn fetch_with_retry(&self, market: &Market) -> Result<(Vec<RawListing>, u32), FetchFailure> {
        let mut attempts = 0u32;
        let mut timeouts = 0u32;
        let mut rate_limited = 0u32;
        let mut server_errors = 0u32;

        loop {
            attempts += 1;
            let timeout = self.retry.timeout_for(timeouts);
            let result = match tokio::time::timeout(
                timeout,
                self.connector
                    .fetch(&market.locator, market.max_items_per_scrape),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::Timeout),
            };

            let error = match result {
                Ok(raw) => return Ok((raw, attempts)),
                Err(error) => error,
            };

            let backoff = match &error {
                ConnectorError::Timeout if timeouts < self.retry.max_timeout_retries => {
                    timeouts += 1;
                    None
                }
                ConnectorError::RateLimited(_) if rate_limited < self.retry.rate_limit_retries => {
                    rate_limited += 1;
                    Some(self.retry.rate_limit_backoff)
                }
                ConnectorError::Server(_) | ConnectorError::Network(_)
                    if server_errors < self.retry.server_retries =>
                {
                    let delay = self.retry.server_backoff(server_errors);
                    server_errors += 1;
                    Some(delay)
                }
                _ => return Err(FetchFailure { error, attempts }),
            };

            debug!(attempt = attempts, error = %error, ?backoff, "retrying connector call");
            if let Some(delay) = backoff {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn normalize_batch(&self, raw: &[RawListing], metrics: &mut JobMetrics) -> Vec<NormalizedListing> {
        let mut normalized = Vec::with_capacity(raw.len());
        for item in raw {
            match self.normalizer.normalize(item).await {
                Ok(listing) => normalized.push(listing),
                Err(err) => {
                    metrics.errors += 1;
                    debug!(error = %err, external_id = ?item.external_id, "dropping invalid listing");
                }
            }
        }
        normalized
    }

    async fn with_persist_retry<F, Fut, T>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if retries < self.retry.persist_retries => {
                    retries += 1;
                    warn!(error = %err, what, "persistence failed; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes the final job row and the market outcome, each with one retry.
    /// The outcome is still recorded when the job row cannot be written.
    async fn close(&self, job: &ScrapeJob, outcome: Option<ScrapeOutcome>) -> Result<(), StoreError> {
        let finished = self
            .with_persist_retry("finish job", || self.jobs.finish_job(job))
            .await;
        if let Some(outcome) = outcome {
            self.with_persist_retry("record market outcome", || {
                self.markets.record_outcome(&job.market_id, outcome)
            })
            .await?;
        }
        finished
    }

    async fn fail(
        &self,
        mut job: ScrapeJob,
        status: ScrapeStatus,
        message: String,
        attempts: u32,
        outcome: Option<ScrapeOutcome>,
    ) -> Result<ScrapeReport, OrchestratorError> {
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error_message = Some(message.clone());
        self.close(&job, outcome).await?;
        Ok(ScrapeReport {
            job_id: job.id,
            market_id: job.market_id,
            status,
            metrics: job.metrics,
            attempts,
            error: Some(message),
        })
    }
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
