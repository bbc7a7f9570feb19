//! Daily sweep: exhausted listings, tripped circuits, stale jobs and daily budgets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use scout_core::ScrapeOutcome;
use scout_storage::{JobLedger, ListingStore, MarketRegistry, RatePeriod, RateLimitBudget, StoreError};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub deactivated: u64,
    pub circuits_reset: u64,
    pub stale_jobs_failed: usize,
    pub rate_limits_reset: u64,
}

/// Daily housekeeping. Each step is independent; later steps still run when an earlier one fails.
pub struct MaintenanceSweep {
    markets: Arc<dyn MarketRegistry>,
    jobs: Arc<dyn JobLedger>,
    listings: Arc<dyn ListingStore>,
    budget: Arc<dyn RateLimitBudget>,
    stale_after: chrono::Duration,
}

impl MaintenanceSweep {
    pub fn new(
        markets: Arc<dyn MarketRegistry>,
        jobs: Arc<dyn JobLedger>,
        listings: Arc<dyn ListingStore>,
        budget: Arc<dyn RateLimitBudget>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            markets,
            jobs,
            listings,
            budget,
            stale_after,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, StoreError> {
        let span = info_span!("maintenance_sweep", %now);
        async move {
            let mut report = MaintenanceReport::default();
            let mut first_error = None;

            match self.listings.deactivate_exhausted().await {
                Ok(n) => report.deactivated = n,
                Err(err) => {
                    warn!(error = %err, "deactivating exhausted listings failed");
                    first_error.get_or_insert(err);
                }
            }

            match self.markets.reset_failures().await {
                Ok(n) => report.circuits_reset = n,
                Err(err) => {
                    warn!(error = %err, "resetting circuit breakers failed");
                    first_error.get_or_insert(err);
                }
            }

            // Stale jobs count as one fresh failure for their market after the reset.
            match self.jobs.fail_stale(now - self.stale_after, now).await {
                Ok(stale) => {
                    report.stale_jobs_failed = stale.len();
                    for job in stale {
                        warn!(job_id = %job.id, market_id = %job.market_id, "failed stale job");
                        if let Err(err) = self
                            .markets
                            .record_outcome(&job.market_id, ScrapeOutcome::failed(now))
                            .await
                        {
                            warn!(error = %err, market_id = %job.market_id, "recording stale job failure");
                            first_error.get_or_insert(err);
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failing stale jobs failed");
                    first_error.get_or_insert(err);
                }
            }

            match self.budget.reset(RatePeriod::Day).await {
                Ok(n) => report.rate_limits_reset = n,
                Err(err) => {
                    warn!(error = %err, "resetting daily rate limits failed");
                    first_error.get_or_insert(err);
                }
            }

            info!(
                deactivated = report.deactivated,
                circuits_reset = report.circuits_reset,
                stale_jobs_failed = report.stale_jobs_failed,
                rate_limits_reset = report.rate_limits_reset,
                "maintenance sweep finished"
            );
            match first_error {
                Some(err) => Err(err),
                None => Ok(report),
            }
        }
        .instrument(span)
        .await
    }
}
