//! Durable state for Scout: market registry, job ledger, listing store and the
//! shared per-source rate-limit budget, plus the throttled HTTP fetcher.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{
    JobStatus, Listing, Market, MarketUpdate, Resighting, ScrapeJob, ScrapeOutcome, Tier,
    VerificationStatus, Verdict,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{classify_status, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, StatusClass};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "scout-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// The slice of a stored listing the dedup engine matches against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub listing_id: Uuid,
    pub fingerprint: String,
    pub address: String,
    pub rent: i64,
    pub bedrooms: i32,
}

impl From<&Listing> for IndexEntry {
    fn from(listing: &Listing) -> Self {
        Self {
            listing_id: listing.id,
            fingerprint: listing.fingerprint.clone(),
            address: listing.address.clone(),
            rent: listing.rent,
            bedrooms: listing.bedrooms,
        }
    }
}

/// Freshness state written back by one decay tick for one listing.
///
/// `seen_at` and `previous_status` are the values the tick read; the write is
/// skipped when a re-sighting or verdict changed either in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayUpdate {
    pub listing_id: Uuid,
    pub confidence: u8,
    pub verification_status: VerificationStatus,
    pub active: bool,
    pub at: DateTime<Utc>,
    pub seen_at: DateTime<Utc>,
    pub previous_status: VerificationStatus,
}

/// Active listing joined with the decay parameters of its market.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayCandidate {
    pub listing: Listing,
    pub tier: Tier,
    pub decay_rate: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    pub market_id: Option<String>,
    pub status: Option<JobStatus>,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingQuery {
    pub market_id: Option<String>,
    pub min_confidence: Option<u8>,
    pub active: Option<bool>,
    pub page: u32,
    pub per_page: u32,
}

pub const DEFAULT_PER_PAGE: u32 = 50;
pub const MAX_PER_PAGE: u32 = 500;

/// Resolves 1-based page numbers into (limit, offset).
pub fn page_bounds(page: u32, per_page: u32) -> (u32, u32) {
    let per_page = match per_page {
        0 => DEFAULT_PER_PAGE,
        n => n.min(MAX_PER_PAGE),
    };
    let page = page.max(1);
    (per_page, (page - 1).saturating_mul(per_page))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatePeriod {
    Hour,
    Day,
}

/// Per-source request budget, mirrored by the `data_sources` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub enabled: bool,
    pub rate_limit_per_hour: u32,
    pub rate_limit_per_day: u32,
    pub current_hour_calls: u32,
    pub current_day_calls: u32,
}

impl DataSource {
    pub fn new(id: impl Into<String>, per_hour: u32, per_day: u32) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            rate_limit_per_hour: per_hour,
            rate_limit_per_day: per_day,
            current_hour_calls: 0,
            current_day_calls: 0,
        }
    }

    pub fn has_budget(&self) -> bool {
        self.enabled
            && self.current_hour_calls < self.rate_limit_per_hour
            && self.current_day_calls < self.rate_limit_per_day
    }
}

#[async_trait]
pub trait MarketRegistry: Send + Sync {
    async fn list_enabled(&self) -> Result<Vec<Market>, StoreError>;
    async fn list_markets(&self) -> Result<Vec<Market>, StoreError>;
    async fn get_market(&self, id: &str) -> Result<Option<Market>, StoreError>;
    /// Fails with [`StoreError::Conflict`] when the id is taken.
    async fn create_market(&self, market: Market) -> Result<Market, StoreError>;
    async fn update_config(
        &self,
        id: &str,
        update: &MarketUpdate,
    ) -> Result<Option<Market>, StoreError>;
    /// Stamps last-scrape time/status; success clears the failure count, failure adds one.
    async fn record_outcome(&self, id: &str, outcome: ScrapeOutcome) -> Result<(), StoreError>;
    async fn reset_failures(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn start_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;
    async fn finish_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;
    async fn running_market_ids(&self) -> Result<HashSet<String>, StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, StoreError>;
    async fn list_jobs(&self, query: &JobQuery) -> Result<Page<ScrapeJob>, StoreError>;
    /// Force-fails every job still running that started before `cutoff`.
    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, StoreError>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Every listing of a market, active or not, so old sightings can be revived.
    async fn market_index(&self, market_id: &str) -> Result<Vec<IndexEntry>, StoreError>;
    async fn insert_listings(&self, listings: &[Listing]) -> Result<(), StoreError>;
    async fn apply_resightings(
        &self,
        resightings: &[Resighting],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    async fn decay_candidates(&self) -> Result<Vec<DecayCandidate>, StoreError>;
    async fn save_decay(&self, updates: &[DecayUpdate]) -> Result<(), StoreError>;
    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError>;
    async fn search_listings(&self, query: &ListingQuery) -> Result<Page<Listing>, StoreError>;
    /// Applies only while the listing is still pending; returns whether it did.
    async fn record_verdict(
        &self,
        id: Uuid,
        verdict: Verdict,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn deactivate_exhausted(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RateLimitBudget: Send + Sync {
    /// Atomically checks and consumes one request. Unknown sources are unlimited.
    async fn try_acquire(&self, source_id: &str) -> Result<bool, StoreError>;
    async fn reset(&self, period: RatePeriod) -> Result<u64, StoreError>;
}
