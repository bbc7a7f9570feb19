use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{
    JobStatus, Listing, Market, MarketUpdate, Resighting, ScrapeJob, ScrapeOutcome, Tier,
    VerificationStatus, Verdict,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    page_bounds, DataSource, DecayCandidate, DecayUpdate, IndexEntry, JobLedger, JobQuery,
    ListingQuery, ListingStore, MarketRegistry, Page, RateLimitBudget, RatePeriod, StoreError,
};

/// Process-local store implementing every storage trait; backs tests and demo mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    markets: Mutex<HashMap<String, Market>>,
    jobs: Mutex<Vec<ScrapeJob>>,
    listings: Mutex<HashMap<Uuid, Listing>>,
    sources: Mutex<HashMap<String, DataSource>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_source(&self, source: DataSource) {
        self.sources.lock().await.insert(source.id.clone(), source);
    }

    pub async fn source(&self, id: &str) -> Option<DataSource> {
        self.sources.lock().await.get(id).cloned()
    }

    /// Direct write used by fixtures that need listings in a specific state.
    pub async fn put_listing(&self, listing: Listing) {
        self.listings.lock().await.insert(listing.id, listing);
    }

    pub async fn put_market(&self, market: Market) {
        self.markets.lock().await.insert(market.id.clone(), market);
    }

    pub async fn all_listings(&self) -> Vec<Listing> {
        let mut listings: Vec<_> = self.listings.lock().await.values().cloned().collect();
        listings.sort_by_key(|l| l.first_seen_at);
        listings
    }
}

fn paginate<T>(items: Vec<T>, page: u32, per_page: u32) -> Page<T> {
    let (limit, offset) = page_bounds(page, per_page);
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect();
    Page {
        items,
        total,
        page: page.max(1),
        per_page: limit,
    }
}

#[async_trait]
impl MarketRegistry for MemoryStore {
    async fn list_enabled(&self) -> Result<Vec<Market>, StoreError> {
        let mut markets: Vec<_> = self
            .markets
            .lock()
            .await
            .values()
            .filter(|m| m.enabled)
            .cloned()
            .collect();
        markets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(markets)
    }

    async fn list_markets(&self) -> Result<Vec<Market>, StoreError> {
        let mut markets: Vec<_> = self.markets.lock().await.values().cloned().collect();
        markets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(markets)
    }

    async fn get_market(&self, id: &str) -> Result<Option<Market>, StoreError> {
        Ok(self.markets.lock().await.get(id).cloned())
    }

    async fn create_market(&self, market: Market) -> Result<Market, StoreError> {
        let mut markets = self.markets.lock().await;
        if markets.contains_key(&market.id) {
            return Err(StoreError::Conflict(format!("market {}", market.id)));
        }
        markets.insert(market.id.clone(), market.clone());
        Ok(market)
    }

    async fn update_config(
        &self,
        id: &str,
        update: &MarketUpdate,
    ) -> Result<Option<Market>, StoreError> {
        let mut markets = self.markets.lock().await;
        Ok(markets.get_mut(id).map(|market| {
            update.apply(market);
            market.clone()
        }))
    }

    async fn record_outcome(&self, id: &str, outcome: ScrapeOutcome) -> Result<(), StoreError> {
        if let Some(market) = self.markets.lock().await.get_mut(id) {
            market.apply_outcome(&outcome);
        }
        Ok(())
    }

    async fn reset_failures(&self) -> Result<u64, StoreError> {
        let mut reset = 0;
        for market in self.markets.lock().await.values_mut() {
            if market.consecutive_failures > 0 {
                market.consecutive_failures = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[async_trait]
impl JobLedger for MemoryStore {
    async fn start_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        self.jobs.lock().await.push(job.clone());
        Ok(())
    }

    async fn finish_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        Ok(())
    }

    async fn running_market_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.market_id.clone())
            .collect())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, StoreError> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Page<ScrapeJob>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| query.market_id.as_deref().map_or(true, |m| j.market_id == m))
            .filter(|j| query.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(paginate(jobs, query.page, query.per_page))
    }

    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, StoreError> {
        let mut failed = Vec::new();
        for job in self.jobs.lock().await.iter_mut() {
            if job.status == JobStatus::Running && job.started_at < cutoff {
                job.status = JobStatus::Failed;
                job.completed_at = Some(at);
                job.error_message = Some("stuck in running state".to_string());
                failed.push(job.clone());
            }
        }
        Ok(failed)
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn market_index(&self, market_id: &str) -> Result<Vec<IndexEntry>, StoreError> {
        Ok(self
            .listings
            .lock()
            .await
            .values()
            .filter(|l| l.market_id == market_id)
            .map(IndexEntry::from)
            .collect())
    }

    async fn insert_listings(&self, listings: &[Listing]) -> Result<(), StoreError> {
        let mut stored = self.listings.lock().await;
        for listing in listings {
            stored.insert(listing.id, listing.clone());
        }
        Ok(())
    }

    async fn apply_resightings(
        &self,
        resightings: &[Resighting],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut stored = self.listings.lock().await;
        let mut applied = 0;
        for resighting in resightings {
            if let Some(listing) = stored.get_mut(&resighting.listing_id) {
                listing.record_resighting(&resighting.fresh, at);
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn decay_candidates(&self) -> Result<Vec<DecayCandidate>, StoreError> {
        let markets = self.markets.lock().await;
        let listings = self.listings.lock().await;
        Ok(listings
            .values()
            .filter(|l| l.active)
            .map(|listing| {
                let (tier, decay_rate) = markets
                    .get(&listing.market_id)
                    .map(|m| (m.tier, m.decay_rate()))
                    .unwrap_or((Tier::Cool, Tier::Cool.default_decay_rate()));
                DecayCandidate {
                    listing: listing.clone(),
                    tier,
                    decay_rate,
                }
            })
            .collect())
    }

    async fn save_decay(&self, updates: &[DecayUpdate]) -> Result<(), StoreError> {
        let mut stored = self.listings.lock().await;
        for update in updates {
            let Some(listing) = stored.get_mut(&update.listing_id) else {
                continue;
            };
            if listing.last_seen_at == update.seen_at
                && listing.verification_status == update.previous_status
            {
                listing.freshness_confidence = update.confidence;
                listing.confidence_updated_at = Some(update.at);
                listing.verification_status = update.verification_status;
                listing.active = update.active;
            }
        }
        Ok(())
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        Ok(self.listings.lock().await.get(&id).cloned())
    }

    async fn search_listings(&self, query: &ListingQuery) -> Result<Page<Listing>, StoreError> {
        let mut listings: Vec<_> = self
            .listings
            .lock()
            .await
            .values()
            .filter(|l| query.market_id.as_deref().map_or(true, |m| l.market_id == m))
            .filter(|l| query.min_confidence.map_or(true, |c| l.freshness_confidence >= c))
            .filter(|l| query.active.map_or(true, |a| l.active == a))
            .cloned()
            .collect();
        listings.sort_by(|a, b| {
            b.freshness_confidence
                .cmp(&a.freshness_confidence)
                .then(b.last_seen_at.cmp(&a.last_seen_at))
        });
        Ok(paginate(listings, query.page, query.per_page))
    }

    async fn record_verdict(
        &self,
        id: Uuid,
        verdict: Verdict,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut stored = self.listings.lock().await;
        match stored.get_mut(&id) {
            Some(listing) if listing.verification_status == VerificationStatus::Pending => {
                listing.apply_verdict(verdict, at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_exhausted(&self) -> Result<u64, StoreError> {
        let mut deactivated = 0;
        for listing in self.listings.lock().await.values_mut() {
            if listing.active && listing.is_exhausted() {
                listing.active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }
}

#[async_trait]
impl RateLimitBudget for MemoryStore {
    async fn try_acquire(&self, source_id: &str) -> Result<bool, StoreError> {
        let mut sources = self.sources.lock().await;
        let Some(source) = sources.get_mut(source_id) else {
            return Ok(true);
        };
        if !source.has_budget() {
            return Ok(false);
        }
        source.current_hour_calls += 1;
        source.current_day_calls += 1;
        Ok(true)
    }

    async fn reset(&self, period: RatePeriod) -> Result<u64, StoreError> {
        let mut sources = self.sources.lock().await;
        for source in sources.values_mut() {
            match period {
                RatePeriod::Hour => source.current_hour_calls = 0,
                RatePeriod::Day => {
                    source.current_hour_calls = 0;
                    source.current_day_calls = 0;
                }
            }
        }
        Ok(sources.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use scout_core::{JobTrigger, NewMarket, NormalizedListing};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn market(id: &str) -> Market {
        NewMarket {
            id: id.into(),
            display_name: id.into(),
            city: id.into(),
            state: "PA".into(),
            tier: Tier::Hot,
            enabled: None,
            max_items_per_scrape: None,
            scrape_interval_hours: None,
            decay_rate_per_hour: None,
        }
        .into_market(now())
    }

    fn listing(market_id: &str) -> Listing {
        Listing::first_sighting(
            market_id,
            format!("fp-{}", Uuid::new_v4()),
            NormalizedListing {
                source_url: None,
                address: "1 Elm St".into(),
                city: None,
                state: None,
                rent: 1500,
                bedrooms: 1,
                bathrooms: 1.0,
                sqft: None,
                description: None,
                images: vec![],
                quality_score: 50,
            },
            now(),
        )
    }

    #[tokio::test]
    async fn create_market_rejects_duplicates() {
        let store = MemoryStore::new();
        store.create_market(market("boston")).await.unwrap();
        let err = store.create_market(market("boston")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn outcomes_and_reset_drive_circuit_breaker() {
        let store = MemoryStore::new();
        store.create_market(market("boston")).await.unwrap();
        for _ in 0..3 {
            store
                .record_outcome("boston", ScrapeOutcome::failed(now()))
                .await
                .unwrap();
        }
        assert!(store.get_market("boston").await.unwrap().unwrap().circuit_open());
        assert_eq!(store.reset_failures().await.unwrap(), 1);
        assert_eq!(
            store.get_market("boston").await.unwrap().unwrap().consecutive_failures,
            0
        );
    }

    #[tokio::test]
    async fn budget_is_consumed_and_reset() {
        let store = MemoryStore::new();
        store.register_source(DataSource::new("src", 2, 10)).await;
        assert!(store.try_acquire("src").await.unwrap());
        assert!(store.try_acquire("src").await.unwrap());
        assert!(!store.try_acquire("src").await.unwrap());
        assert!(store.try_acquire("unknown").await.unwrap());

        store.reset(RatePeriod::Hour).await.unwrap();
        assert!(store.try_acquire("src").await.unwrap());
        assert_eq!(store.source("src").await.unwrap().current_day_calls, 3);
    }

    #[tokio::test]
    async fn verdicts_only_land_on_pending_listings() {
        let store = MemoryStore::new();
        let mut pending = listing("boston");
        pending.verification_status = VerificationStatus::Pending;
        let fresh = listing("boston");
        store.put_listing(pending.clone()).await;
        store.put_listing(fresh.clone()).await;

        assert!(store.record_verdict(pending.id, Verdict::Gone, now()).await.unwrap());
        assert!(!store.record_verdict(fresh.id, Verdict::Gone, now()).await.unwrap());

        let gone = store.get_listing(pending.id).await.unwrap().unwrap();
        assert!(!gone.active);
        assert_eq!(gone.verification_status, VerificationStatus::Gone);
        assert!(store.get_listing(fresh.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn stale_jobs_are_failed_and_filtered_from_running() {
        let store = MemoryStore::new();
        let old = ScrapeJob::start("boston", "src", JobTrigger::Scheduled, now() - Duration::hours(2));
        let recent = ScrapeJob::start("nyc", "src", JobTrigger::Manual, now());
        store.start_job(&old).await.unwrap();
        store.start_job(&recent).await.unwrap();

        let failed = store
            .fail_stale(now() - Duration::minutes(30), now())
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].market_id, "boston");

        let running = store.running_market_ids().await.unwrap();
        assert!(running.contains("nyc"));
        assert!(!running.contains("boston"));

        let page = store
            .list_jobs(&JobQuery {
                status: Some(JobStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn exhausted_listings_are_deactivated_unless_verified() {
        let store = MemoryStore::new();
        let mut dead = listing("boston");
        dead.freshness_confidence = 0;
        let mut verified = listing("boston");
        verified.freshness_confidence = 0;
        verified.verification_status = VerificationStatus::Verified;
        store.put_listing(dead.clone()).await;
        store.put_listing(verified.clone()).await;

        assert_eq!(store.deactivate_exhausted().await.unwrap(), 1);
        assert!(!store.get_listing(dead.id).await.unwrap().unwrap().active);
        assert!(store.get_listing(verified.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn decay_candidates_fall_back_to_cool_for_unknown_markets() {
        let store = MemoryStore::new();
        store.create_market(market("boston")).await.unwrap();
        store.put_listing(listing("boston")).await;
        store.put_listing(listing("nowhere")).await;

        let mut candidates = store.decay_candidates().await.unwrap();
        candidates.sort_by_key(|c| c.decay_rate);
        assert_eq!(candidates[0].tier, Tier::Cool);
        assert_eq!(candidates[0].decay_rate, 1);
        assert_eq!(candidates[1].tier, Tier::Hot);
        assert_eq!(candidates[1].decay_rate, 3);
    }

    #[tokio::test]
    async fn decay_write_skips_listings_that_moved_on() {
        let store = MemoryStore::new();
        let listing = listing("boston");
        store.put_listing(listing.clone()).await;
        let update = DecayUpdate {
            listing_id: listing.id,
            confidence: 0,
            verification_status: VerificationStatus::Unverified,
            active: false,
            at: now() + Duration::hours(40),
            seen_at: listing.last_seen_at,
            previous_status: listing.verification_status,
        };

        let mut resighted = listing.clone();
        resighted.last_seen_at = now() + Duration::hours(39);
        store.put_listing(resighted).await;
        store.save_decay(&[update]).await.unwrap();
        let kept = store.get_listing(listing.id).await.unwrap().unwrap();
        assert!(kept.active);
        assert_eq!(kept.freshness_confidence, 100);

        store.put_listing(listing.clone()).await;
        store.save_decay(&[update]).await.unwrap();
        assert!(!store.get_listing(listing.id).await.unwrap().unwrap().active);
    }
}
