use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use scout_connectors::{BasicNormalizer, ConnectorError, ListingProbe, ProbeError, ScraperConnector};
use scout_core::{
    JobStatus, JobTrigger, MarketLocator, NewMarket, RawListing, ScrapeStatus, Tier, VerificationStatus,
    Verdict,
};
use scout_storage::{JobLedger, JobQuery, MarketRegistry, MemoryStore};
use scout_sync::{
    run_until_idle, BufferedQueue, Collaborators, Engine, EngineSettings, RetryPolicy, SkipReason, Stores,
    VerificationOutcome,
};

type FetchResult = Result<Vec<RawListing>, ConnectorError>;

/// Per-market canned responses, keyed by city.
#[derive(Default)]
struct ScriptedConnector {
    responses: Mutex<HashMap<String, FetchResult>>,
}

impl ScriptedConnector {
    fn respond(&self, city: &str, result: FetchResult) {
        self.responses.lock().unwrap().insert(city.to_string(), result);
    }
}

#[async_trait]
impl ScraperConnector for ScriptedConnector {
    fn source_id(&self) -> &str {
        "apartments_com"
    }

    async fn fetch(&self, locator: &MarketLocator, _max_items: u32) -> FetchResult {
        self.responses
            .lock()
            .unwrap()
            .get(&locator.city)
            .cloned()
            .unwrap_or_else(|| Ok(vec![]))
    }
}

/// Per-url canned verdicts; unknown urls look live.
#[derive(Default)]
struct ScriptedProbe {
    verdicts: Mutex<HashMap<String, Result<Verdict, ProbeError>>>,
}

impl ScriptedProbe {
    fn answer(&self, url: &str, result: Result<Verdict, ProbeError>) {
        self.verdicts.lock().unwrap().insert(url.to_string(), result);
    }
}

#[async_trait]
impl ListingProbe for ScriptedProbe {
    async fn probe(&self, source_url: &str) -> Result<Verdict, ProbeError> {
        self.verdicts
            .lock()
            .unwrap()
            .get(source_url)
            .cloned()
            .unwrap_or(Ok(Verdict::Verified))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<BufferedQueue>,
    connector: Arc<ScriptedConnector>,
    probe: Arc<ScriptedProbe>,
    engine: Arc<Engine>,
}

impl Harness {
    async fn new(markets: &[(&str, Tier)]) -> Self {
        let store = Arc::new(MemoryStore::new());
        let created_at = Utc::now() - ChronoDuration::days(7);
        for (city, tier) in markets {
            store
                .put_market(
                    NewMarket {
                        id: city.to_lowercase(),
                        display_name: city.to_string(),
                        city: city.to_string(),
                        state: "PA".into(),
                        tier: *tier,
                        enabled: None,
                        max_items_per_scrape: None,
                        scrape_interval_hours: None,
                        decay_rate_per_hour: None,
                    }
                    .into_market(created_at),
                )
                .await;
        }
        let queue = Arc::new(BufferedQueue::new());
        let connector = Arc::new(ScriptedConnector::default());
        let probe = Arc::new(ScriptedProbe::default());
        let engine = Arc::new(Engine::new(
            Stores::shared(store.clone()),
            queue.clone(),
            Collaborators {
                connector: connector.clone(),
                normalizer: Arc::new(BasicNormalizer::new()),
                probe: probe.clone(),
            },
            EngineSettings {
                retry: RetryPolicy::immediate(),
                max_stagger: Duration::ZERO,
                ..EngineSettings::default()
            },
        ));
        Self {
            store,
            queue,
            connector,
            probe,
            engine,
        }
    }

    async fn drain(&self) -> usize {
        run_until_idle(self.engine.clone(), &self.queue, 4, false).await
    }
}

fn raw(address: &str, rent: f64) -> RawListing {
    RawListing {
        address: Some(address.into()),
        rent: Some(rent),
        bedrooms: Some(2.0),
        bathrooms: Some(1.0),
        source_url: Some(format!("https://listings.test/{}", address.replace(' ', "-").to_lowercase())),
        ..Default::default()
    }
}

#[tokio::test]
async fn dispatch_scrapes_due_markets_and_persists_listings() {
    let h = Harness::new(&[("Philadelphia", Tier::Hot), ("Pittsburgh", Tier::Standard)]).await;
    h.connector.respond(
        "Philadelphia",
        Ok(vec![
            raw("100 Market St", 1800.0),
            raw("200 Chestnut St", 2100.0),
            RawListing {
                address: Some("no rent".into()),
                ..Default::default()
            },
        ]),
    );
    h.connector.respond("Pittsburgh", Ok(vec![raw("5 Liberty Ave", 1200.0)]));

    let report = h.engine.dispatch_tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 2);
    assert_eq!(h.drain().await, 2);

    let listings = h.store.all_listings().await;
    assert_eq!(listings.len(), 3);
    assert!(listings.iter().all(|l| l.freshness_confidence == 100 && l.times_seen == 1));

    let jobs = h
        .store
        .list_jobs(&JobQuery {
            market_id: Some("philadelphia".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(jobs.total, 1);
    let job = &jobs.items[0];
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metrics.found, 3);
    assert_eq!(job.metrics.new, 2);
    assert_eq!(job.metrics.errors, 1);

    // Just scraped, so nothing is due on the next tick.
    let again = h.engine.dispatch_tick().await.unwrap();
    assert!(again.dispatched.is_empty());
    assert!(again.skipped.iter().all(|s| s.reason == SkipReason::NotDue));
}

#[tokio::test]
async fn consecutive_scrapes_refresh_the_same_listing() {
    let h = Harness::new(&[("Philadelphia", Tier::Hot)]).await;
    h.connector.respond("Philadelphia", Ok(vec![raw("100 Market St", 1800.0)]));

    h.engine.scrape("philadelphia", JobTrigger::Manual).await.unwrap();
    let second = h.engine.scrape("philadelphia", JobTrigger::Manual).await.unwrap();
    assert_eq!(second.metrics.updated, 1);

    let listings = h.store.all_listings().await;
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].times_seen, 2);
    assert_eq!(listings[0].freshness_confidence, 100);
}

#[tokio::test]
async fn decay_sends_stale_listings_for_verification() {
    let h = Harness::new(&[("Philadelphia", Tier::Hot)]).await;
    h.connector.respond(
        "Philadelphia",
        Ok(vec![raw("100 Market St", 1800.0), raw("200 Chestnut St", 2100.0)]),
    );
    h.engine.scrape("philadelphia", JobTrigger::Scheduled).await.unwrap();
    h.probe.answer("https://listings.test/200-chestnut-st", Ok(Verdict::Gone));

    let later = Utc::now() + ChronoDuration::hours(21);
    let report = h.engine.decay_tick_at(later).await.unwrap();
    assert_eq!(report.updated, 2);
    assert_eq!(report.verifications_dispatched, 2);
    assert_eq!(report.updated_by_tier.get("hot"), Some(&2));
    assert_eq!(h.drain().await, 2);

    let listings = h.store.all_listings().await;
    let live = listings.iter().find(|l| l.address == "100 Market St").unwrap();
    assert_eq!(live.verification_status, VerificationStatus::Verified);
    assert_eq!(live.freshness_confidence, 80);
    assert!(live.active);
    assert!(live.verified_at.is_some());

    let gone = listings.iter().find(|l| l.address == "200 Chestnut St").unwrap();
    assert_eq!(gone.verification_status, VerificationStatus::Gone);
    assert!(!gone.active);

    // A verified listing keeps decaying but is never deactivated or re-probed.
    let report = h
        .engine
        .decay_tick_at(Utc::now() + ChronoDuration::hours(60))
        .await
        .unwrap();
    assert_eq!(report.deactivated, 0);
    assert_eq!(report.verifications_dispatched, 0);
    h.engine.maintenance_sweep().await.unwrap();

    let live = h.store.all_listings().await.into_iter().find(|l| l.address == "100 Market St").unwrap();
    assert_eq!(live.freshness_confidence, 0);
    assert_eq!(live.verification_status, VerificationStatus::Verified);
    assert!(live.active);
}

#[tokio::test]
async fn failed_fetch_leaves_listing_pending_for_next_tick() {
    let h = Harness::new(&[("Philadelphia", Tier::Hot)]).await;
    h.connector.respond("Philadelphia", Ok(vec![raw("100 Market St", 1800.0)]));
    h.engine.scrape("philadelphia", JobTrigger::Scheduled).await.unwrap();
    h.probe.answer("https://listings.test/100-market-st", Err(ProbeError::Network("connection reset".into())));

    let later = Utc::now() + ChronoDuration::hours(21);
    h.engine.decay_tick_at(later).await.unwrap();
    h.drain().await;

    let listing = h.store.all_listings().await.remove(0);
    assert_eq!(listing.verification_status, VerificationStatus::Pending);
    assert!(listing.active);

    let outcome = h.engine.verify(listing.id).await.unwrap();
    assert!(matches!(outcome, VerificationOutcome::Inconclusive { .. }));

    let next = h.engine.decay_tick_at(later + ChronoDuration::hours(1)).await.unwrap();
    assert_eq!(next.verifications_dispatched, 1);
}

#[tokio::test]
async fn unverified_listing_runs_out_and_is_deactivated() {
    let h = Harness::new(&[("Pittsburgh", Tier::Standard)]).await;
    h.connector.respond("Pittsburgh", Ok(vec![raw("5 Liberty Ave", 1200.0)]));
    h.engine.scrape("pittsburgh", JobTrigger::Scheduled).await.unwrap();

    let report = h
        .engine
        .decay_tick_at(Utc::now() + ChronoDuration::hours(50))
        .await
        .unwrap();
    assert_eq!(report.deactivated, 1);
    assert_eq!(report.verifications_dispatched, 0);

    let listing = h.store.all_listings().await.remove(0);
    assert_eq!(listing.freshness_confidence, 0);
    assert!(!listing.active);
}

#[tokio::test]
async fn resighting_restores_a_decayed_listing() {
    let h = Harness::new(&[("Philadelphia", Tier::Hot)]).await;
    h.connector.respond("Philadelphia", Ok(vec![raw("100 Market St", 1800.0)]));
    h.engine.scrape("philadelphia", JobTrigger::Scheduled).await.unwrap();
    h.engine
        .decay_tick_at(Utc::now() + ChronoDuration::hours(40))
        .await
        .unwrap();
    let decayed = h.store.all_listings().await.remove(0);
    assert_eq!(decayed.freshness_confidence, 0);
    assert!(!decayed.active);

    h.engine.scrape("philadelphia", JobTrigger::Scheduled).await.unwrap();
    let restored = h.store.all_listings().await.remove(0);
    assert_eq!(restored.id, decayed.id);
    assert_eq!(restored.freshness_confidence, 100);
    assert_eq!(restored.verification_status, VerificationStatus::Unverified);
    assert_eq!(restored.times_seen, 2);
    assert!(restored.active);
}

#[tokio::test]
async fn failing_market_trips_circuit_until_maintenance() {
    let h = Harness::new(&[("Philadelphia", Tier::Hot), ("Pittsburgh", Tier::Hot)]).await;
    h.connector
        .respond("Philadelphia", Err(ConnectorError::Server("503 from upstream".into())));

    for _ in 0..3 {
        let report = h.engine.scrape("philadelphia", JobTrigger::Scheduled).await.unwrap();
        assert_eq!(report.status, ScrapeStatus::Failed);
    }
    let market = h.store.get_market("philadelphia").await.unwrap().unwrap();
    assert_eq!(market.consecutive_failures, 3);
    assert!(market.circuit_open());

    let far_future = Utc::now() + ChronoDuration::hours(12);
    let report = h.engine.dispatch_tick_at(far_future).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].market_id, "pittsburgh");
    assert!(report
        .skipped
        .iter()
        .any(|s| s.market_id == "philadelphia" && s.reason == SkipReason::CircuitOpen));
    h.queue.take();

    let sweep = h.engine.maintenance_sweep().await.unwrap();
    assert_eq!(sweep.circuits_reset, 1);

    let report = h.engine.dispatch_tick_at(far_future).await.unwrap();
    assert!(report.dispatched.iter().any(|d| d.market_id == "philadelphia"));
}

#[tokio::test]
async fn source_throttling_fails_job_without_penalty() {
    let h = Harness::new(&[("Philadelphia", Tier::Hot)]).await;
    h.connector
        .respond("Philadelphia", Err(ConnectorError::RateLimited("429".into())));

    let report = h.engine.scrape("philadelphia", JobTrigger::Scheduled).await.unwrap();
    assert_eq!(report.status, ScrapeStatus::RateLimited);
    assert_eq!(report.attempts, 4);

    let market = h.store.get_market("philadelphia").await.unwrap().unwrap();
    assert_eq!(market.consecutive_failures, 0);
    let job = h.store.get_job(report.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn running_market_is_not_dispatched_twice() {
    let h = Harness::new(&[("Philadelphia", Tier::Hot)]).await;
    let stuck = scout_core::ScrapeJob::start("philadelphia", "apartments_com", JobTrigger::Scheduled, Utc::now());
    h.store.start_job(&stuck).await.unwrap();

    let report = h.engine.dispatch_tick().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.skipped[0].reason, SkipReason::AlreadyRunning);

    // The sweep fails the stuck job once it is older than the staleness window.
    let sweep = h
        .engine
        .maintenance_sweep_at(Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(sweep.stale_jobs_failed, 1);
    let report = h
        .engine
        .dispatch_tick_at(Utc::now() + ChronoDuration::hours(7))
        .await
        .unwrap();
    assert_eq!(report.dispatched.len(), 1);
}
