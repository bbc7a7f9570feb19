//! Periodic dispatch: pick the markets that are due and enqueue staggered scrapes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use scout_core::{JobTrigger, Market};
use scout_storage::{JobLedger, MarketRegistry};
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};

use crate::pool::{TaskQueue, WorkItem};
use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    #[serde(rename = "circuit_breaker")]
    CircuitOpen,
    NotDue,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedMarket {
    pub market_id: String,
    pub delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMarket {
    pub market_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub dispatched: Vec<DispatchedMarket>,
    pub skipped: Vec<SkippedMarket>,
}

/// Circuit first, then cadence, then single-flight.
pub fn evaluate(market: &Market, now: DateTime<Utc>, running: &HashSet<String>) -> Option<SkipReason> {
    if market.circuit_open() {
        Some(SkipReason::CircuitOpen)
    } else if !market.is_due(now) {
        Some(SkipReason::NotDue)
    } else if running.contains(&market.id) {
        Some(SkipReason::AlreadyRunning)
    } else {
        None
    }
}

/// Reads the registry and enqueues due, eligible scrapes. Mutates nothing else.
pub struct Dispatcher {
    markets: Arc<dyn MarketRegistry>,
    jobs: Arc<dyn JobLedger>,
    queue: Arc<dyn TaskQueue>,
    max_stagger: Duration,
}

impl Dispatcher {
    pub fn new(
        markets: Arc<dyn MarketRegistry>,
        jobs: Arc<dyn JobLedger>,
        queue: Arc<dyn TaskQueue>,
        max_stagger: Duration,
    ) -> Self {
        Self {
            markets,
            jobs,
            queue,
            max_stagger,
        }
    }

    fn stagger(&self) -> Duration {
        let max_ms = u64::try_from(self.max_stagger.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<DispatchReport, EngineError> {
        let span = info_span!("dispatch_tick", %now);
        async move {
            let markets = self.markets.list_enabled().await?;
            let running = self.jobs.running_market_ids().await?;
            let mut report = DispatchReport::default();

            for market in markets {
                if let Some(reason) = evaluate(&market, now, &running) {
                    debug!(market_id = %market.id, ?reason, "skipping market");
                    report.skipped.push(SkippedMarket {
                        market_id: market.id,
                        reason,
                    });
                    continue;
                }

                let delay = self.stagger();
                self.queue.enqueue(WorkItem::Scrape {
                    market_id: market.id.clone(),
                    trigger: JobTrigger::Scheduled,
                    delay,
                })?;
                report.dispatched.push(DispatchedMarket {
                    market_id: market.id,
                    delay_secs: delay.as_secs(),
                });
            }

            info!(
                dispatched = report.dispatched.len(),
                skipped = report.skipped.len(),
                "dispatch tick finished"
            );
            Ok::<_, EngineError>(report)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use scout_core::{NewMarket, Tier};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).single().unwrap()
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

    #[test]
    fn never_scraped_market_is_eligible() {
        assert_eq!(evaluate(&market("a"), now(), &HashSet::new()), None);
    }

    #[test]
    fn open_circuit_wins_even_when_due() {
        let mut m = market("a");
        m.consecutive_failures = 3;
        m.last_scrape_at = Some(now() - ChronoDuration::hours(48));
        assert_eq!(evaluate(&m, now(), &HashSet::new()), Some(SkipReason::CircuitOpen));
    }

    #[test]
    fn not_due_and_already_running_are_skipped() {
        let mut recent = market("a");
        recent.last_scrape_at = Some(now() - ChronoDuration::hours(2));
        assert_eq!(evaluate(&recent, now(), &HashSet::new()), Some(SkipReason::NotDue));

        let running: HashSet<String> = ["b".to_string()].into_iter().collect();
        assert_eq!(evaluate(&market("b"), now(), &running), Some(SkipReason::AlreadyRunning));
    }

    #[test]
    fn skip_reasons_serialize_with_stable_names() {
        assert_eq!(
            serde_json::to_string(&SkipReason::CircuitOpen).unwrap(),
            "\"circuit_breaker\""
        );
        assert_eq!(serde_json::to_string(&SkipReason::NotDue).unwrap(), "\"not_due\"");
    }
}
