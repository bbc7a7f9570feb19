//! Core domain model for Scout: markets, listings, scrape jobs and freshness arithmetic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-core";

/// Confidence assigned on every first sighting and re-sighting.
pub const FRESH_CONFIDENCE: u8 = 100;
/// Confidence assigned by a successful verification; weaker evidence than a re-scrape.
pub const VERIFIED_CONFIDENCE: u8 = 80;
/// Listings below this confidence are sent for active verification.
pub const VERIFICATION_THRESHOLD: u8 = 40;
/// Consecutive failures at which a market's circuit is considered open.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
/// Longest cadence a market may be configured with: one year.
pub const MAX_SCRAPE_INTERVAL_HOURS: u32 = 8760;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Market tier; fixes the default scrape cadence and decay rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Standard,
    Cool,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Standard, Tier::Cool];

    pub fn default_interval_hours(self) -> u32 {
        match self {
            Tier::Hot => 6,
            Tier::Standard => 12,
            Tier::Cool => 24,
        }
    }

    /// Confidence points lost per hour since the last sighting.
    pub fn default_decay_rate(self) -> u32 {
        match self {
            Tier::Hot => 3,
            Tier::Standard => 2,
            Tier::Cool => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Standard => "standard",
            Tier::Cool => "cool",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hot" => Ok(Tier::Hot),
            "standard" => Ok(Tier::Standard),
            "cool" => Ok(Tier::Cool),
            _ => Err(ParseEnumError::new("tier", s)),
        }
    }
}

/// Where a market's listings are scraped from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketLocator {
    pub city: String,
    pub state: String,
}

impl MarketLocator {
    pub fn new(city: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            state: state.into(),
        }
    }

    /// Stable filesystem/URL friendly key, e.g. `bryn-mawr-pa`.
    pub fn slug(&self) -> String {
        format!("{} {}", self.city, self.state)
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Display for MarketLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.city, self.state)
    }
}

/// Outcome status recorded on a market after a scrape attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Completed,
    Failed,
    RateLimited,
}

impl ScrapeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrapeStatus::Completed => "completed",
            ScrapeStatus::Failed => "failed",
            ScrapeStatus::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(ScrapeStatus::Completed),
            "failed" => Ok(ScrapeStatus::Failed),
            "rate_limited" => Ok(ScrapeStatus::RateLimited),
            _ => Err(ParseEnumError::new("scrape status", s)),
        }
    }
}

/// A configured scraping target with its own cadence, tier and circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub display_name: String,
    pub locator: MarketLocator,
    pub tier: Tier,
    pub enabled: bool,
    pub max_items_per_scrape: u32,
    pub scrape_interval_hours: u32,
    /// Per-market override of the tier decay rate.
    pub decay_rate_per_hour: Option<u32>,
    pub last_scrape_at: Option<DateTime<Utc>>,
    pub last_scrape_status: Option<ScrapeStatus>,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
}

impl Market {
    pub fn decay_rate(&self) -> u32 {
        self.decay_rate_per_hour
            .unwrap_or_else(|| self.tier.default_decay_rate())
    }

    pub fn circuit_open(&self) -> bool {
        self.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD
    }

    /// `None` when the market has never been scraped, or when the cadence runs
    /// past the end of the calendar.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.last_scrape_at.and_then(|at| {
            at.checked_add_signed(Duration::hours(i64::from(self.scrape_interval_hours)))
        })
    }

    /// Never-scraped markets are always due; a cadence that overflows never comes due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match (self.last_scrape_at, self.next_due_at()) {
            (None, _) => true,
            (Some(_), Some(due)) => now >= due,
            (Some(_), None) => false,
        }
    }

    pub fn apply_outcome(&mut self, outcome: &ScrapeOutcome) {
        self.last_scrape_at = Some(outcome.at);
        self.last_scrape_status = Some(outcome.status);
        if outcome.succeeded {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }
}

/// Onboarding payload for a market; unset fields fall back to tier defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMarket {
    pub id: String,
    pub display_name: String,
    pub city: String,
    pub state: String,
    pub tier: Tier,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_items_per_scrape: Option<u32>,
    #[serde(default)]
    pub scrape_interval_hours: Option<u32>,
    #[serde(default)]
    pub decay_rate_per_hour: Option<u32>,
}

impl NewMarket {
    pub const DEFAULT_MAX_ITEMS: u32 = 100;

    pub fn into_market(self, now: DateTime<Utc>) -> Market {
        Market {
            scrape_interval_hours: self
                .scrape_interval_hours
                .unwrap_or_else(|| self.tier.default_interval_hours()),
            locator: MarketLocator::new(self.city, self.state),
            id: self.id,
            display_name: self.display_name,
            tier: self.tier,
            enabled: self.enabled.unwrap_or(true),
            max_items_per_scrape: self.max_items_per_scrape.unwrap_or(Self::DEFAULT_MAX_ITEMS),
            decay_rate_per_hour: self.decay_rate_per_hour,
            last_scrape_at: None,
            last_scrape_status: None,
            consecutive_failures: 0,
            created_at: now,
        }
    }
}

/// Partial admin update of a market's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_items_per_scrape: Option<u32>,
    #[serde(default)]
    pub scrape_interval_hours: Option<u32>,
    #[serde(default)]
    pub decay_rate_per_hour: Option<u32>,
}

impl MarketUpdate {
    pub fn is_empty(&self) -> bool {
        self == &MarketUpdate::default()
    }

    /// A tier change without an explicit interval moves the market onto the new tier's cadence.
    pub fn apply(&self, market: &mut Market) {
        if let Some(name) = &self.display_name {
            market.display_name = name.clone();
        }
        if let Some(city) = &self.city {
            market.locator.city = city.clone();
        }
        if let Some(state) = &self.state {
            market.locator.state = state.clone();
        }
        if let Some(tier) = self.tier {
            if tier != market.tier && self.scrape_interval_hours.is_none() {
                market.scrape_interval_hours = tier.default_interval_hours();
            }
            market.tier = tier;
        }
        if let Some(enabled) = self.enabled {
            market.enabled = enabled;
        }
        if let Some(max_items) = self.max_items_per_scrape {
            market.max_items_per_scrape = max_items;
        }
        if let Some(hours) = self.scrape_interval_hours {
            market.scrape_interval_hours = hours;
        }
        if let Some(rate) = self.decay_rate_per_hour {
            market.decay_rate_per_hour = Some(rate);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub status: ScrapeStatus,
    pub succeeded: bool,
    pub at: DateTime<Utc>,
}

impl ScrapeOutcome {
    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            status: ScrapeStatus::Completed,
            succeeded: true,
            at,
        }
    }

    pub fn failed(at: DateTime<Utc>) -> Self {
        Self {
            status: ScrapeStatus::Failed,
            succeeded: false,
            at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    #[serde(rename = "none")]
    Unverified,
    Pending,
    Verified,
    Gone,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "none",
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Gone => "gone",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(VerificationStatus::Unverified),
            "pending" => Ok(VerificationStatus::Pending),
            "verified" => Ok(VerificationStatus::Verified),
            "gone" => Ok(VerificationStatus::Gone),
            _ => Err(ParseEnumError::new("verification status", s)),
        }
    }
}

/// Result of an active verification fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    Gone,
}

/// Listing as returned by a scraper connector, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub rent: Option<f64>,
    #[serde(default)]
    pub bedrooms: Option<f64>,
    #[serde(default)]
    pub bathrooms: Option<f64>,
    #[serde(default)]
    pub sqft: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Validated listing fields plus the normalizer's 0-100 quality score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub source_url: Option<String>,
    pub address: String,
    pub city: Option<String>,
    pub state: Option<String>,
    /// Whole currency units per month.
    pub rent: i64,
    pub bedrooms: i32,
    pub bathrooms: f64,
    pub sqft: Option<i32>,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub quality_score: u8,
}

/// A persisted listing with its freshness bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub market_id: String,
    pub fingerprint: String,
    pub source_url: Option<String>,
    pub address: String,
    pub rent: i64,
    pub bedrooms: i32,
    pub bathrooms: f64,
    pub sqft: Option<i32>,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub quality_score: u8,
    pub freshness_confidence: u8,
    pub confidence_updated_at: Option<DateTime<Utc>>,
    pub verification_status: VerificationStatus,
    pub verified_at: Option<DateTime<Utc>>,
    pub times_seen: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
}

impl Listing {
    pub fn first_sighting(
        market_id: &str,
        fingerprint: String,
        fresh: NormalizedListing,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            market_id: market_id.to_string(),
            fingerprint,
            source_url: fresh.source_url,
            address: fresh.address,
            rent: fresh.rent,
            bedrooms: fresh.bedrooms,
            bathrooms: fresh.bathrooms,
            sqft: fresh.sqft,
            description: fresh.description,
            images: fresh.images,
            quality_score: fresh.quality_score,
            freshness_confidence: FRESH_CONFIDENCE,
            confidence_updated_at: Some(now),
            verification_status: VerificationStatus::Unverified,
            verified_at: None,
            times_seen: 1,
            first_seen_at: now,
            last_seen_at: now,
            active: true,
        }
    }

    /// Re-sighting resets freshness, reactivates the listing and absorbs richer fields.
    pub fn record_resighting(&mut self, fresh: &NormalizedListing, now: DateTime<Utc>) {
        self.freshness_confidence = FRESH_CONFIDENCE;
        self.confidence_updated_at = Some(now);
        self.last_seen_at = now;
        self.times_seen = self.times_seen.saturating_add(1);
        self.active = true;
        self.verification_status = VerificationStatus::Unverified;
        self.verified_at = None;

        let current_len = self.description.as_deref().map_or(0, str::len);
        if let Some(description) = &fresh.description {
            if description.len() > current_len {
                self.description = Some(description.clone());
            }
        }
        if fresh.images.len() > self.images.len() {
            self.images = fresh.images.clone();
        }
        if self.source_url.is_none() {
            self.source_url = fresh.source_url.clone();
        }
        if self.sqft.is_none() {
            self.sqft = fresh.sqft;
        }
        self.quality_score = self.quality_score.max(fresh.quality_score);
    }

    pub fn apply_verdict(&mut self, verdict: Verdict, now: DateTime<Utc>) {
        self.verified_at = Some(now);
        match verdict {
            Verdict::Verified => {
                self.verification_status = VerificationStatus::Verified;
                self.freshness_confidence = VERIFIED_CONFIDENCE;
                self.confidence_updated_at = Some(now);
                self.active = true;
            }
            Verdict::Gone => {
                self.verification_status = VerificationStatus::Gone;
                self.active = false;
            }
        }
    }

    /// Zero confidence without a standing verification means the listing is dead.
    pub fn is_exhausted(&self) -> bool {
        self.freshness_confidence == 0 && self.verification_status != VerificationStatus::Verified
    }
}

/// A listing from the current batch matched against an existing stored listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resighting {
    pub listing_id: Uuid,
    pub fresh: NormalizedListing,
}

/// `max(0, base - hours_elapsed * rate)`, truncated to whole points.
pub fn decayed_confidence(base: u8, hours_elapsed: f64, rate_per_hour: u32) -> u8 {
    let hours = hours_elapsed.max(0.0);
    let value = f64::from(base) - hours * f64::from(rate_per_hour);
    value.trunc().clamp(0.0, f64::from(FRESH_CONFIDENCE)) as u8
}

pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(ParseEnumError::new("job status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled,
    Manual,
}

impl JobTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            JobTrigger::Scheduled => "scheduled",
            JobTrigger::Manual => "manual",
        }
    }
}

impl FromStr for JobTrigger {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobTrigger::Scheduled),
            "manual" => Ok(JobTrigger::Manual),
            _ => Err(ParseEnumError::new("job trigger", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub found: u32,
    pub new: u32,
    pub updated: u32,
    pub duplicates: u32,
    pub errors: u32,
}

/// Ledger record of one scrape attempt for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub market_id: String,
    pub source_id: String,
    pub trigger: JobTrigger,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metrics: JobMetrics,
    pub error_message: Option<String>,
}

impl ScrapeJob {
    pub fn start(market_id: &str, source_id: &str, trigger: JobTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            market_id: market_id.to_string(),
            source_id: source_id.to_string(),
            trigger,
            status: JobStatus::Running,
            started_at: now,
            completed_at: None,
            metrics: JobMetrics::default(),
            error_message: None,
        }
    }

    pub fn duration_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.completed_at.unwrap_or(now) - self.started_at).num_seconds()
    }
}
