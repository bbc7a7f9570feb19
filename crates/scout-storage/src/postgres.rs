use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{
    JobMetrics, Listing, Market, MarketLocator, MarketUpdate, Resighting, ScrapeJob,
    ScrapeOutcome, Tier, Verdict, FRESH_CONFIDENCE, VERIFIED_CONFIDENCE,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{
    page_bounds, DecayCandidate, DecayUpdate, IndexEntry, JobLedger, JobQuery, ListingQuery,
    ListingStore, MarketRegistry, Page, RateLimitBudget, RatePeriod, StoreError,
};

const MARKET_COLUMNS: &str = "id, display_name, city, state, tier, enabled, max_items_per_scrape, \
     scrape_interval_hours, decay_rate_per_hour, last_scrape_at, last_scrape_status, \
     consecutive_failures, created_at";

const JOB_COLUMNS: &str = "id, market_id, source_id, trigger, status, started_at, completed_at, \
     items_found, items_new, items_updated, items_duplicate, items_error, error_message";

/// Postgres-backed implementation of every storage trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_u8(value: i16) -> u8 {
    u8::try_from(value.clamp(0, i16::from(u8::MAX))).unwrap_or(0)
}

fn parse_column<T: std::str::FromStr>(value: &str, column: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("{column} = {value:?}")))
}

fn market_from_row(row: &PgRow) -> Result<Market, StoreError> {
    let tier: String = row.try_get("tier")?;
    let last_scrape_status: Option<String> = row.try_get("last_scrape_status")?;
    let decay_rate: Option<i32> = row.try_get("decay_rate_per_hour")?;
    Ok(Market {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        locator: MarketLocator::new(
            row.try_get::<String, _>("city")?,
            row.try_get::<String, _>("state")?,
        ),
        tier: parse_column(&tier, "tier")?,
        enabled: row.try_get("enabled")?,
        max_items_per_scrape: to_u32(row.try_get("max_items_per_scrape")?),
        scrape_interval_hours: to_u32(row.try_get("scrape_interval_hours")?),
        decay_rate_per_hour: decay_rate.map(to_u32),
        last_scrape_at: row.try_get("last_scrape_at")?,
        last_scrape_status: last_scrape_status
            .as_deref()
            .map(|s| parse_column(s, "last_scrape_status"))
            .transpose()?,
        consecutive_failures: to_u32(row.try_get("consecutive_failures")?),
        created_at: row.try_get("created_at")?,
    })
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let status: String = row.try_get("verification_status")?;
    Ok(Listing {
        id: row.try_get("id")?,
        market_id: row.try_get("market_id")?,
        fingerprint: row.try_get("fingerprint")?,
        source_url: row.try_get("source_url")?,
        address: row.try_get("address")?,
        rent: row.try_get("rent")?,
        bedrooms: row.try_get("bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        sqft: row.try_get("sqft")?,
        description: row.try_get("description")?,
        images: row.try_get("images")?,
        quality_score: to_u8(row.try_get("quality_score")?),
        freshness_confidence: to_u8(row.try_get("freshness_confidence")?),
        confidence_updated_at: row.try_get("confidence_updated_at")?,
        verification_status: parse_column(&status, "verification_status")?,
        verified_at: row.try_get("verified_at")?,
        times_seen: to_u32(row.try_get("times_seen")?),
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        active: row.try_get("active")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ScrapeJob, StoreError> {
    let trigger: String = row.try_get("trigger")?;
    let status: String = row.try_get("status")?;
    Ok(ScrapeJob {
        id: row.try_get("id")?,
        market_id: row.try_get("market_id")?,
        source_id: row.try_get("source_id")?,
        trigger: parse_column(&trigger, "trigger")?,
        status: parse_column(&status, "status")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        metrics: JobMetrics {
            found: to_u32(row.try_get("items_found")?),
            new: to_u32(row.try_get("items_new")?),
            updated: to_u32(row.try_get("items_updated")?),
            duplicates: to_u32(row.try_get("items_duplicate")?),
            errors: to_u32(row.try_get("items_error")?),
        },
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl MarketRegistry for PgStore {
    async fn list_enabled(&self) -> Result<Vec<Market>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MARKET_COLUMNS} FROM markets WHERE enabled ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(market_from_row).collect()
    }

    async fn list_markets(&self) -> Result<Vec<Market>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {MARKET_COLUMNS} FROM markets ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(market_from_row).collect()
    }

    async fn get_market(&self, id: &str) -> Result<Option<Market>, StoreError> {
        let row = sqlx::query(&format!("SELECT {MARKET_COLUMNS} FROM markets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(market_from_row).transpose()
    }

    async fn create_market(&self, market: Market) -> Result<Market, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO markets (id, display_name, city, state, tier, enabled, max_items_per_scrape,
                                 scrape_interval_hours, decay_rate_per_hour, consecutive_failures, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&market.id)
        .bind(&market.display_name)
        .bind(&market.locator.city)
        .bind(&market.locator.state)
        .bind(market.tier.as_str())
        .bind(market.enabled)
        .bind(to_i32(market.max_items_per_scrape))
        .bind(to_i32(market.scrape_interval_hours))
        .bind(market.decay_rate_per_hour.map(to_i32))
        .bind(to_i32(market.consecutive_failures))
        .bind(market.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("market {}", market.id)));
        }
        Ok(market)
    }

    async fn update_config(
        &self,
        id: &str,
        update: &MarketUpdate,
    ) -> Result<Option<Market>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {MARKET_COLUMNS} FROM markets WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut market = market_from_row(&row)?;
        update.apply(&mut market);

        sqlx::query(
            r#"
            UPDATE markets
            SET display_name = $2, city = $3, state = $4, tier = $5, enabled = $6,
                max_items_per_scrape = $7, scrape_interval_hours = $8, decay_rate_per_hour = $9
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&market.display_name)
        .bind(&market.locator.city)
        .bind(&market.locator.state)
        .bind(market.tier.as_str())
        .bind(market.enabled)
        .bind(to_i32(market.max_items_per_scrape))
        .bind(to_i32(market.scrape_interval_hours))
        .bind(market.decay_rate_per_hour.map(to_i32))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(market))
    }

    async fn record_outcome(&self, id: &str, outcome: ScrapeOutcome) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE markets
            SET last_scrape_at = $2,
                last_scrape_status = $3,
                consecutive_failures = CASE WHEN $4 THEN 0 ELSE consecutive_failures + 1 END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(outcome.at)
        .bind(outcome.status.as_str())
        .bind(outcome.succeeded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_failures(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE markets SET consecutive_failures = 0 WHERE consecutive_failures > 0",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobLedger for PgStore {
    async fn start_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_jobs (id, market_id, source_id, trigger, status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id)
        .bind(&job.market_id)
        .bind(&job.source_id)
        .bind(job.trigger.as_str())
        .bind(job.status.as_str())
        .bind(job.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET status = $2, completed_at = $3, items_found = $4, items_new = $5,
                items_updated = $6, items_duplicate = $7, items_error = $8, error_message = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.completed_at)
        .bind(to_i32(job.metrics.found))
        .bind(to_i32(job.metrics.new))
        .bind(to_i32(job.metrics.updated))
        .bind(to_i32(job.metrics.duplicates))
        .bind(to_i32(job.metrics.errors))
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn running_market_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT market_id FROM scrape_jobs WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("market_id").map_err(StoreError::from))
            .collect()
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Page<ScrapeJob>, StoreError> {
        let (limit, offset) = page_bounds(query.page, query.per_page);
        let filter = "($1::text IS NULL OR market_id = $1) AND ($2::text IS NULL OR status = $2)";
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM scrape_jobs WHERE {filter}"))
            .bind(&query.market_id)
            .bind(status)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE {filter} \
             ORDER BY started_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(&query.market_id)
        .bind(status)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(job_from_row).collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or(0),
            page: query.page.max(1),
            per_page: limit,
        })
    }

    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "UPDATE scrape_jobs \
             SET status = 'failed', completed_at = $2, error_message = 'stuck in running state' \
             WHERE status = 'running' AND started_at < $1 \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(cutoff)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl ListingStore for PgStore {
    async fn market_index(&self, market_id: &str) -> Result<Vec<IndexEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, fingerprint, address, rent, bedrooms FROM listings WHERE market_id = $1",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<IndexEntry, StoreError> {
                Ok(IndexEntry {
                    listing_id: row.try_get("id")?,
                    fingerprint: row.try_get("fingerprint")?,
                    address: row.try_get("address")?,
                    rent: row.try_get("rent")?,
                    bedrooms: row.try_get("bedrooms")?,
                })
            })
            .collect()
    }

    async fn insert_listings(&self, listings: &[Listing]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for listing in listings {
            sqlx::query(
                r#"
                INSERT INTO listings (id, market_id, fingerprint, source_url, address, rent, bedrooms,
                                      bathrooms, sqft, description, images, quality_score,
                                      freshness_confidence, confidence_updated_at, verification_status,
                                      verified_at, times_seen, first_seen_at, last_seen_at, active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
                "#,
            )
            .bind(listing.id)
            .bind(&listing.market_id)
            .bind(&listing.fingerprint)
            .bind(&listing.source_url)
            .bind(&listing.address)
            .bind(listing.rent)
            .bind(listing.bedrooms)
            .bind(listing.bathrooms)
            .bind(listing.sqft)
            .bind(&listing.description)
            .bind(&listing.images)
            .bind(i16::from(listing.quality_score))
            .bind(i16::from(listing.freshness_confidence))
            .bind(listing.confidence_updated_at)
            .bind(listing.verification_status.as_str())
            .bind(listing.verified_at)
            .bind(to_i32(listing.times_seen))
            .bind(listing.first_seen_at)
            .bind(listing.last_seen_at)
            .bind(listing.active)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn apply_resightings(
        &self,
        resightings: &[Resighting],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut applied = 0;
        for resighting in resightings {
            let fresh = &resighting.fresh;
            let result = sqlx::query(
                r#"
                UPDATE listings
                SET freshness_confidence = $2,
                    confidence_updated_at = $3,
                    last_seen_at = $3,
                    times_seen = times_seen + 1,
                    active = TRUE,
                    verification_status = 'none',
                    verified_at = NULL,
                    description = CASE
                        WHEN length(coalesce($4::text, '')) > length(coalesce(description, '')) THEN $4::text
                        ELSE description END,
                    images = CASE
                        WHEN cardinality($5::text[]) > cardinality(images) THEN $5::text[]
                        ELSE images END,
                    source_url = coalesce(source_url, $6),
                    sqft = coalesce(sqft, $7),
                    quality_score = GREATEST(quality_score, $8::smallint)
                WHERE id = $1
                "#,
            )
            .bind(resighting.listing_id)
            .bind(i16::from(FRESH_CONFIDENCE))
            .bind(at)
            .bind(&fresh.description)
            .bind(&fresh.images)
            .bind(&fresh.source_url)
            .bind(fresh.sqft)
            .bind(i16::from(fresh.quality_score))
            .execute(&mut *tx)
            .await?;
            applied += result.rows_affected();
        }
        tx.commit().await?;
        Ok(applied)
    }

    async fn decay_candidates(&self) -> Result<Vec<DecayCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT l.*, m.tier AS market_tier, m.decay_rate_per_hour AS market_decay_rate
            FROM listings l
            LEFT JOIN markets m ON m.id = l.market_id
            WHERE l.active
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DecayCandidate, StoreError> {
                let tier: Option<String> = row.try_get("market_tier")?;
                let tier = match tier {
                    Some(value) => parse_column::<Tier>(&value, "tier")?,
                    None => Tier::Cool,
                };
                let override_rate: Option<i32> = row.try_get("market_decay_rate")?;
                Ok(DecayCandidate {
                    listing: listing_from_row(row)?,
                    tier,
                    decay_rate: override_rate
                        .map(to_u32)
                        .unwrap_or_else(|| tier.default_decay_rate()),
                })
            })
            .collect()
    }

    async fn save_decay(&self, updates: &[DecayUpdate]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for update in updates {
            sqlx::query(
                r#"
                UPDATE listings
                SET freshness_confidence = $2, confidence_updated_at = $3,
                    verification_status = $4, active = $5
                WHERE id = $1 AND last_seen_at = $6 AND verification_status = $7
                "#,
            )
            .bind(update.listing_id)
            .bind(i16::from(update.confidence))
            .bind(update.at)
            .bind(update.verification_status.as_str())
            .bind(update.active)
            .bind(update.seen_at)
            .bind(update.previous_status.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn search_listings(&self, query: &ListingQuery) -> Result<Page<Listing>, StoreError> {
        let (limit, offset) = page_bounds(query.page, query.per_page);
        let filter = "($1::text IS NULL OR market_id = $1) \
             AND ($2::smallint IS NULL OR freshness_confidence >= $2) \
             AND ($3::boolean IS NULL OR active = $3)";
        let min_confidence = query.min_confidence.map(i16::from);

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM listings WHERE {filter}"))
            .bind(&query.market_id)
            .bind(min_confidence)
            .bind(query.active)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM listings WHERE {filter} \
             ORDER BY freshness_confidence DESC, last_seen_at DESC LIMIT $4 OFFSET $5"
        ))
        .bind(&query.market_id)
        .bind(min_confidence)
        .bind(query.active)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(listing_from_row).collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or(0),
            page: query.page.max(1),
            per_page: limit,
        })
    }

    async fn record_verdict(
        &self,
        id: Uuid,
        verdict: Verdict,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = match verdict {
            Verdict::Verified => {
                sqlx::query(
                    r#"
                    UPDATE listings
                    SET verification_status = 'verified', freshness_confidence = $3,
                        confidence_updated_at = $2, verified_at = $2, active = TRUE
                    WHERE id = $1 AND verification_status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(at)
                .bind(i16::from(VERIFIED_CONFIDENCE))
                .execute(&self.pool)
                .await?
            }
            Verdict::Gone => {
                sqlx::query(
                    r#"
                    UPDATE listings
                    SET verification_status = 'gone', verified_at = $2, active = FALSE
                    WHERE id = $1 AND verification_status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(at)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_exhausted(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE listings SET active = FALSE
            WHERE active AND freshness_confidence = 0 AND verification_status <> 'verified'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RateLimitBudget for PgStore {
    async fn try_acquire(&self, source_id: &str) -> Result<bool, StoreError> {
        let granted = sqlx::query(
            r#"
            UPDATE data_sources
            SET current_hour_calls = current_hour_calls + 1,
                current_day_calls = current_day_calls + 1
            WHERE id = $1
              AND enabled
              AND current_hour_calls < rate_limit_per_hour
              AND current_day_calls < rate_limit_per_day
            RETURNING id
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        if granted.is_some() {
            return Ok(true);
        }

        let known = sqlx::query("SELECT 1 FROM data_sources WHERE id = $1")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(known.is_none())
    }

    async fn reset(&self, period: RatePeriod) -> Result<u64, StoreError> {
        let sql = match period {
            RatePeriod::Hour => "UPDATE data_sources SET current_hour_calls = 0",
            RatePeriod::Day => {
                "UPDATE data_sources SET current_hour_calls = 0, current_day_calls = 0"
            }
        };
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
