//! Confidence decay and the verification state machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use scout_connectors::ListingProbe;
use scout_core::{
    decayed_confidence, hours_between, Listing, VerificationStatus, Verdict, FRESH_CONFIDENCE,
    VERIFICATION_THRESHOLD,
};
use scout_storage::{DecayCandidate, DecayUpdate, ListingStore, StoreError};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pool::{TaskQueue, WorkItem};
use crate::EngineError;

/// What one decay tick decides for one listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub confidence: u8,
    pub verification_status: VerificationStatus,
    pub active: bool,
    pub dispatch_verification: bool,
}

/// Confidence always decays from the last sighting. Only unverified listings go pending,
/// and a verified listing stays active even at zero.
pub fn assess(listing: &Listing, decay_rate: u32, now: DateTime<Utc>) -> Assessment {
    let confidence = decayed_confidence(
        FRESH_CONFIDENCE,
        hours_between(listing.last_seen_at, now),
        decay_rate,
    );

    let mut status = listing.verification_status;
    if confidence < VERIFICATION_THRESHOLD && status == VerificationStatus::Unverified {
        status = VerificationStatus::Pending;
    }

    let active = !(confidence == 0 && status != VerificationStatus::Verified);
    Assessment {
        confidence,
        verification_status: status,
        active,
        dispatch_verification: active && status == VerificationStatus::Pending,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecayReport {
    pub scanned: usize,
    pub updated: usize,
    pub verifications_dispatched: usize,
    pub deactivated: usize,
    /// Listings whose confidence changed, keyed by market tier.
    pub updated_by_tier: BTreeMap<String, usize>,
}

pub struct DecayTick {
    listings: Arc<dyn ListingStore>,
    queue: Arc<dyn TaskQueue>,
}

impl DecayTick {
    pub fn new(listings: Arc<dyn ListingStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { listings, queue }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<DecayReport, EngineError> {
        let span = info_span!("decay_tick", %now);
        async move {
            let candidates = self.listings.decay_candidates().await?;
            let mut report = DecayReport {
                scanned: candidates.len(),
                ..Default::default()
            };
            let mut updates = Vec::new();
            let mut verify = Vec::new();

            for DecayCandidate {
                listing,
                tier,
                decay_rate,
            } in &candidates
            {
                let next = assess(listing, *decay_rate, now);
                if next.dispatch_verification {
                    verify.push(listing.id);
                }
                let changed = next.confidence != listing.freshness_confidence
                    || next.verification_status != listing.verification_status
                    || next.active != listing.active;
                if !changed {
                    continue;
                }
                if next.confidence != listing.freshness_confidence {
                    *report
                        .updated_by_tier
                        .entry(tier.as_str().to_string())
                        .or_default() += 1;
                }
                if !next.active {
                    report.deactivated += 1;
                }
                updates.push(DecayUpdate {
                    listing_id: listing.id,
                    confidence: next.confidence,
                    verification_status: next.verification_status,
                    active: next.active,
                    at: now,
                    seen_at: listing.last_seen_at,
                    previous_status: listing.verification_status,
                });
            }

            report.updated = updates.len();
            self.listings.save_decay(&updates).await?;

            for listing_id in verify {
                self.queue.enqueue(WorkItem::Verify { listing_id })?;
                report.verifications_dispatched += 1;
            }

            info!(
                scanned = report.scanned,
                updated = report.updated,
                deactivated = report.deactivated,
                verifications = report.verifications_dispatched,
                "decay tick finished"
            );
            Ok::<_, EngineError>(report)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Recorded { verdict: Verdict },
    /// The listing moved on (re-sighted or already decided) while the probe ran.
    Superseded { verdict: Verdict },
    Inconclusive { reason: String },
    Skipped { reason: String },
}

pub struct ListingVerifier {
    listings: Arc<dyn ListingStore>,
    probe: Arc<dyn ListingProbe>,
}

impl ListingVerifier {
    pub fn new(listings: Arc<dyn ListingStore>, probe: Arc<dyn ListingProbe>) -> Self {
        Self { listings, probe }
    }

    /// Probe failures leave the listing pending; the next decay tick re-dispatches it.
    pub async fn verify(
        &self,
        listing_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<VerificationOutcome, StoreError> {
        let Some(listing) = self.listings.get_listing(listing_id).await? else {
            return Ok(VerificationOutcome::Skipped {
                reason: "listing not found".to_string(),
            });
        };
        if listing.verification_status != VerificationStatus::Pending {
            return Ok(VerificationOutcome::Skipped {
                reason: format!("status is {}", listing.verification_status),
            });
        }
        let Some(url) = listing.source_url.as_deref() else {
            return Ok(VerificationOutcome::Skipped {
                reason: "listing has no source url".to_string(),
            });
        };

        let span = info_span!("verify", %listing_id, url);
        async move {
            match self.probe.probe(url).await {
                Ok(verdict) => {
                    let applied = self.listings.record_verdict(listing_id, verdict, now).await?;
                    info!(?verdict, applied, "verification finished");
                    Ok::<_, StoreError>(if applied {
                        VerificationOutcome::Recorded { verdict }
                    } else {
                        VerificationOutcome::Superseded { verdict }
                    })
                }
                Err(err) => {
                    warn!(error = %err, "verification fetch failed; listing stays pending");
                    Ok(VerificationOutcome::Inconclusive {
                        reason: err.to_string(),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }
}
