//! Matching a scraped batch against stored listings: exact fingerprints, fuzzy
//! address matches and duplicates within the batch.

use std::collections::{HashMap, HashSet};

use scout_core::{NormalizedListing, Resighting};
use scout_storage::IndexEntry;
use serde::Serialize;
use sha2::{Digest, Sha256};
use strsim::normalized_levenshtein;
use uuid::Uuid;

/// Rent is bucketed to this many currency units before fingerprinting.
pub const RENT_BUCKET: i64 = 50;

const SUFFIXES: &[(&str, &str)] = &[
    ("street", "st"),
    ("avenue", "ave"),
    ("boulevard", "blvd"),
    ("road", "rd"),
    ("drive", "dr"),
    ("lane", "ln"),
    ("court", "ct"),
    ("place", "pl"),
    ("terrace", "ter"),
    ("parkway", "pkwy"),
    ("highway", "hwy"),
    ("square", "sq"),
    ("apartment", "apt"),
    ("suite", "ste"),
    ("unit", "apt"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
];

/// Lowercased, punctuation-free address with common suffixes abbreviated.
pub fn address_key(address: &str) -> String {
    address
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(|word| {
            SUFFIXES
                .iter()
                .find(|(long, _)| *long == word)
                .map(|(_, short)| *short)
                .unwrap_or(word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn rent_bucket(rent: i64) -> i64 {
    rent.div_euclid(RENT_BUCKET) * RENT_BUCKET
}

/// sha256 over `address_key|rent bucket|bedrooms|bathrooms`, hex encoded.
pub fn fingerprint(listing: &NormalizedListing) -> String {
    let content = format!(
        "{}|{}|{}|{}",
        address_key(&listing.address),
        rent_bucket(listing.rent),
        listing.bedrooms,
        listing.bathrooms
    );
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fuzzy re-sighting heuristic, kept behind a trait so thresholds can evolve.
pub trait ResightingMatcher: Send + Sync {
    fn find_match(&self, fresh: &NormalizedListing, existing: &[IndexEntry]) -> Option<Uuid>;
}

#[derive(Debug, Clone, Copy)]
pub struct FuzzyAddressMatcher {
    pub address_threshold: f64,
    pub rent_tolerance: f64,
}

impl Default for FuzzyAddressMatcher {
    fn default() -> Self {
        Self {
            address_threshold: 0.9,
            rent_tolerance: 0.10,
        }
    }
}

impl FuzzyAddressMatcher {
    pub fn address_similarity(a: &str, b: &str) -> f64 {
        normalized_levenshtein(&address_key(a), &address_key(b))
    }

    fn rent_close(&self, fresh: i64, existing: i64) -> bool {
        if fresh <= 0 {
            return existing == fresh;
        }
        let diff = (fresh - existing).abs() as f64;
        diff <= fresh as f64 * self.rent_tolerance
    }
}

impl ResightingMatcher for FuzzyAddressMatcher {
    fn find_match(&self, fresh: &NormalizedListing, existing: &[IndexEntry]) -> Option<Uuid> {
        existing
            .iter()
            .filter(|entry| entry.bedrooms == fresh.bedrooms)
            .filter(|entry| self.rent_close(fresh.rent, entry.rent))
            .map(|entry| (entry, Self::address_similarity(&fresh.address, &entry.address)))
            .filter(|(_, score)| *score >= self.address_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(entry, _)| entry.listing_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSighting {
    pub fingerprint: String,
    pub listing: NormalizedListing,
}

/// Three disjoint outcomes for a normalized batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub new: Vec<NewSighting>,
    pub updates: Vec<Resighting>,
    pub duplicates: Vec<NormalizedListing>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupCounts {
    pub new: usize,
    pub updated: usize,
    pub duplicates: usize,
}

impl DedupOutcome {
    pub fn counts(&self) -> DedupCounts {
        DedupCounts {
            new: self.new.len(),
            updated: self.updates.len(),
            duplicates: self.duplicates.len(),
        }
    }
}

pub struct DedupEngine {
    matcher: Box<dyn ResightingMatcher>,
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self::new(Box::new(FuzzyAddressMatcher::default()))
    }
}

impl DedupEngine {
    pub fn new(matcher: Box<dyn ResightingMatcher>) -> Self {
        Self { matcher }
    }

    /// Exact fingerprint match, then fuzzy match, then in-batch duplicate, else new.
    /// A stored listing is refreshed at most once per batch; later matches count as duplicates.
    pub fn classify(&self, batch: Vec<NormalizedListing>, index: &[IndexEntry]) -> DedupOutcome {
        let by_fingerprint: HashMap<&str, Uuid> = index
            .iter()
            .map(|entry| (entry.fingerprint.as_str(), entry.listing_id))
            .collect();

        let mut outcome = DedupOutcome::default();
        let mut seen_fingerprints: HashSet<String> = HashSet::new();
        let mut refreshed: HashSet<Uuid> = HashSet::new();

        for listing in batch {
            let fp = fingerprint(&listing);
            let matched = by_fingerprint
                .get(fp.as_str())
                .copied()
                .or_else(|| self.matcher.find_match(&listing, index));

            match matched {
                Some(listing_id) if refreshed.insert(listing_id) => {
                    seen_fingerprints.insert(fp);
                    outcome.updates.push(Resighting {
                        listing_id,
                        fresh: listing,
                    });
                }
                Some(_) => outcome.duplicates.push(listing),
                None if !seen_fingerprints.insert(fp.clone()) => outcome.duplicates.push(listing),
                None => outcome.new.push(NewSighting {
                    fingerprint: fp,
                    listing,
                }),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(address: &str, rent: i64, bedrooms: i32) -> NormalizedListing {
        NormalizedListing {
            source_url: None,
            address: address.into(),
            city: None,
            state: None,
            rent,
            bedrooms,
            bathrooms: 1.0,
            sqft: None,
            description: None,
            images: vec![],
            quality_score: 50,
        }
    }

    fn entry(address: &str, rent: i64, bedrooms: i32) -> IndexEntry {
        let l = listing(address, rent, bedrooms);
        IndexEntry {
            listing_id: Uuid::new_v4(),
            fingerprint: fingerprint(&l),
            address: address.into(),
            rent,
            bedrooms,
        }
    }

    #[test]
    fn address_key_abbreviates_and_strips_punctuation() {
        assert_eq!(address_key("123 North Main Street, Apt. 4"), "123 n main st apt 4");
        assert_eq!(address_key("123 N. Main St  apt 4"), "123 n main st apt 4");
    }

    #[test]
    fn fingerprint_buckets_rent() {
        let a = fingerprint(&listing("10 Pine Street", 1510, 2));
        let b = fingerprint(&listing("10 pine st", 1549, 2));
        let c = fingerprint(&listing("10 pine st", 1550, 2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn exact_match_is_an_update_not_a_duplicate() {
        let existing = entry("10 Pine St", 1500, 2);
        let engine = DedupEngine::default();
        let outcome = engine.classify(vec![listing("10 Pine Street", 1520, 2)], &[existing.clone()]);
        assert_eq!(outcome.updates.len(), 1);
        assert_eq!(outcome.updates[0].listing_id, existing.listing_id);
        assert!(outcome.new.is_empty());
        assert!(outcome.duplicates.is_empty());
    }

    #[test]
    fn fuzzy_match_requires_rent_and_bedrooms() {
        let existing = entry("1200 Walnut St Apt 3", 2000, 2);
        let engine = DedupEngine::default();

        let close = engine.classify(vec![listing("1200 Walnut St Apt 3B", 2150, 2)], &[existing.clone()]);
        assert_eq!(close.counts().updated, 1);

        let pricey = engine.classify(vec![listing("1200 Walnut St Apt 3B", 2300, 2)], &[existing.clone()]);
        assert_eq!(pricey.counts().new, 1);

        let bigger = engine.classify(vec![listing("1200 Walnut St Apt 3B", 2150, 3)], &[existing]);
        assert_eq!(bigger.counts().new, 1);
    }

    #[test]
    fn repeated_fingerprint_in_batch_is_a_duplicate() {
        let engine = DedupEngine::default();
        let outcome = engine.classify(
            vec![
                listing("5 Oak Ave", 1800, 1),
                listing("5 Oak Avenue", 1810, 1),
                listing("77 Elm Rd", 900, 0),
            ],
            &[],
        );
        assert_eq!(
            outcome.counts(),
            DedupCounts {
                new: 2,
                updated: 0,
                duplicates: 1
            }
        );
    }

    #[test]
    fn stored_listing_is_refreshed_once_per_batch() {
        let existing = entry("10 Pine St", 1500, 2);
        let engine = DedupEngine::default();
        let outcome = engine.classify(
            vec![listing("10 Pine St", 1500, 2), listing("10 Pine St", 1500, 2)],
            &[existing],
        );
        assert_eq!(outcome.counts().updated, 1);
        assert_eq!(outcome.counts().duplicates, 1);
    }

    struct NeverMatch;

    impl ResightingMatcher for NeverMatch {
        fn find_match(&self, _: &NormalizedListing, _: &[IndexEntry]) -> Option<Uuid> {
            None
        }
    }

    #[test]
    fn matcher_is_pluggable() {
        let existing = entry("1200 Walnut St Apt 3", 2000, 2);
        let engine = DedupEngine::new(Box::new(NeverMatch));
        let outcome = engine.classify(vec![listing("1200 Walnut St Apt 3B", 2150, 2)], &[existing]);
        assert_eq!(outcome.counts().new, 1);
    }
}
