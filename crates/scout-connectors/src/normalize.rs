use async_trait::async_trait;
use scout_core::{NormalizedListing, RawListing};

use crate::{Normalizer, ValidationError};

const MIN_RENT: f64 = 100.0;
const MAX_RENT: f64 = 100_000.0;
const MAX_BEDROOMS: f64 = 20.0;
const MAX_BATHROOMS: f64 = 20.0;

/// Field validation plus a completeness-based quality score.
#[derive(Debug, Clone, Default)]
pub struct BasicNormalizer;

impl BasicNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn quality_score(listing: &NormalizedListing) -> u8 {
        let mut score: u32 = 40;
        if listing.sqft.is_some() {
            score += 10;
        }
        if listing.source_url.is_some() {
            score += 10;
        }
        if listing.city.is_some() && listing.state.is_some() {
            score += 5;
        }
        match listing.description.as_deref().map(str::len).unwrap_or(0) {
            0 => {}
            1..=99 => score += 10,
            _ => score += 20,
        }
        match listing.images.len() {
            0 => {}
            1..=4 => score += 10,
            _ => score += 15,
        }
        score.min(100) as u8
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}

#[async_trait]
impl Normalizer for BasicNormalizer {
    async fn normalize(&self, raw: &RawListing) -> Result<NormalizedListing, ValidationError> {
        let address = non_empty(&raw.address).ok_or(ValidationError::MissingField("address"))?;
        let rent = raw.rent.ok_or(ValidationError::MissingField("rent"))?;
        let rent = in_range("rent", rent, MIN_RENT, MAX_RENT)?;
        let bedrooms = in_range("bedrooms", raw.bedrooms.unwrap_or(0.0), 0.0, MAX_BEDROOMS)?;
        let bathrooms = in_range("bathrooms", raw.bathrooms.unwrap_or(1.0), 0.0, MAX_BATHROOMS)?;
        let sqft = match raw.sqft {
            Some(sqft) => Some(in_range("sqft", sqft, 1.0, 100_000.0)?.round() as i32),
            None => None,
        };

        let images: Vec<String> = raw
            .images
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect();

        let mut listing = NormalizedListing {
            source_url: non_empty(&raw.source_url),
            address: address.split_whitespace().collect::<Vec<_>>().join(" "),
            city: non_empty(&raw.city),
            state: non_empty(&raw.state),
            rent: rent.round() as i64,
            bedrooms: bedrooms.floor() as i32,
            bathrooms,
            sqft,
            description: non_empty(&raw.description),
            images,
            quality_score: 0,
        };
        listing.quality_score = Self::quality_score(&listing);
        Ok(listing)
    }
}
