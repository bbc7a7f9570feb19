//! External collaborators of the engine: scraper connectors, the listing
//! normalizer and the verification probe.

use async_trait::async_trait;
use scout_core::{MarketLocator, NormalizedListing, RawListing, Verdict};
use thiserror::Error;

pub mod fixture;
pub mod http;
pub mod normalize;
pub mod probe;

pub use fixture::FixtureConnector;
pub use http::HttpJsonConnector;
pub use normalize::BasicNormalizer;
pub use probe::{GoneDetector, HttpListingProbe};

pub const CRATE_NAME: &str = "scout-connectors";

/// Failure classes the orchestrator's retry discipline distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    #[error("connector timed out")]
    Timeout,
    #[error("rate limited by source: {0}")]
    RateLimited(String),
    #[error("source server error: {0}")]
    Server(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("verification fetch timed out")]
    Timeout,
    #[error("verification fetch failed: {0}")]
    Network(String),
}

#[async_trait]
pub trait ScraperConnector: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(
        &self,
        locator: &MarketLocator,
        max_items: u32,
    ) -> Result<Vec<RawListing>, ConnectorError>;
}

#[async_trait]
pub trait Normalizer: Send + Sync {
    async fn normalize(&self, raw: &RawListing) -> Result<NormalizedListing, ValidationError>;
}

/// Checks whether a listing's source page is still live.
#[async_trait]
pub trait ListingProbe: Send + Sync {
    async fn probe(&self, source_url: &str) -> Result<Verdict, ProbeError>;
}
