//! Listing verification: fetch the source page and decide whether it is gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scout_core::Verdict;
use scout_storage::{classify_status, FetchError, HttpFetcher, StatusClass};
use scraper::Html;
use tracing::debug;

use crate::{ListingProbe, ProbeError};

pub const DEFAULT_GONE_PHRASES: &[&str] = &[
    "no longer available",
    "this listing has been removed",
    "listing not found",
    "page not found",
];

/// Turns a fetched status and body into a verdict. Not-found statuses and
/// known removal phrases in the visible text mean gone; any other answer
/// from the source counts as verified.
#[derive(Debug, Clone)]
pub struct GoneDetector {
    phrases: Vec<String>,
}

impl Default for GoneDetector {
    fn default() -> Self {
        Self::new(DEFAULT_GONE_PHRASES.iter().copied())
    }
}

impl GoneDetector {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn visible_text(body: &str) -> String {
        let document = Html::parse_document(body);
        document
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn classify(&self, status: reqwest::StatusCode, body: &str) -> Verdict {
        if classify_status(status) == StatusClass::NotFound {
            return Verdict::Gone;
        }
        let text = Self::visible_text(body);
        if self.phrases.iter().any(|phrase| text.contains(phrase.as_str())) {
            Verdict::Gone
        } else {
            Verdict::Verified
        }
    }
}

/// Fetches the listing's source page under a hard timeout.
#[derive(Debug, Clone)]
pub struct HttpListingProbe {
    fetcher: Arc<HttpFetcher>,
    detector: GoneDetector,
    timeout: Duration,
}

impl HttpListingProbe {
    pub fn new(fetcher: Arc<HttpFetcher>, detector: GoneDetector, timeout: Duration) -> Self {
        Self {
            fetcher,
            detector,
            timeout,
        }
    }
}

#[async_trait]
impl ListingProbe for HttpListingProbe {
    async fn probe(&self, source_url: &str) -> Result<Verdict, ProbeError> {
        let response = tokio::time::timeout(self.timeout, self.fetcher.get(source_url))
            .await
            .map_err(|_| ProbeError::Timeout)?
            .map_err(|err| match err {
                FetchError::Timeout(_) => ProbeError::Timeout,
                other => ProbeError::Network(other.to_string()),
            })?;
        debug!(url = source_url, status = %response.status, "verification fetch");
        Ok(self.detector.classify(response.status, &response.text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn not_found_statuses_mean_gone() {
        let detector = GoneDetector::default();
        assert_eq!(detector.classify(StatusCode::NOT_FOUND, ""), Verdict::Gone);
        assert_eq!(detector.classify(StatusCode::GONE, ""), Verdict::Gone);
    }

    #[test]
    fn removal_phrases_in_markup_mean_gone() {
        let detector = GoneDetector::default();
        let body = "<html><body><h1>Sorry!</h1><p>This listing is <b>no longer\n available</b>.</p></body></html>";
        assert_eq!(detector.classify(StatusCode::OK, body), Verdict::Gone);

        let live = "<html><body><h1>2BR in Fishtown</h1><p>Available now</p></body></html>";
        assert_eq!(detector.classify(StatusCode::OK, live), Verdict::Verified);
    }

    #[test]
    fn other_statuses_count_as_verified() {
        let detector = GoneDetector::default();
        assert_eq!(detector.classify(StatusCode::FORBIDDEN, ""), Verdict::Verified);
        assert_eq!(detector.classify(StatusCode::TOO_MANY_REQUESTS, ""), Verdict::Verified);
        assert_eq!(
            detector.classify(StatusCode::SERVICE_UNAVAILABLE, "<p>Try again later</p>"),
            Verdict::Verified
        );
        assert_eq!(
            detector.classify(StatusCode::FORBIDDEN, "<p>Page not found</p>"),
            Verdict::Gone
        );
    }

    #[test]
    fn custom_phrases_are_case_insensitive() {
        let detector = GoneDetector::new(["Rented Out"]);
        assert_eq!(
            detector.classify(StatusCode::OK, "<p>RENTED OUT last week</p>"),
            Verdict::Gone
        );
    }
}
