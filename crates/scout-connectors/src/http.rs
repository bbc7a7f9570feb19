use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use scout_core::{MarketLocator, RawListing};
use scout_storage::{FetchError, HttpFetcher, StatusClass};
use serde::Deserialize;
use tracing::debug;

use crate::{ConnectorError, ScraperConnector};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingsPayload {
    Wrapped { listings: Vec<RawListing> },
    Bare(Vec<RawListing>),
}

impl ListingsPayload {
    fn into_listings(self) -> Vec<RawListing> {
        match self {
            ListingsPayload::Wrapped { listings } | ListingsPayload::Bare(listings) => listings,
        }
    }
}

/// Pulls listings from a JSON endpoint:
/// `GET {base}/listings?city=..&state=..&limit=..`.
#[derive(Debug, Clone)]
pub struct HttpJsonConnector {
    source_id: String,
    base_url: String,
    fetcher: Arc<HttpFetcher>,
}

impl HttpJsonConnector {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            fetcher,
        }
    }

    pub fn listings_url(&self, locator: &MarketLocator, max_items: u32) -> Result<Url, ConnectorError> {
        let base = format!("{}/listings", self.base_url.trim_end_matches('/'));
        let limit = max_items.to_string();
        Url::parse_with_params(
            &base,
            &[
                ("city", locator.city.as_str()),
                ("state", locator.state.as_str()),
                ("limit", limit.as_str()),
            ],
        )
        .map_err(|err| ConnectorError::Rejected(format!("invalid connector url {base}: {err}")))
    }
}

#[async_trait]
impl ScraperConnector for HttpJsonConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        locator: &MarketLocator,
        max_items: u32,
    ) -> Result<Vec<RawListing>, ConnectorError> {
        let url = self.listings_url(locator, max_items)?;
        let response = self.fetcher.get(url.as_str()).await.map_err(|err| match err {
            FetchError::Timeout(_) => ConnectorError::Timeout,
            other => ConnectorError::Network(other.to_string()),
        })?;

        match response.class() {
            StatusClass::Success => {}
            StatusClass::RateLimited => {
                return Err(ConnectorError::RateLimited(response.final_url));
            }
            StatusClass::ServerError => {
                return Err(ConnectorError::Server(format!(
                    "status {} from {}",
                    response.status, response.final_url
                )));
            }
            StatusClass::NotFound | StatusClass::ClientError => {
                return Err(ConnectorError::Rejected(format!(
                    "status {} from {}",
                    response.status, response.final_url
                )));
            }
        }

        let payload: ListingsPayload = serde_json::from_slice(&response.body)
            .map_err(|err| ConnectorError::Rejected(format!("decoding listings: {err}")))?;
        let mut listings = payload.into_listings();
        listings.truncate(max_items as usize);
        debug!(source_id = %self.source_id, %locator, count = listings.len(), "fetched listings");
        Ok(listings)
    }
}
