use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scout_core::{MarketLocator, RawListing};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ConnectorError, ScraperConnector};

/// On-disk capture of one market's scrape: `<root>/<city-state slug>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub listings: Vec<RawListing>,
}

/// Serves recorded listings from JSON files instead of a live source.
#[derive(Debug, Clone)]
pub struct FixtureConnector {
    source_id: String,
    root: PathBuf,
}

impl FixtureConnector {
    pub fn new(source_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fixture_path(&self, locator: &MarketLocator) -> PathBuf {
        self.root.join(format!("{}.json", locator.slug()))
    }
}

#[async_trait]
impl ScraperConnector for FixtureConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        locator: &MarketLocator,
        max_items: u32,
    ) -> Result<Vec<RawListing>, ConnectorError> {
        let path = self.fixture_path(locator);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ConnectorError::Rejected(format!(
                    "no fixture for {locator} at {}",
                    path.display()
                )));
            }
            Err(err) => {
                return Err(ConnectorError::Network(format!(
                    "reading {}: {err}",
                    path.display()
                )));
            }
        };
        let mut file: FixtureFile = serde_json::from_str(&text).map_err(|err| {
            ConnectorError::Rejected(format!("parsing {}: {err}", path.display()))
        })?;
        file.listings.truncate(max_items as usize);
        debug!(path = %path.display(), count = file.listings.len(), "loaded fixture listings");
        Ok(file.listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fixture_listings_are_truncated_to_max_items() {
        let dir = tempdir().unwrap();
        let body = serde_json::json!({
            "listings": [
                {"address": "1 A St", "rent": 1000.0},
                {"address": "2 B St", "rent": 1100.0},
                {"address": "3 C St", "rent": 1200.0}
            ]
        });
        std::fs::write(dir.path().join("bryn-mawr-pa.json"), body.to_string()).unwrap();

        let connector = FixtureConnector::new("apartments_com", dir.path());
        let listings = connector
            .fetch(&MarketLocator::new("Bryn Mawr", "PA"), 2)
            .await
            .unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].address.as_deref(), Some("1 A St"));
    }

    #[tokio::test]
    async fn missing_fixture_is_rejected_not_retried() {
        let dir = tempdir().unwrap();
        let connector = FixtureConnector::new("apartments_com", dir.path());
        let err = connector
            .fetch(&MarketLocator::new("Nowhere", "ZZ"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Rejected(_)));
    }
}
