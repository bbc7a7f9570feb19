use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scout_core::NewMarket;
use scout_storage::{MarketRegistry, StoreError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSeedFile {
    pub markets: Vec<NewMarket>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

pub async fn load_market_seeds(path: &Path) -> Result<Vec<NewMarket>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: MarketSeedFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.markets)
}

/// Creates each seed that is not registered yet; existing markets are left untouched.
pub async fn seed_markets(
    registry: &dyn MarketRegistry,
    seeds: Vec<NewMarket>,
    now: DateTime<Utc>,
) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for seed in seeds {
        let id = seed.id.clone();
        match registry.create_market(seed.into_market(now)).await {
            Ok(_) => report.created.push(id),
            Err(StoreError::Conflict(_)) => {
                debug!(market_id = %id, "market already registered");
                report.skipped.push(id);
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!("seeding market {id}")));
            }
        }
    }
    info!(
        created = report.created.len(),
        skipped = report.skipped.len(),
        "market seeding finished"
    );
    Ok(report)
}
