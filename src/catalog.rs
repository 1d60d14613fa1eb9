//! Static market catalog: exchange market id <-> "COIN-BASE" pair key.
//!
//! Loaded once at startup, either from an HTTP endpoint or from a local JSON
//! file. The document is an array of `{ base, quote, id }` objects; the
//! camelCase spellings (`baseSymbol`, `quoteSymbol`, `marketId`) are accepted
//! too, and ids may be encoded as numbers or numeric strings.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info};

/// Exchange-assigned numeric market id.
pub type MarketId = u64;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog document is not a JSON array of markets: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("catalog entry {index} has an empty symbol")]
    EmptySymbol { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    #[serde(alias = "baseSymbol", alias = "base_symbol")]
    pub base: String,
    #[serde(alias = "quoteSymbol", alias = "quote_symbol")]
    pub quote: String,
    #[serde(alias = "marketId", alias = "market_id", deserialize_with = "de_market_id")]
    pub id: MarketId,
}

impl CatalogEntry {
    pub fn new(base: impl Into<String>, quote: impl Into<String>, id: MarketId) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
            id,
        }
    }

    /// External-facing pair name, e.g. `BTC-USD`.
    pub fn pair_key(&self) -> String {
        pair_key(&self.base, &self.quote)
    }
}

/// Builds the pair key the HTTP surface and the replica store agree on.
pub fn pair_key(coin: &str, base_coin: &str) -> String {
    format!("{}-{}", coin, base_coin)
}

fn de_market_id<'de, D>(deserializer: D) -> Result<MarketId, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid market id {n}"))),
        Value::String(s) => s.trim().parse::<MarketId>().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "invalid market id {other}"
        ))),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarketCatalog {
    entries: Vec<CatalogEntry>,
}

impl MarketCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Parse a catalog document.
    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(text)?;
        if let Some(index) = entries
            .iter()
            .position(|e| e.base.trim().is_empty() || e.quote.trim().is_empty())
        {
            return Err(CatalogError::EmptySymbol { index });
        }
        Ok(Self { entries })
    }

    /// Fetch the catalog from an HTTP endpoint. Failures are not retried here.
    pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Self> {
        debug!(url, "Fetching market catalog");
        let body = client
            .get(url)
            .send()
            .await
            .context("catalog request failed")?
            .error_for_status()
            .context("catalog endpoint returned an error status")?
            .text()
            .await
            .context("failed to read catalog body")?;

        Ok(Self::from_json(&body)?)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where the catalog comes from at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    Url(String),
    File(PathBuf),
}

impl CatalogSource {
    pub async fn load(&self, client: &reqwest::Client) -> Result<MarketCatalog> {
        let catalog = match self {
            CatalogSource::Url(url) => MarketCatalog::fetch(client, url).await?,
            CatalogSource::File(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read catalog file {}", path.display()))?;
                MarketCatalog::from_json(&text)?
            }
        };

        info!(markets = catalog.len(), source = ?self, "Market catalog loaded");
        Ok(catalog)
    }
}
