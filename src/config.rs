//! Environment-driven configuration.

use anyhow::{bail, Result};
use std::{path::PathBuf, time::Duration};

use crate::catalog::CatalogSource;

pub const DEFAULT_PORT: u16 = 3000;

/// Settings for the upstream feed connection and the subscription policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// Streaming endpoint of the exchange feed
    pub ws_url: String,
    /// Fixed delay before reconnecting after a close
    pub reconnect_delay: Duration,
    /// Period of transport-level keepalive pings
    pub ping_interval: Duration,
    /// A market nobody asked about for this long is unsubscribed on its next delta
    pub market_idle_timeout: Duration,
    /// Minimum spacing between snapshot requests for one market, shared with the query path
    pub snapshot_request_throttle: Duration,
}

impl FeedConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            reconnect_delay: Duration::from_secs(2),
            ping_interval: Duration::from_secs(30),
            market_idle_timeout: Duration::from_secs(15 * 60),
            snapshot_request_throttle: Duration::from_secs(60),
        }
    }
}

/// Settings for the query path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Minimum spacing between snapshot requests for one market
    pub snapshot_request_throttle: Duration,
    /// Global delta silence after which the feed is presumed dead
    pub feed_stale_after: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            snapshot_request_throttle: Duration::from_secs(60),
            feed_stale_after: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub feed: FeedConfig,
    pub query: QueryConfig,
    pub catalog: CatalogSource,
    pub port: u16,
}

impl MirrorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key -> value lookup (the process environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let Some(ws_url) = get("FEED_WS_URL") else {
            bail!("FEED_WS_URL must be set");
        };

        let catalog = match (get("CATALOG_PATH"), get("CATALOG_URL")) {
            (Some(path), _) => CatalogSource::File(PathBuf::from(path)),
            (None, Some(url)) => CatalogSource::Url(url),
            (None, None) => bail!("one of CATALOG_PATH or CATALOG_URL must be set"),
        };

        let mut feed = FeedConfig::new(ws_url);
        if let Some(ms) = get("FEED_RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
            feed.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = get("FEED_PING_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
            if ms > 0 {
                feed.ping_interval = Duration::from_millis(ms);
            }
        }
        if let Some(secs) = get("MARKET_IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            feed.market_idle_timeout = Duration::from_secs(secs);
        }

        let mut query = QueryConfig::default();
        if let Some(secs) = get("FEED_STALE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            query.feed_stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = get("SNAPSHOT_REQUEST_THROTTLE_SECS").and_then(|v| v.parse().ok()) {
            query.snapshot_request_throttle = Duration::from_secs(secs);
            feed.snapshot_request_throttle = Duration::from_secs(secs);
        }

        let port = get("PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Ok(Self {
            feed,
            query,
            catalog,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_endpoints_are_set() {
        let cfg = MirrorConfig::from_lookup(lookup(&[
            ("FEED_WS_URL", "wss://feed.example/ws"),
            ("CATALOG_URL", "https://api.example/markets"),
        ]))
        .unwrap();

        assert_eq!(cfg.feed, FeedConfig::new("wss://feed.example/ws"));
        assert_eq!(cfg.query, QueryConfig::default());
        assert_eq!(
            cfg.catalog,
            CatalogSource::Url("https://api.example/markets".to_string())
        );
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.feed.reconnect_delay, Duration::from_secs(2));
        assert_eq!(cfg.feed.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_parsed_and_garbage_ignored() {
        let cfg = MirrorConfig::from_lookup(lookup(&[
            ("FEED_WS_URL", "ws://localhost:9000"),
            ("CATALOG_URL", "https://api.example/markets"),
            ("CATALOG_PATH", "/tmp/markets.json"),
            ("PORT", "8080"),
            ("FEED_RECONNECT_DELAY_MS", "250"),
            ("FEED_PING_INTERVAL_MS", "0"),
            ("MARKET_IDLE_TIMEOUT_SECS", "not-a-number"),
            ("SNAPSHOT_REQUEST_THROTTLE_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(cfg.catalog, CatalogSource::File("/tmp/markets.json".into()));
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.feed.reconnect_delay, Duration::from_millis(250));
        assert_eq!(cfg.feed.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.feed.market_idle_timeout, Duration::from_secs(900));
        assert_eq!(cfg.query.snapshot_request_throttle, Duration::from_secs(5));
        assert_eq!(cfg.feed.snapshot_request_throttle, Duration::from_secs(5));
    }

    #[test]
    fn missing_endpoints_are_errors() {
        let err = MirrorConfig::from_lookup(lookup(&[("CATALOG_URL", "x")])).unwrap_err();
        assert!(err.to_string().contains("FEED_WS_URL"));

        let err = MirrorConfig::from_lookup(lookup(&[("FEED_WS_URL", "ws://x")])).unwrap_err();
        assert!(err.to_string().contains("CATALOG"));
    }
}
