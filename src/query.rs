//! Query Service: the read/trigger side of the replica store.
//!
//! Handlers never touch the network. When a market is not yet mirrored they
//! queue a snapshot `request` for the engine (at most one per throttle window
//! per market) and tell the caller to come back later.

use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Serialize, Serializer};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::feed::FeedCommand;
use crate::store::{MarketReplica, ReplicaStore};

/// Result of a query against one market.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome<T> {
    /// The market is mirrored; here is the answer.
    Ready(T),
    /// Not mirrored yet; a snapshot request was just queued.
    Requested,
    /// Not mirrored yet; a request is already in flight.
    NotYetSubscribed,
    /// Not mirrored yet and the request throttle suppressed a new request.
    Throttled,
    /// Pair absent from the catalog.
    NotFound(String),
}

/// No delta has been seen on the feed for too long. Fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no book delta received for {}s", .silent_for.as_secs())]
pub struct FeedStale {
    pub silent_for: Duration,
}

/// The one place global feed liveness is judged.
pub fn check_feed_health(
    store: &ReplicaStore,
    now: Instant,
    max_silence: Duration,
) -> Result<(), FeedStale> {
    let silent_for = store.since_last_delta(now);
    if silent_for > max_silence {
        return Err(FeedStale { silent_for });
    }
    Ok(())
}

/// One row of a book side as served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookEntry {
    #[serde(rename = "Index")]
    pub index: usize,
    #[serde(rename = "Amount", serialize_with = "serialize_number")]
    pub amount: Decimal,
    #[serde(rename = "Price", serialize_with = "serialize_number")]
    pub price: Decimal,
}

/// Whole values go out as JSON integers, everything else as a float.
fn serialize_number<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let value = value.normalize();
    if value.scale() == 0 {
        if let Some(n) = value.to_i64() {
            return serializer.serialize_i64(n);
        }
    }
    match value.to_f64() {
        Some(f) => serializer.serialize_f64(f),
        None => Err(serde::ser::Error::custom(format!(
            "{value} is not representable as a JSON number"
        ))),
    }
}

/// Sorted point-in-time view of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookView {
    /// Bids, best (highest) first
    #[serde(rename = "BuyOrders")]
    pub buy_orders: Vec<BookEntry>,
    /// Asks, best (lowest) first
    #[serde(rename = "SellOrders")]
    pub sell_orders: Vec<BookEntry>,
}

impl BookView {
    pub fn from_replica(replica: &MarketReplica) -> Self {
        Self {
            buy_orders: index_levels(replica.bids.descending()),
            sell_orders: index_levels(replica.asks.ascending()),
        }
    }
}

fn index_levels(levels: Vec<(Decimal, Decimal)>) -> Vec<BookEntry> {
    levels
        .into_iter()
        .enumerate()
        .map(|(index, (price, amount))| BookEntry {
            index,
            amount,
            price,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotRequest {
    Queued,
    /// Throttled, or the command queue is full
    Suppressed,
}

pub struct QueryService {
    config: QueryConfig,
    store: Arc<ReplicaStore>,
    commands: mpsc::Sender<FeedCommand>,
    metrics: Arc<QueryMetrics>,
}

impl QueryService {
    pub fn new(
        config: QueryConfig,
        store: Arc<ReplicaStore>,
        commands: mpsc::Sender<FeedCommand>,
    ) -> Self {
        Self {
            config,
            store,
            commands,
            metrics: Arc::new(QueryMetrics::default()),
        }
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<QueryMetrics> {
        &self.metrics
    }

    pub fn ensure_subscribed(&self, pair: &str) -> QueryOutcome<()> {
        self.ensure_subscribed_at(pair, Instant::now())
    }

    pub fn ensure_subscribed_at(&self, pair: &str, now: Instant) -> QueryOutcome<()> {
        let Some(market) = self.store.market(pair) else {
            return self.not_found(pair);
        };

        let mut replica = market.lock();
        replica.touch(now);
        if replica.subscribed {
            return QueryOutcome::Ready(());
        }
        match self.request_snapshot(&mut replica, now) {
            SnapshotRequest::Queued => QueryOutcome::Requested,
            SnapshotRequest::Suppressed => QueryOutcome::Throttled,
        }
    }

    /// Fails with [`FeedStale`] before anything else when the feed has gone silent.
    pub fn get_book(&self, pair: &str) -> Result<QueryOutcome<BookView>, FeedStale> {
        self.get_book_at(pair, Instant::now())
    }

    pub fn get_book_at(
        &self,
        pair: &str,
        now: Instant,
    ) -> Result<QueryOutcome<BookView>, FeedStale> {
        check_feed_health(&self.store, now, self.config.feed_stale_after)?;

        let Some(market) = self.store.market(pair) else {
            return Ok(self.not_found(pair));
        };

        let mut replica = market.lock();
        replica.touch(now);
        if !replica.subscribed {
            return Ok(match self.request_snapshot(&mut replica, now) {
                SnapshotRequest::Queued => QueryOutcome::Requested,
                SnapshotRequest::Suppressed => QueryOutcome::NotYetSubscribed,
            });
        }

        Ok(QueryOutcome::Ready(BookView::from_replica(&replica)))
    }

    /// Queue a snapshot request unless one went out within the throttle window.
    fn request_snapshot(&self, replica: &mut MarketReplica, now: Instant) -> SnapshotRequest {
        if let Some(last) = replica.last_snapshot_request_at {
            if now.saturating_duration_since(last) <= self.config.snapshot_request_throttle {
                self.metrics.throttled.fetch_add(1, Ordering::Relaxed);
                return SnapshotRequest::Suppressed;
            }
        }

        match self.commands.try_send(FeedCommand::Request(replica.id)) {
            Ok(()) => {
                replica.last_snapshot_request_at = Some(now);
                self.metrics
                    .snapshot_requests
                    .fetch_add(1, Ordering::Relaxed);
                debug!(market_id = replica.id, pair = %replica.pair, "Queued snapshot request");
                SnapshotRequest::Queued
            }
            Err(e) => {
                warn!(market_id = replica.id, error = %e, "Could not queue snapshot request");
                SnapshotRequest::Suppressed
            }
        }
    }

    fn not_found<T>(&self, pair: &str) -> QueryOutcome<T> {
        debug!(pair, "Query for market not in catalog");
        self.metrics.not_found.fetch_add(1, Ordering::Relaxed);
        QueryOutcome::NotFound(pair.to_string())
    }
}

/// Counters for the query path
#[derive(Debug, Default)]
pub struct QueryMetrics {
    pub snapshot_requests: AtomicU64,
    pub throttled: AtomicU64,
    pub not_found: AtomicU64,
}

impl QueryMetrics {
    pub fn summary(&self) -> QueryMetricsSummary {
        QueryMetricsSummary {
            snapshot_requests: self.snapshot_requests.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetricsSummary {
    pub snapshot_requests: u64,
    pub throttled: u64,
    pub not_found: u64,
}
