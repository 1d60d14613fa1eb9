//! Replica Store - the in-memory mirror of every catalogued order book.
//!
//! The market table is built once from the catalog and never grows or shrinks;
//! only the replicas inside it are mutated. Each replica sits behind its own
//! mutex so the feed engine and concurrent HTTP queries serialize per market
//! rather than on one global lock.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tracing::warn;

use crate::catalog::{MarketCatalog, MarketId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn from_is_bid(is_bid: bool) -> Self {
        if is_bid {
            Side::Bid
        } else {
            Side::Ask
        }
    }
}

/// One (price, size) change on one side of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelUpdate {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// One side of a book: price -> size, unordered. Sizes stored are always > 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ladder {
    levels: HashMap<Decimal, Decimal>,
}

impl Ladder {
    /// Zero removes the level, anything else upserts it.
    pub fn apply(&mut self, price: Decimal, size: Decimal) {
        if size.is_zero() {
            self.levels.remove(&price);
        } else {
            self.levels.insert(price, size);
        }
    }

    pub fn get(&self, price: &Decimal) -> Option<Decimal> {
        self.levels.get(price).copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// (price, size) pairs, best bid first.
    pub fn descending(&self) -> Vec<(Decimal, Decimal)> {
        let mut levels: Vec<_> = self.levels.iter().map(|(p, s)| (*p, *s)).collect();
        levels.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        levels
    }

    /// (price, size) pairs, best ask first.
    pub fn ascending(&self) -> Vec<(Decimal, Decimal)> {
        let mut levels: Vec<_> = self.levels.iter().map(|(p, s)| (*p, *s)).collect();
        levels.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        levels
    }
}

/// Order-book state of a single market.
#[derive(Debug)]
pub struct MarketReplica {
    pub id: MarketId,
    pub pair: String,
    pub bids: Ladder,
    pub asks: Ladder,
    /// Set only once a snapshot has been applied and a subscribe sent upstream.
    pub subscribed: bool,
    /// Last client interest in this market; `None` if never (or since the last unsubscribe).
    pub last_request_at: Option<Instant>,
    /// Last time a snapshot was requested upstream.
    pub last_snapshot_request_at: Option<Instant>,
}

impl MarketReplica {
    pub fn new(id: MarketId, pair: impl Into<String>) -> Self {
        Self {
            id,
            pair: pair.into(),
            bids: Ladder::default(),
            asks: Ladder::default(),
            subscribed: false,
            last_request_at: None,
            last_snapshot_request_at: None,
        }
    }

    fn ladder_mut(&mut self, side: Side) -> &mut Ladder {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    /// Replace both ladders wholesale and mark the market subscribed.
    pub fn load_snapshot(&mut self, levels: &[LevelUpdate]) {
        self.replace_ladders(levels);
        self.mark_subscribed();
    }

    /// Replace both ladders wholesale. The subscription flag is untouched.
    pub fn replace_ladders(&mut self, levels: &[LevelUpdate]) {
        self.bids.clear();
        self.asks.clear();
        for level in levels {
            self.apply(level);
        }
    }

    pub fn mark_subscribed(&mut self) {
        self.subscribed = true;
    }

    /// Holds snapshot levels whose upstream subscribe has not gone out yet.
    pub fn is_pending(&self) -> bool {
        !self.subscribed && !(self.bids.is_empty() && self.asks.is_empty())
    }

    pub fn apply(&mut self, update: &LevelUpdate) {
        self.ladder_mut(update.side).apply(update.price, update.size);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_request_at = Some(now);
    }

    /// True when nobody has asked about this market for longer than `idle_timeout`.
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        match self.last_request_at {
            Some(at) => now.saturating_duration_since(at) > idle_timeout,
            None => true,
        }
    }

    /// Drop the replica back to the unsubscribed, empty state.
    pub fn unsubscribe(&mut self) {
        self.subscribed = false;
        self.bids.clear();
        self.asks.clear();
        self.last_request_at = None;
    }

    /// Forget book contents after a lost connection; client interest is kept.
    pub fn reset_for_resync(&mut self) {
        self.subscribed = false;
        self.bids.clear();
        self.asks.clear();
    }
}

/// The full replica table plus the global last-delta clock.
#[derive(Debug)]
pub struct ReplicaStore {
    markets: HashMap<String, Mutex<MarketReplica>>,
    pairs_by_id: HashMap<MarketId, String>,
    /// Reference instant for the last-delta clock.
    epoch: Instant,
    /// Nanoseconds after `epoch` at which the last delta arrived.
    last_delta_ns: AtomicU64,
}

impl ReplicaStore {
    /// Build one empty, unsubscribed replica per catalog entry. The feed
    /// clock starts at construction time.
    pub fn from_catalog(catalog: &MarketCatalog) -> Self {
        Self::from_catalog_at(catalog, Instant::now())
    }

    pub fn from_catalog_at(catalog: &MarketCatalog, epoch: Instant) -> Self {
        let mut markets = HashMap::with_capacity(catalog.len());
        let mut pairs_by_id = HashMap::with_capacity(catalog.len());

        for entry in catalog.entries() {
            let pair = entry.pair_key();
            if pairs_by_id.contains_key(&entry.id) {
                warn!(market_id = entry.id, pair = %pair, "Duplicate market id in catalog, keeping first");
                continue;
            }
            if markets.contains_key(&pair) {
                warn!(market_id = entry.id, pair = %pair, "Duplicate pair in catalog, keeping first");
                continue;
            }
            pairs_by_id.insert(entry.id, pair.clone());
            markets.insert(pair.clone(), Mutex::new(MarketReplica::new(entry.id, pair)));
        }

        Self {
            markets,
            pairs_by_id,
            epoch,
            last_delta_ns: AtomicU64::new(0),
        }
    }

    pub fn market(&self, pair: &str) -> Option<&Mutex<MarketReplica>> {
        self.markets.get(pair)
    }

    pub fn market_by_id(&self, id: MarketId) -> Option<&Mutex<MarketReplica>> {
        self.pairs_by_id
            .get(&id)
            .and_then(|pair| self.markets.get(pair))
    }

    pub fn pair_for(&self, id: MarketId) -> Option<&str> {
        self.pairs_by_id.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn subscribed_count(&self) -> usize {
        self.markets
            .values()
            .filter(|m| m.lock().subscribed)
            .count()
    }

    /// Stamp the global last-delta clock. Never moves backwards.
    pub fn record_delta(&self, now: Instant) {
        let ns = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.last_delta_ns.fetch_max(ns, Ordering::AcqRel);
    }

    /// Time since any delta was received (or since startup if none yet).
    pub fn since_last_delta(&self, now: Instant) -> Duration {
        let last = self.epoch + Duration::from_nanos(self.last_delta_ns.load(Ordering::Acquire));
        now.saturating_duration_since(last)
    }

    /// Reset every subscribed or pending replica after the connection is lost,
    /// returning the ids that were reset.
    pub fn drop_subscriptions(&self) -> Vec<MarketId> {
        let mut dropped: Vec<MarketId> = self
            .markets
            .values()
            .filter_map(|market| {
                let mut replica = market.lock();
                if !replica.subscribed && !replica.is_pending() {
                    return None;
                }
                replica.reset_for_resync();
                Some(replica.id)
            })
            .collect();
        dropped.sort_unstable();
        dropped
    }
}
