//! Synchronization Engine.
//!
//! Owns one upstream connection at a time and keeps the [`ReplicaStore`] in
//! step with it:
//! - `book` frames replace a market's ladders; the market counts as subscribed
//!   once the upstream `subscribe` has been written
//! - `bookdelta` frames upsert/remove levels, then idle markets are unsubscribed
//! - transport pings are answered, our own pings go out on a fixed period
//! - a closed connection is retried after a fixed delay, forever
//!
//! Each connection attempt runs in a fresh `connect_and_stream` call that owns
//! its own read/write halves, so nothing outside it can race a send against a
//! reconnect. Commands from the query path arrive over an mpsc channel that
//! outlives individual connections.

use anyhow::{anyhow, Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{
    sync::mpsc,
    time::{interval_at, sleep, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use super::wire::{self, FeedCommand, Inbound};
use crate::catalog::MarketId;
use crate::config::FeedConfig;
use crate::store::{LevelUpdate, ReplicaStore};

const COMMAND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

pub struct SyncEngine {
    config: FeedConfig,
    store: Arc<ReplicaStore>,
    cmd_tx: mpsc::Sender<FeedCommand>,
    state: RwLock<ConnectionState>,
    metrics: Arc<EngineMetrics>,
}

impl SyncEngine {
    /// Build the engine without starting it. The returned receiver must be
    /// handed to [`SyncEngine::run`].
    pub fn new(
        config: FeedConfig,
        store: Arc<ReplicaStore>,
    ) -> (Arc<Self>, mpsc::Receiver<FeedCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let engine = Arc::new(Self {
            config,
            store,
            cmd_tx,
            state: RwLock::new(ConnectionState::Closed),
            metrics: Arc::new(EngineMetrics::default()),
        });
        (engine, cmd_rx)
    }

    /// Build the engine and spawn its connection loop.
    pub fn spawn(config: FeedConfig, store: Arc<ReplicaStore>) -> Arc<Self> {
        let (engine, cmd_rx) = Self::new(config, store);
        tokio::spawn(Arc::clone(&engine).run(cmd_rx));
        engine
    }

    /// Handle for queueing commands to whichever connection is current.
    pub fn command_sender(&self) -> mpsc::Sender<FeedCommand> {
        self.cmd_tx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Connecting -> Open -> Closed -> (delay) -> Connecting, without end.
    pub async fn run(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<FeedCommand>) {
        let mut resync: Vec<MarketId> = Vec::new();

        loop {
            self.set_state(ConnectionState::Connecting);
            info!(url = %self.config.ws_url, "Connecting to market feed");

            match self.connect_and_stream(&mut cmd_rx, &mut resync).await {
                Ok(()) => info!("Market feed closed by server"),
                Err(e) => warn!(error = %e, "Market feed connection lost"),
            }

            self.set_state(ConnectionState::Closed);

            let dropped = self.store.drop_subscriptions();
            if !dropped.is_empty() {
                warn!(
                    count = dropped.len(),
                    "Dropped subscriptions after disconnect, will resync"
                );
            }
            resync.extend(dropped);
            resync.sort_unstable();
            resync.dedup();

            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            debug!(
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Scheduling market feed reconnect"
            );
            sleep(self.config.reconnect_delay).await;
        }
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<FeedCommand>,
        resync: &mut Vec<MarketId>,
    ) -> Result<()> {
        let (ws_stream, resp) = connect_async(self.config.ws_url.as_str())
            .await
            .context("Failed to connect to market feed")?;

        info!(status = %resp.status(), "Connected to market feed");
        self.set_state(ConnectionState::Open);
        self.metrics.connections.fetch_add(1, Ordering::Relaxed);

        let (mut write, mut read) = ws_stream.split();

        for cmd in self.resync_commands(std::mem::take(resync), Instant::now()) {
            self.send_command(&mut write, cmd).await?;
        }

        let period = self.config.ping_interval;
        let mut ping = interval_at(tokio::time::Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await
                        .context("Failed to send keepalive ping")?;
                    trace!("Sent keepalive ping");
                }

                Some(cmd) = cmd_rx.recv() => {
                    self.send_command(&mut write, cmd).await?;
                }

                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow!("market feed stream ended"));
                    };

                    match msg {
                        Ok(Message::Text(text)) => {
                            for cmd in self.handle_text(&text, Instant::now()) {
                                self.send_command(&mut write, cmd).await?;
                            }
                        }
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                for cmd in self.handle_text(&text, Instant::now()) {
                                    self.send_command(&mut write, cmd).await?;
                                }
                            }
                            Err(e) => debug!(error = %e, "Ignoring non-UTF-8 binary frame"),
                        },
                        Ok(Message::Ping(payload)) => {
                            write.send(Message::Pong(payload)).await
                                .context("Failed to answer ping")?;
                        }
                        Ok(Message::Pong(_)) => {
                            trace!("Keepalive pong received");
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "Market feed close frame received");
                            return Ok(());
                        }
                        Ok(Message::Frame(_)) => {}
                        Err(e) => {
                            return Err(anyhow!("market feed transport error: {e}"));
                        }
                    }
                }
            }
        }
    }

    async fn send_command<S>(&self, write: &mut S, cmd: FeedCommand) -> Result<()>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let text = cmd.encode().context("Failed to encode feed command")?;
        write
            .send(Message::Text(text))
            .await
            .with_context(|| format!("Failed to send {cmd:?}"))?;
        self.metrics.commands_sent.fetch_add(1, Ordering::Relaxed);
        debug!(?cmd, "Sent feed command");
        self.command_sent(cmd);
        Ok(())
    }

    /// Record that `cmd` reached the upstream connection. A written
    /// `subscribe` is what makes a snapshotted market subscribed.
    pub fn command_sent(&self, cmd: FeedCommand) {
        let FeedCommand::Subscribe(id) = cmd else {
            return;
        };
        if let Some(market) = self.store.market_by_id(id) {
            market.lock().mark_subscribed();
        }
    }

    /// Snapshot requests for markets dropped by a previous disconnect that
    /// clients still care about. Markets with a request inside the throttle
    /// window are left to that request.
    fn resync_commands(&self, ids: Vec<MarketId>, now: Instant) -> Vec<FeedCommand> {
        ids.into_iter()
            .filter_map(|id| {
                let mut replica = self.store.market_by_id(id)?.lock();
                if replica.subscribed
                    || replica.is_idle(now, self.config.market_idle_timeout)
                {
                    return None;
                }
                if let Some(last) = replica.last_snapshot_request_at {
                    if now.saturating_duration_since(last)
                        <= self.config.snapshot_request_throttle
                    {
                        return None;
                    }
                }
                replica.last_snapshot_request_at = Some(now);
                Some(FeedCommand::Request(id))
            })
            .collect()
    }

    /// Apply one inbound data frame to the store. Returns the commands that
    /// must be sent upstream as a consequence, in order; each one is passed to
    /// [`SyncEngine::command_sent`] once written.
    pub fn handle_text(&self, text: &str, now: Instant) -> Vec<FeedCommand> {
        self.metrics
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let mut commands = Vec::new();
        match wire::decode(text) {
            Ok(Inbound::Book(books)) => self.apply_books(&books, &mut commands),
            Ok(Inbound::BookDelta(entries)) => self.apply_deltas(&entries, now, &mut commands),
            Ok(Inbound::Other(kind)) => trace!(kind = %kind, "Ignoring informational frame"),
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable frame");
                self.metrics.malformed_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
        commands
    }

    fn apply_books(&self, books: &[Value], commands: &mut Vec<FeedCommand>) {
        for entry in books {
            let book = match wire::parse_book(entry) {
                Ok(book) => book,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed snapshot market");
                    self.metrics
                        .malformed_entries
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let Some(market) = self.store.market_by_id(book.market_id) else {
                warn!(
                    market_id = book.market_id,
                    "Snapshot for market not in catalog, skipping"
                );
                self.metrics.unknown_markets.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let levels = self.parse_levels(book.market_id, &book.levels);
            let mut replica = market.lock();
            replica.replace_ladders(&levels);
            commands.push(FeedCommand::Subscribe(book.market_id));

            self.metrics
                .snapshots_applied
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                market_id = book.market_id,
                pair = %replica.pair,
                bids = replica.bids.len(),
                asks = replica.asks.len(),
                "Applied book snapshot"
            );
        }
    }

    fn parse_levels(&self, market_id: MarketId, raw: &[Value]) -> Vec<LevelUpdate> {
        raw.iter()
            .filter_map(|entry| match wire::parse_level(entry) {
                Ok(level) => Some(level),
                Err(e) => {
                    warn!(market_id, error = %e, "Skipping malformed snapshot level");
                    self.metrics
                        .malformed_entries
                        .fetch_add(1, Ordering::Relaxed);
                    None
                }
            })
            .collect()
    }

    fn apply_deltas(&self, entries: &[Value], now: Instant, commands: &mut Vec<FeedCommand>) {
        for entry in entries {
            self.store.record_delta(now);

            let (market_id, update) = match wire::parse_delta(entry) {
                Ok(delta) => delta,
                Err(e) => {
                    warn!(
                        market_id = ?wire::delta_market_id(entry),
                        error = %e,
                        "Skipping malformed delta entry"
                    );
                    self.metrics
                        .malformed_entries
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let Some(market) = self.store.market_by_id(market_id) else {
                warn!(market_id, "Delta for market not in catalog, skipping");
                self.metrics.unknown_markets.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let mut replica = market.lock();
            if !replica.subscribed {
                debug!(market_id, "Delta for unsubscribed market, ignoring");
                self.metrics.deltas_ignored.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            replica.apply(&update);
            self.metrics.deltas_applied.fetch_add(1, Ordering::Relaxed);

            if replica.is_idle(now, self.config.market_idle_timeout) {
                replica.unsubscribe();
                commands.push(FeedCommand::Unsubscribe(market_id));
                self.metrics.unsubscribes.fetch_add(1, Ordering::Relaxed);
                info!(market_id, pair = %replica.pair, "Market idle, unsubscribing");
            }
        }
    }
}

/// Counters for the engine
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub connections: AtomicU64,
    pub reconnects: AtomicU64,
    pub messages_received: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub malformed_entries: AtomicU64,
    pub unknown_markets: AtomicU64,
    pub snapshots_applied: AtomicU64,
    pub deltas_applied: AtomicU64,
    pub deltas_ignored: AtomicU64,
    pub unsubscribes: AtomicU64,
    pub commands_sent: AtomicU64,
}

impl EngineMetrics {
    pub fn summary(&self) -> EngineMetricsSummary {
        EngineMetricsSummary {
            connections: self.connections.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            malformed_entries: self.malformed_entries.load(Ordering::Relaxed),
            unknown_markets: self.unknown_markets.load(Ordering::Relaxed),
            snapshots_applied: self.snapshots_applied.load(Ordering::Relaxed),
            deltas_applied: self.deltas_applied.load(Ordering::Relaxed),
            deltas_ignored: self.deltas_ignored.load(Ordering::Relaxed),
            unsubscribes: self.unsubscribes.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetricsSummary {
    pub connections: u64,
    pub reconnects: u64,
    pub messages_received: u64,
    pub malformed_frames: u64,
    pub malformed_entries: u64,
    pub unknown_markets: u64,
    pub snapshots_applied: u64,
    pub deltas_applied: u64,
    pub deltas_ignored: u64,
    pub unsubscribes: u64,
    pub commands_sent: u64,
}
