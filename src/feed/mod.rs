//! Upstream streaming feed: wire format and the synchronization engine.

pub mod engine;
pub mod wire;

pub use engine::{ConnectionState, EngineMetrics, EngineMetricsSummary, SyncEngine};
pub use wire::FeedCommand;
