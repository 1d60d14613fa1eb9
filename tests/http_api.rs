//! HTTP contract tests for the query endpoints.
//!
//! The engine is built but not connected; feed frames are pushed straight
//! into it with `handle_text`, the resulting commands are treated as written,
//! and the router is driven with `oneshot`.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use book_mirror::{
    api::{create_router, AppState},
    catalog::{CatalogEntry, MarketCatalog},
    config::{FeedConfig, QueryConfig},
    feed::{FeedCommand, SyncEngine},
    query::QueryService,
    store::ReplicaStore,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::{sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tower::ServiceExt;

const SNAPSHOT: &str =
    r#"{"kind":"book","v":[{"m":1,"b":[{"b":true,"p":100,"a":2},{"b":false,"p":101,"a":3}]}]}"#;

struct Harness {
    router: Router,
    engine: Arc<SyncEngine>,
    commands: mpsc::Receiver<FeedCommand>,
}

fn harness() -> Harness {
    let catalog = MarketCatalog::new(vec![CatalogEntry::new("BTC", "USD", 1)]);
    let store = Arc::new(ReplicaStore::from_catalog(&catalog));
    let (engine, commands) = SyncEngine::new(FeedConfig::new("ws://unused"), store.clone());
    let queries = Arc::new(QueryService::new(
        QueryConfig::default(),
        store,
        engine.command_sender(),
    ));

    let router = create_router(AppState {
        queries,
        engine: engine.clone(),
        started_at: Utc::now(),
    });

    Harness {
        router,
        engine,
        commands,
    }
}

fn feed(engine: &SyncEngine, frame: &str) -> Vec<FeedCommand> {
    let commands = engine.handle_text(frame, Instant::now());
    for cmd in &commands {
        engine.command_sent(*cmd);
    }
    commands
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn book_lifecycle_from_request_to_delta() {
    let mut h = harness();

    let (status, body) = get(&h.router, "/book/BTC/USD").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "error": "Subscribing... please retry" }));
    assert_eq!(h.commands.try_recv().unwrap(), FeedCommand::Request(1));

    let upstream = h.engine.handle_text(SNAPSHOT, Instant::now());
    assert_eq!(upstream, vec![FeedCommand::Subscribe(1)]);
    let (_, body) = get(&h.router, "/book/BTC/USD").await;
    assert_eq!(body, json!({ "error": "Subscribing... please retry" }));
    h.engine.command_sent(FeedCommand::Subscribe(1));

    let (status, body) = get(&h.router, "/book/BTC/USD").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "BuyOrders": [{ "Index": 0, "Amount": 2, "Price": 100 }],
            "SellOrders": [{ "Index": 0, "Amount": 3, "Price": 101 }],
        })
    );

    feed(
        &h.engine,
        r#"{"kind":"bookdelta","v":[{"m":1,"b":true,"p":100,"a":0}]}"#,
    );

    let (_, body) = get(&h.router, "/book/BTC/USD").await;
    assert_eq!(body["BuyOrders"], json!([]));
    assert_eq!(body["SellOrders"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn subscribe_endpoint_requests_once_then_throttles() {
    let mut h = harness();

    let (status, body) = get(&h.router, "/subscribe/BTC/USD").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": 1 }));

    let (_, body) = get(&h.router, "/subscribe/BTC/USD").await;
    assert_eq!(body, json!({ "error": "Subscribing... please retry" }));

    assert_eq!(h.commands.try_recv().unwrap(), FeedCommand::Request(1));
    assert!(h.commands.try_recv().is_err());

    feed(&h.engine, SNAPSHOT);
    let (_, body) = get(&h.router, "/subscribe/BTC/USD").await;
    assert_eq!(body, json!({ "success": 1 }));
}

#[tokio::test]
async fn unknown_pairs_are_reported_without_side_effects() {
    let mut h = harness();

    let (status, body) = get(&h.router, "/book/X/Y").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "market X-Y not found" }));

    let (status, body) = get(&h.router, "/subscribe/DOGE/USD").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "market DOGE-USD not found" }));

    assert!(h.commands.try_recv().is_err());
    let store = h.engine.store();
    assert_eq!(store.market("BTC-USD").unwrap().lock().last_request_at, None);
}

#[tokio::test]
async fn health_reports_engine_and_store_state() {
    let h = harness();
    feed(&h.engine, SNAPSHOT);

    let (status, body) = get(&h.router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connection"], "closed");
    assert_eq!(body["markets"], 1);
    assert_eq!(body["subscribed_markets"], 1);
    assert_eq!(body["engine"]["snapshots_applied"], 1);
    assert_eq!(body["queries"]["not_found"], 0);
}
