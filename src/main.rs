//! Book Mirror - local order-book replica of an exchange feed.
//!
//! Startup order: environment, logging, configuration, market catalog,
//! replica store, feed engine, HTTP server. The process runs until the feed
//! health check declares the feed dead.

use anyhow::{Context, Result};
use axum::middleware;
use chrono::Utc;
use dotenv::dotenv;
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use book_mirror::{
    api::{self, AppState},
    config::MirrorConfig,
    feed::SyncEngine,
    middleware::request_logging,
    query::QueryService,
    store::ReplicaStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("Book mirror starting");

    let config = MirrorConfig::from_env().context("Invalid configuration")?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let catalog = config
        .catalog
        .load(&http_client)
        .await
        .context("Failed to load market catalog")?;

    let store = Arc::new(ReplicaStore::from_catalog(&catalog));
    info!(markets = store.len(), "Replica store initialized");

    let engine = SyncEngine::spawn(config.feed.clone(), store.clone());
    let queries = Arc::new(QueryService::new(
        config.query.clone(),
        store,
        engine.command_sender(),
    ));

    let app_state = AppState {
        queries,
        engine,
        started_at: Utc::now(),
    };

    let app = api::create_router(app_state)
        .layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("API server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "book_mirror=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory for
    // runs started elsewhere with --manifest-path.
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
