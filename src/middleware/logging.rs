//! Request logging middleware.
//!
//! Logs every query with method, path, status code, and latency. Needs the
//! router to be served with `into_make_service_with_connect_info::<SocketAddr>()`.

use axum::{body::Body, extract::ConnectInfo, http::Request, middleware::Next, response::Response};
use std::{net::SocketAddr, time::Instant};
use tracing::{debug, info, warn, Instrument};

pub async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Health probes are polled constantly
    if path == "/health" {
        return next.run(request).await;
    }

    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        client_ip = %addr.ip(),
    );

    let start = Instant::now();
    let response = next.run(request).instrument(span).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if response.status().is_server_error() {
        warn!(method = %method, path = %path, status, latency_ms, client_ip = %addr.ip(), "Request failed (5xx)");
    } else if response.status().is_client_error() {
        info!(method = %method, path = %path, status, latency_ms, client_ip = %addr.ip(), "Request rejected (4xx)");
    } else {
        debug!(method = %method, path = %path, status, latency_ms, "Request completed");
    }

    response
}
