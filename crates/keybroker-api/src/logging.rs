//! Per-request logging.

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    info!(%method, %path, "request started");

    let resp = next.run(req).await;

    let status = resp.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    if resp.status().is_server_error() {
        warn!(%method, %path, status, latency_ms, "request completed");
    } else {
        info!(%method, %path, status, latency_ms, "request completed");
    }
    resp
}
