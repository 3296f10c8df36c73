//! Request logging middleware
//! Mission: One structured line per request with method, path, status, and latency

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

/// Logs at INFO for successes, WARN for 4xx/5xx. Health probes are skipped
/// to keep the noise down.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path.ends_with("/health") {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;

    if status >= 400 {
        warn!(%method, %path, status, latency_ms, "request");
    } else {
        info!(%method, %path, status, latency_ms, "request");
    }

    response
}
