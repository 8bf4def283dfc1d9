use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;

/// Axum middleware that logs one line per request with the matched route,
/// status and latency. Route templates are logged instead of raw paths so
/// site ids and signatures stay out of the logs.
pub async fn access_log_middleware(
    matched_path: Option<MatchedPath>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = matched_path
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "/unknown".to_owned());

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;
    if response.status().is_server_error() {
        tracing::warn!(%method, %path, status, latency_ms, "request failed");
    } else {
        tracing::info!(%method, %path, status, latency_ms, "request");
    }

    response
}
