//! Request logging middleware.
//!
//! Logs every RPC request with method, path, status code, and latency.
//! Health and metrics probes are skipped to keep the log readable.

use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn, Span};

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" || path == "/ready" || path == "/metrics" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let span = tracing::info_span!(
        "rpc_request",
        method = %method,
        path = %path,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let _guard = span.enter();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    Span::current().record("status", status);
    Span::current().record("latency_ms", latency.as_millis() as u64);
    metrics::histogram!("rpc_request_seconds", latency.as_secs_f64(), "path" => path.clone());

    if status >= 500 {
        warn!(method = %method, path = %path, status, "request failed");
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms = latency.as_millis() as u64,
            "request"
        );
    }
    response
}
