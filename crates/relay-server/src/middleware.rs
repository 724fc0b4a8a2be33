//! HTTP middleware.
//!
//! Layered around every route, outermost first: security headers, the
//! per-IP rate limiter, then the request logger.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Headers added to every response.
pub const SECURITY_HEADERS: [(&str, &str); 6] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("content-security-policy", "default-src 'self'"),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains",
    ),
];

/// Log each request with its status and latency.
pub async fn log_request(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    let status = response.status();
    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        latency = ?elapsed,
        "Request"
    );
    metrics::record_request(status.as_u16(), elapsed);
    response
}

/// Reject requests from peers over their limit with `429 Too Many Requests`.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    match state.limiter.check(addr.ip()) {
        Ok(()) => next.run(req).await,
        Err(e) => {
            debug!(peer = %addr.ip(), "Rate limit exceeded");
            metrics::record_rate_limited();

            let mut response = (StatusCode::TOO_MANY_REQUESTS, e.to_string()).into_response();
            if let Some(wait) = e.retry_after {
                let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            response
        }
    }
}

/// Add [`SECURITY_HEADERS`] to the response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}
