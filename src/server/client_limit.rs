//! Per-client admission limit for the HTTP boundary.
//!
//! Epistemic foundation:
//! - K_i: One fixed one-minute window per client address
//! - B_i: Proxy headers carry the real client address (might be absent → "unknown")
//! - I^R: Ceiling is configurable; 0 disables the layer

use crate::client::{RateLimitWindow, WindowKind};
use crate::server::AppState;
use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Expired client windows are swept once per this many checks.
const PRUNE_EVERY: u64 = 1024;

static LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAdmission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the window resets
    pub reset: i64,
}

impl ClientAdmission {
    fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(LIMIT_HEADER.clone(), HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER.clone(), HeaderValue::from(self.remaining));
        headers.insert(RESET_HEADER.clone(), HeaderValue::from(self.reset));
    }
}

/// Fixed-window request counter keyed by client address.
#[derive(Debug)]
pub struct ClientLimiter {
    limit: u32,
    windows: DashMap<String, RateLimitWindow>,
    checks: AtomicU64,
}

impl ClientLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Charge one request for `client` if its window has room.
    pub fn check(&self, client: &str, now: DateTime<Utc>) -> ClientAdmission {
        let checks = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        if checks % PRUNE_EVERY == 0 {
            self.prune(now);
        }

        let mut window = self
            .windows
            .entry(client.to_string())
            .or_insert_with(|| RateLimitWindow::new(WindowKind::Minute, Some(self.limit), now));
        let allowed = window.try_charge(now);

        ClientAdmission {
            allowed,
            limit: self.limit,
            remaining: window.remaining_at(now).unwrap_or(self.limit),
            reset: window.resets_at().timestamp(),
        }
    }

    /// Drop windows that have expired by `now`.
    fn prune(&self, now: DateTime<Utc>) {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired(now));
        debug!(
            removed = before.saturating_sub(self.windows.len()),
            "Pruned client windows"
        );
    }
}

/// Client address from proxy headers, falling back to "unknown".
pub fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header("x-real-ip"))
        .or_else(|| header("cf-connecting-ip"))
        .unwrap_or("unknown")
        .to_string()
}

/// Middleware enforcing the per-client limit.
pub async fn limit_clients(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.clients.is_enabled() {
        return next.run(request).await;
    }

    let client = client_ip(request.headers());
    let admission = state.clients.check(&client, Utc::now());

    if !admission.allowed {
        warn!(client = %client, limit = admission.limit, "Client rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Rate limit exceeded",
                "limit": admission.limit,
                "remaining": admission.remaining,
                "reset": admission.reset,
            })),
        )
            .into_response();
        admission.apply_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    admission.apply_headers(response.headers_mut());
    response
}
